//! Remote files sent as document attachments.
//!
//! - [`HttpFileFetcher`]: hardened HTTP/HTTPS fetch with a size limit
//! - File name and MIME type inference for the outgoing document

pub mod fetch;

pub use fetch::{
    validate_url, FetchConfig, FetchError, FetchedFile, FileFetch, HttpFileFetcher,
    DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_MAX_SIZE, MAX_FETCH_TIMEOUT_MS, MAX_URL_LENGTH,
};

use bytes::Bytes;

use crate::transport::OutboundContent;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Extension appended to bare names for MIME types that map to several
/// extensions. Anything else takes the first extension `mime_guess` knows.
const PREFERRED_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("text/plain", "txt"),
    ("text/html", "html"),
    ("audio/mpeg", "mp3"),
    ("audio/mp4", "m4a"),
    ("video/mp4", "mp4"),
    ("video/quicktime", "mov"),
    ("video/mpeg", "mpeg"),
    ("application/msword", "doc"),
    ("image/tiff", "tiff"),
];

/// Extract the last path segment of a URL, falling back to "attachment".
pub fn filename_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(String::from))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "attachment".to_string())
}

/// MIME type for a file name's extension, if known.
pub fn mimetype_for_filename(filename: &str) -> Option<&'static str> {
    let ext = extension(filename)?.to_ascii_lowercase();
    mime_guess::from_ext(&ext).first_raw()
}

/// Preferred extension for a MIME type, if known. Parameters are ignored.
pub fn extension_for_mimetype(mimetype: &str) -> Option<&'static str> {
    let essence = mimetype.split(';').next()?.trim().to_ascii_lowercase();
    PREFERRED_EXTENSIONS
        .iter()
        .find(|(mime, _)| *mime == essence)
        .map(|(_, ext)| *ext)
        .or_else(|| {
            mime_guess::get_mime_extensions_str(&essence)
                .and_then(|exts| exts.first().copied())
        })
}

fn extension(filename: &str) -> Option<&str> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}

/// Name and MIME type for an outgoing document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMeta {
    pub file_name: String,
    pub mimetype: String,
}

/// Infer document metadata.
///
/// Explicit values win. Otherwise the name comes from the URL and the type
/// from the name's extension, then the response Content-Type, then
/// `application/octet-stream`. A name without an extension gets one from
/// the MIME type when it is known.
pub fn infer_document(
    url: &str,
    file_name: Option<&str>,
    mimetype: Option<&str>,
    content_type: Option<&str>,
) -> DocumentMeta {
    let mut file_name = file_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(String::from)
        .unwrap_or_else(|| filename_from_url(url));

    let mimetype = mimetype
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .or_else(|| mimetype_for_filename(&file_name).map(String::from))
        .or_else(|| {
            content_type
                .and_then(|ct| ct.split(';').next())
                .map(|ct| ct.trim().to_ascii_lowercase())
                .filter(|ct| !ct.is_empty())
        })
        .unwrap_or_else(|| OCTET_STREAM.to_string());

    if extension(&file_name).is_none() {
        if let Some(ext) = extension_for_mimetype(&mimetype) {
            file_name = format!("{file_name}.{ext}");
        }
    }

    DocumentMeta {
        file_name,
        mimetype,
    }
}

/// A fetched file ready to send as a document.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub bytes: Bytes,
    pub meta: DocumentMeta,
}

impl FetchedDocument {
    pub fn into_content(self) -> OutboundContent {
        OutboundContent::Document {
            bytes: self.bytes,
            file_name: self.meta.file_name,
            mimetype: self.meta.mimetype,
        }
    }
}

/// Fetch `url` and work out the document name and type.
pub async fn fetch_document(
    fetcher: &dyn FileFetch,
    url: &str,
    file_name: Option<&str>,
    mimetype: Option<&str>,
) -> Result<FetchedDocument, FetchError> {
    let file = fetcher.fetch(url).await?;
    let meta = infer_document(url, file_name, mimetype, file.content_type.as_deref());
    Ok(FetchedDocument {
        bytes: file.bytes,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_url() {
        assert_eq!(filename_from_url("https://x.test/files/y.mp4"), "y.mp4");
        assert_eq!(filename_from_url("https://x.test/a/b.pdf?dl=1#top"), "b.pdf");
        assert_eq!(filename_from_url("https://x.test/"), "attachment");
        assert_eq!(filename_from_url("not a url"), "attachment");
    }

    #[test]
    fn test_mimetype_lookup() {
        assert_eq!(mimetype_for_filename("REPORT.PDF"), Some("application/pdf"));
        assert_eq!(mimetype_for_filename("clip.mp4"), Some("video/mp4"));
        assert_eq!(mimetype_for_filename("archive.tar.unknown"), None);
        assert_eq!(mimetype_for_filename("noext"), None);
        assert_eq!(mimetype_for_filename(".hidden"), None);
        assert_eq!(extension_for_mimetype("image/jpeg; q=1"), Some("jpg"));
        assert_eq!(extension_for_mimetype("application/x-custom"), None);
    }

    #[test]
    fn test_mimetype_lookup_beyond_common_types() {
        assert_eq!(mimetype_for_filename("logo.SVG"), Some("image/svg+xml"));
        assert_eq!(mimetype_for_filename("novel.epub"), Some("application/epub+zip"));
        assert_eq!(extension_for_mimetype("application/epub+zip"), Some("epub"));
        assert_eq!(extension_for_mimetype("Video/QuickTime"), Some("mov"));

        let meta = infer_document("https://x.test/book", None, None, Some("application/epub+zip"));
        assert_eq!(meta.file_name, "book.epub");
    }

    #[test]
    fn test_infer_from_url() {
        let meta = infer_document("https://x.test/y.mp4", None, None, Some("text/plain"));
        assert_eq!(meta.file_name, "y.mp4");
        assert_eq!(meta.mimetype, "video/mp4");
    }

    #[test]
    fn test_infer_falls_back_to_content_type() {
        let meta = infer_document(
            "https://x.test/download",
            None,
            None,
            Some("application/pdf; charset=binary"),
        );
        assert_eq!(meta.file_name, "download.pdf");
        assert_eq!(meta.mimetype, "application/pdf");

        let meta = infer_document("https://x.test/", None, None, None);
        assert_eq!(meta.file_name, "attachment");
        assert_eq!(meta.mimetype, OCTET_STREAM);
    }

    #[test]
    fn test_infer_explicit_values_win() {
        let meta = infer_document(
            "https://x.test/y.mp4",
            Some("holiday.mov"),
            Some("video/quicktime"),
            Some("video/mp4"),
        );
        assert_eq!(meta.file_name, "holiday.mov");
        assert_eq!(meta.mimetype, "video/quicktime");

        let meta = infer_document("https://x.test/y.mp4", Some("  "), Some(""), None);
        assert_eq!(meta.file_name, "y.mp4");
        assert_eq!(meta.mimetype, "video/mp4");
    }
}
