//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommands:
//! - `start` (default) -- run the relay
//! - `logout` -- delete stored session credentials
//! - `status` -- query a running instance's session status
//! - `config-path` -- print the resolved config file path
//! - `version` -- print version info

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config::{self, RelayConfig, DEFAULT_HOST, DEFAULT_PORT};
use crate::credentials::{CredentialStore, FileCredentialBackend};
use crate::session::PairingArtifact;

/// WhatsApp relay bot: AI replies, file forwarding, and a local control bridge.
#[derive(Parser, Debug)]
#[command(
    name = "wa-relay",
    version = env!("CARGO_PKG_VERSION"),
    about = "wa-relay: a WhatsApp session relay with AI replies and a local HTTP bridge"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay (default when no subcommand is given).
    Start,

    /// Delete the stored credentials so the next start pairs from scratch.
    Logout {
        /// Profile to clear (default: from config).
        #[arg(long)]
        profile: Option<String>,
    },

    /// Query a running instance for its session status.
    Status {
        /// Port of the running instance (default: from config or 8000).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host of the running instance.
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,
    },

    /// Print the resolved config file path.
    ConfigPath,

    /// Print version information.
    Version,
}

/// Run the `config-path` subcommand.
pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("wa-relay {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

/// Run the `logout` subcommand.
pub async fn handle_logout(profile: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    let profile = profile.unwrap_or_else(|| cfg.profile.clone());
    if clear_session(&cfg, &profile).await? {
        println!("Removed credentials for profile '{}'.", profile);
        println!("The next `wa-relay start` will show a new pairing code.");
    } else {
        println!("No stored credentials for profile '{}'.", profile);
    }
    Ok(())
}

/// Delete the credential blob and any pairing artifact. Returns whether
/// credentials existed.
pub async fn clear_session(
    cfg: &RelayConfig,
    profile: &str,
) -> Result<bool, Box<dyn std::error::Error>> {
    let backend = FileCredentialBackend::new(cfg.credentials_dir())?;
    let store = CredentialStore::new(Arc::new(backend));
    let removed = store.clear(profile).await?;
    PairingArtifact::new(&cfg.pairing_path).retire().await;
    Ok(removed)
}

/// Run the `status` subcommand -- fetch `/api/status` from a running instance.
pub async fn handle_status(
    host: &str,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let port = resolve_port(port);
    let url = format!("http://{}:{}/api/status", host, port);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let response = client.get(&url).send().await.map_err(|e| {
        format!(
            "could not connect to wa-relay at {}:{} ({}). Is it running? Start it with: wa-relay start",
            host, port, e
        )
    })?;

    if !response.status().is_success() {
        return Err(format!(
            "status endpoint returned HTTP {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        )
        .into());
    }

    let body: Value = response.json().await?;
    for line in format_status(&body, host, port) {
        println!("{}", line);
    }
    Ok(())
}

fn format_status(body: &Value, host: &str, port: u16) -> Vec<String> {
    let session = body.get("session").cloned().unwrap_or(Value::Null);
    let mut lines = vec![
        "wa-relay status".to_string(),
        "===============".to_string(),
        format!("  Address:    {}:{}", host, port),
    ];
    if let Some(state) = session.get("state").and_then(|v| v.as_str()) {
        lines.push(format!("  Session:    {}", state));
    }
    if let Some(connected) = body.get("connected").and_then(|v| v.as_bool()) {
        lines.push(format!(
            "  Connected:  {}",
            if connected { "yes" } else { "no" }
        ));
    }
    if let Some(connects) = session.get("connects").and_then(|v| v.as_u64()) {
        lines.push(format!("  Connects:   {}", connects));
    }
    if let Some(code) = session.get("lastCloseCode").and_then(|v| v.as_u64()) {
        lines.push(format!("  Last close: {}", code));
    }
    if let Some(attempt) = session.get("reconnectAttempt").and_then(|v| v.as_u64()) {
        if attempt > 0 {
            lines.push(format!("  Retrying:   attempt {}", attempt));
        }
    }
    lines
}

fn resolve_port(explicit: Option<u16>) -> u16 {
    if let Some(p) = explicit {
        return p;
    }
    config::load_config()
        .map(|cfg| cfg.server.port)
        .unwrap_or(DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_cli_no_args_defaults_to_none() {
        let cli = Cli::try_parse_from(["wa-relay"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_start_subcommand() {
        let cli = Cli::try_parse_from(["wa-relay", "start"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Start)));
    }

    #[test]
    fn test_cli_status_defaults() {
        let cli = Cli::try_parse_from(["wa-relay", "status"]).unwrap();
        match cli.command {
            Some(Command::Status { port, ref host }) => {
                assert_eq!(port, None);
                assert_eq!(host, "127.0.0.1");
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_status_with_port() {
        let cli = Cli::try_parse_from(["wa-relay", "status", "-p", "9000"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Status { port: Some(9000), .. })
        ));
    }

    #[test]
    fn test_cli_logout_and_config_path() {
        let cli = Cli::try_parse_from(["wa-relay", "logout", "--profile", "shop"]).unwrap();
        match cli.command {
            Some(Command::Logout { ref profile }) => assert_eq!(profile.as_deref(), Some("shop")),
            other => panic!("Expected Logout, got {:?}", other),
        }
        let cli = Cli::try_parse_from(["wa-relay", "config-path"]).unwrap();
        assert!(matches!(cli.command, Some(Command::ConfigPath)));
    }

    #[test]
    fn test_cli_unknown_subcommand_fails() {
        assert!(Cli::try_parse_from(["wa-relay", "frobnicate"]).is_err());
    }

    #[tokio::test]
    async fn test_clear_session_removes_blob_and_artifact() {
        let dir = TempDir::new().unwrap();
        let cfg = RelayConfig {
            state_dir: dir.path().to_path_buf(),
            pairing_path: dir.path().join("qr.svg"),
            ..RelayConfig::default()
        };
        let backend = FileCredentialBackend::new(cfg.credentials_dir()).unwrap();
        let store = CredentialStore::new(Arc::new(backend));
        store.save("default", b"blob").await.unwrap();
        std::fs::write(&cfg.pairing_path, b"stale").unwrap();

        assert!(clear_session(&cfg, "default").await.unwrap());
        assert_eq!(store.load("default").await.unwrap(), None);
        assert!(!cfg.pairing_path.exists());
        assert!(!clear_session(&cfg, "default").await.unwrap());
    }

    #[test]
    fn test_format_status() {
        let body = json!({
            "ok": true,
            "connected": false,
            "session": {
                "state": "closed_retryable",
                "handleId": null,
                "lastCloseCode": 428,
                "reconnectAttempt": 2,
                "connects": 3,
            }
        });
        let lines = format_status(&body, "127.0.0.1", 8000);
        assert!(lines.contains(&"  Session:    closed_retryable".to_string()));
        assert!(lines.contains(&"  Connected:  no".to_string()));
        assert!(lines.contains(&"  Last close: 428".to_string()));
        assert!(lines.contains(&"  Retrying:   attempt 2".to_string()));
    }
}
