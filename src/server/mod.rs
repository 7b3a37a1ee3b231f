//! Server module
//!
//! The local control bridge: HTTP endpoints over the shared session handle.

pub mod http;
pub mod startup;

pub use http::{create_router, AppState, HttpConfig};
pub use startup::{await_shutdown_trigger, run_server_with_config, ServerConfig, ServerHandle};
