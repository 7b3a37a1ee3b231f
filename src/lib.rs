//! wa-relay library
//!
//! Session supervision for a messaging-network account, command routing for
//! inbound chat messages, and a local HTTP control bridge.

pub mod cli;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod logging;
pub mod media;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;
