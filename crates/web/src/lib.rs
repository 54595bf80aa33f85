//! vmdeck web console
//!
//! Cookie-authenticated Proxmox VE dashboard with a websocket console relay
//! for noVNC.

pub mod auth;
pub mod config;
pub mod relay;
pub mod server;
pub mod static_files;

pub use config::Config;
pub use relay::{ConsoleRelay, RelayError, RelayTarget};
pub use server::WebServer;
