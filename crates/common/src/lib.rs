//! vmdeck common library
//!
//! Shared types, errors and the Proxmox VE management API client.

pub mod error;
pub mod pve;
pub mod types;

pub use error::{Error, Result};
pub use pve::{ConsoleEndpoint, Hypervisor, PveClient, PveConfig, PveCredentials};
pub use types::*;

/// vmdeck version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
