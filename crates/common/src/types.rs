//! Core types shared between the API client and the web console.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric QEMU guest id, unique within the cluster.
pub type VmId = u32;

/// A hypervisor host within the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// A QEMU guest as listed on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSummary {
    pub node: String,
    pub vmid: VmId,
    pub name: String,
    pub status: String,
    pub tags: Vec<String>,
}

/// Current runtime status of a single guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatus {
    pub vmid: VmId,
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Power operation requested from the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
}

impl PowerAction {
    /// Name of the `status/<command>` endpoint on the hypervisor.
    pub fn api_command(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Restart => "reboot",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Restart => "restart",
        };
        f.write_str(s)
    }
}

impl FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(PowerAction::Start),
            "stop" => Ok(PowerAction::Stop),
            "restart" | "reboot" => Ok(PowerAction::Restart),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// Single-use console credential issued by the hypervisor.
#[derive(Clone, PartialEq, Eq)]
pub struct ConsoleTicket {
    pub port: u16,
    pub ticket: String,
}

// Tickets are bearer credentials; keep them out of logs.
impl fmt::Debug for ConsoleTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleTicket")
            .field("port", &self.port)
            .field("ticket", &"<redacted>")
            .finish()
    }
}

/// Split a raw Proxmox tag string into individual tags.
///
/// Proxmox stores tags separated by `;`, older tooling used `,`.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}
