use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Keeps only `[A-Za-z0-9_-]`. Applying it twice is the same as applying it once.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Sandbox identifier that is always safe to embed in a container name or
/// a process argument.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SandboxId(String);

impl SandboxId {
    /// Sanitizes `raw`; `None` when nothing usable is left.
    pub fn parse(raw: &str) -> Option<Self> {
        let clean = sanitize(raw);
        if clean.is_empty() {
            None
        } else {
            Some(Self(clean))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SandboxId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SandboxId::parse(&value).ok_or_else(|| format!("invalid sandbox id '{value}'"))
    }
}

impl From<SandboxId> for String {
    fn from(id: SandboxId) -> Self {
        id.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerAddress(IpAddr);

impl ContainerAddress {
    pub fn new(ip: IpAddr) -> Self {
        Self(ip)
    }

    pub fn ip(&self) -> IpAddr {
        self.0
    }
}

impl From<Ipv4Addr> for ContainerAddress {
    fn from(ip: Ipv4Addr) -> Self {
        Self(IpAddr::V4(ip))
    }
}

impl FromStr for ContainerAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<IpAddr>().map(Self)
    }
}

impl fmt::Display for ContainerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for ContainerAddress {
    type Error = std::net::AddrParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContainerAddress> for String {
    fn from(addr: ContainerAddress) -> Self {
        addr.to_string()
    }
}

/// Where one inbound request or connection is sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyTarget {
    pub sandbox: SandboxId,
    pub address: ContainerAddress,
    pub port: u16,
    pub forward_path: String,
}

impl ProxyTarget {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address.ip(), self.port)
    }

    pub fn http_uri(&self) -> String {
        format!("http://{}{}", self.socket_addr(), self.forward_path)
    }

    pub fn ws_uri(&self) -> String {
        format!("ws://{}{}", self.socket_addr(), self.forward_path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunState {
    Running,
    Stopped,
    Frozen,
    Error,
    Unknown(String),
}

impl RunState {
    pub fn as_str(&self) -> &str {
        match self {
            RunState::Running => "RUNNING",
            RunState::Stopped => "STOPPED",
            RunState::Frozen => "FROZEN",
            RunState::Error => "ERROR",
            RunState::Unknown(raw) => raw,
        }
    }
}

impl From<String> for RunState {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => RunState::Running,
            "STOPPED" => RunState::Stopped,
            "FROZEN" => RunState::Frozen,
            "ERROR" => RunState::Error,
            _ => RunState::Unknown(raw.trim().to_string()),
        }
    }
}

impl From<RunState> for String {
    fn from(state: RunState) -> Self {
        state.as_str().to_string()
    }
}

/// One row of the platform's container listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerListing {
    pub name: String,
    pub run_state: RunState,
    pub address: Option<ContainerAddress>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub cache_connected: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub sandboxes: Vec<ContainerListing>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalMode {
    Host,
    Sandbox,
}

impl TerminalMode {
    /// `host` (or its alias `os`) selects the host shell; anything else,
    /// including no value, is `sandbox`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()) {
            Some(mode) if mode == "host" || mode == "os" => TerminalMode::Host,
            _ => TerminalMode::Sandbox,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalMode::Host => "host",
            TerminalMode::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for TerminalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured frames a terminal client may send instead of input bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Dimensions are range-checked by the receiver, not at parse time.
    Resize { cols: u32, rows: u32 },
    Ping,
}
