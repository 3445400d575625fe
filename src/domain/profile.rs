//! Identity profile of the local SIP user

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::shared::UaError;

/// Transport protocol used on a SIP hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
        }
    }

    /// Lower-case form used in URI `transport=` parameters
    pub fn param(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Tls => "tls",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp | TransportProtocol::Tcp => 5060,
            TransportProtocol::Tls => 5061,
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransportProtocol {
    type Err = UaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportProtocol::Udp),
            "tcp" => Ok(TransportProtocol::Tcp),
            "tls" => Ok(TransportProtocol::Tls),
            other => Err(UaError::Config(format!("unsupported transport: {}", other))),
        }
    }
}

/// Who the agent is and where it talks from/to.
///
/// A profile is stable for one registration cycle. Reconfiguration replaces
/// it wholesale; the only field the agent rewrites itself is `local_ip`,
/// recomputed each time the network binding is (re)established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub username: String,
    pub password: String,
    pub local_ip: String,
    pub local_port: u16,
    pub transport: TransportProtocol,
    pub remote_ip: String,
    pub remote_port: u16,
    pub remote_transport: TransportProtocol,
}

impl IdentityProfile {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        remote_ip: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            local_ip: String::new(),
            local_port: TransportProtocol::Udp.default_port(),
            transport: TransportProtocol::Udp,
            remote_ip: remote_ip.into(),
            remote_port,
            remote_transport: TransportProtocol::Udp,
        }
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn with_transport(mut self, transport: TransportProtocol) -> Self {
        self.transport = transport;
        self.remote_transport = transport;
        self
    }

    /// `ip:port` of the local listening endpoint
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    /// `ip:port` of the registrar / outbound proxy
    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.remote_ip, self.remote_port)
    }

    /// Address of record, `sip:user@registrar`
    pub fn address_of_record(&self) -> String {
        format!("sip:{}@{}", self.username, self.remote_ip)
    }
}
