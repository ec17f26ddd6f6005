//! Control-plane data model: exposed services, port mappings, messages.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// DNS label shape: alphanumeric and hyphens, no leading/trailing hyphen,
/// at most 63 characters.
static SUBDOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("subdomain regex"));

/// Validation errors for control-plane values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("service name cannot be empty")]
    EmptyName,

    #[error("service namespace cannot be empty")]
    EmptyNamespace,

    #[error("subdomain {0:?} is not a valid DNS label")]
    InvalidSubdomain(String),

    #[error("target IP cannot be empty")]
    EmptyTargetIp,

    #[error("at least one port mapping is required")]
    NoPorts,

    #[error("port mapping {index}: port must be between 1 and 65535")]
    InvalidPort { index: usize },

    #[error("invalid service at index {index}: {source}")]
    InvalidService {
        index: usize,
        #[source]
        source: Box<ValidationError>,
    },
}

/// Transport protocol of a port mapping.
///
/// `TcpUdp` exposes the same port number over both transports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp+udp")]
    TcpUdp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::TcpUdp => "tcp+udp",
        }
    }

    /// Whether this mapping carries TCP traffic.
    pub fn includes_tcp(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::TcpUdp)
    }

    /// Whether this mapping carries UDP traffic.
    pub fn includes_udp(&self) -> bool {
        matches!(self, Protocol::Udp | Protocol::TcpUdp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a protocol token from an annotation.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("protocol must be 'tcp', 'udp', or 'tcp+udp', got {0:?}")]
pub struct ParseProtocolError(pub String);

impl FromStr for Protocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "tcp+udp" => Ok(Protocol::TcpUdp),
            other => Err(ParseProtocolError(other.to_string())),
        }
    }
}

/// A single port to expose: the external edge port and the port to dial on
/// the workload endpoint. A `target_port` of zero means "not resolved";
/// listeners fall back to the external port number.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub port: u16,
    #[serde(default)]
    pub target_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort { index: 0 });
        }
        Ok(())
    }
}

/// The unit of desired state: one workload exposed under one subdomain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExposedService {
    pub name: String,
    pub namespace: String,
    pub subdomain: String,
    pub ports: Vec<PortMapping>,
    pub target_ip: String,
}

impl ExposedService {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.namespace.is_empty() {
            return Err(ValidationError::EmptyNamespace);
        }
        validate_subdomain(&self.subdomain)?;
        if self.ports.is_empty() {
            return Err(ValidationError::NoPorts);
        }
        for (index, mapping) in self.ports.iter().enumerate() {
            if mapping.port == 0 {
                return Err(ValidationError::InvalidPort { index });
            }
        }
        if self.target_ip.is_empty() {
            return Err(ValidationError::EmptyTargetIp);
        }
        Ok(())
    }
}

/// Validate a subdomain as a DNS label.
pub fn validate_subdomain(subdomain: &str) -> Result<(), ValidationError> {
    if SUBDOMAIN_RE.is_match(subdomain) {
        Ok(())
    } else {
        Err(ValidationError::InvalidSubdomain(subdomain.to_string()))
    }
}

/// Wire message discriminator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    ServiceUpdate,
    ServiceDelete,
    Heartbeat,
}

/// A control-plane message. Updates carry the full desired service set,
/// deletes name the services to drop, heartbeats carry nothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ExposedService>,
}

impl Message {
    pub fn update(services: Vec<ExposedService>) -> Self {
        Self {
            kind: MessageKind::ServiceUpdate,
            services,
        }
    }

    pub fn delete(services: Vec<ExposedService>) -> Self {
        Self {
            kind: MessageKind::ServiceDelete,
            services,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: MessageKind::Heartbeat,
            services: Vec::new(),
        }
    }

    /// Validate every contained service. Heartbeats always pass.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if matches!(self.kind, MessageKind::Heartbeat) {
            return Ok(());
        }
        for (index, service) in self.services.iter().enumerate() {
            service
                .validate()
                .map_err(|source| ValidationError::InvalidService {
                    index,
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }
}
