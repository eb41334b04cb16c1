//! Data structures shared by the runtime observer and the reconciler.
//!
//! [`Container`] is the narrow view of a container the core relies on.
//! The Docker adapter builds it from an inspect response, tests build it
//! by hand.  Nothing in the reconciler touches the runtime client
//! directly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A running (or recently running) container as seen by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    /// Opaque runtime identifier.
    pub id: String,
    /// Container name.  Docker reports it with a leading `/`.
    pub name: String,
    pub labels: HashMap<String, String>,
    /// IP address on the first attached network, if any.
    pub ip_address: Option<String>,
    /// `HostConfig.NetworkMode`, e.g. `bridge` or `host`.
    pub network_mode: Option<String>,
    /// Exposed ports in runtime notation (`80/tcp`).
    pub exposed_ports: Vec<String>,
    pub running: bool,
}

impl Container {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            running: true,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    pub fn with_exposed_port(mut self, port: impl Into<String>) -> Self {
        self.exposed_ports.push(port.into());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn is_host_network(&self) -> bool {
        self.network_mode.as_deref() == Some("host")
    }

    /// True when `key` is set to `true` (any case).
    pub fn flag(&self, key: &str) -> bool {
        self.label(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

/// Lifecycle actions the reconciler reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Start,
    /// `stop`, `die` and `kill` all end up here.
    Stop,
}

impl EventAction {
    /// Maps a runtime action string, ignoring everything that is not a
    /// lifecycle transition.
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "start" => Some(EventAction::Start),
            "stop" | "die" | "kill" => Some(EventAction::Stop),
            _ => None,
        }
    }
}

/// A container lifecycle event delivered by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub container_id: String,
    pub action: EventAction,
}

/// A `(hostname, ip)` pair registered with the resolver on behalf of one
/// container.  Serialized as a two element array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsRecord(pub String, pub String);

impl DnsRecord {
    pub fn new(hostname: impl Into<String>, ip: impl Into<String>) -> Self {
        DnsRecord(hostname.into(), ip.into())
    }

    pub fn hostname(&self) -> &str {
        &self.0
    }

    pub fn ip(&self) -> &str {
        &self.1
    }
}

impl std::fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.0, self.1)
    }
}
