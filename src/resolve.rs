//! Derives the DNS name and reachable address of a container.
//!
//! Both functions are pure; the only lookup happens once at startup in
//! [`derive_host_ip`], which provides the fallback address for
//! host-network containers.

use std::net::IpAddr;

use hickory_resolver::TokioAsyncResolver;
use log::{debug, warn};

use crate::types::Container;

pub const CONTAINER_NAME_PLACEHOLDER: &str = "{container-name}";
pub const ENV_PREFIX_PLACEHOLDER: &str = "{env-prefix}";

/// Docker Desktop's alias for the host machine.
const DOCKER_INTERNAL_HOST: &str = "host.docker.internal";
const LOOPBACK: &str = "127.0.0.1";

/// Everything needed to name a container, apart from the container.
#[derive(Debug, Clone, Default)]
pub struct NamingRules {
    /// Label carrying an explicit hostname.
    pub hostname_label: String,
    pub env_prefix: String,
    /// Plain domain or template with placeholders.
    pub base_domain: String,
}

impl NamingRules {
    pub fn resolve_hostname(&self, container: &Container) -> Option<String> {
        resolve_hostname(container, &self.hostname_label, &self.env_prefix, &self.base_domain)
    }
}

/// Target hostname for `container`, or `None` when it has neither a
/// hostname label nor a usable name.
pub fn resolve_hostname(
    container: &Container,
    hostname_label: &str,
    env_prefix: &str,
    base_domain: &str,
) -> Option<String> {
    // The label is taken verbatim; only an empty one falls back to the name.
    let base = match container.label(hostname_label) {
        Some(labeled) if !labeled.is_empty() => labeled.to_string(),
        _ => {
            let name = container.name.trim_start_matches('/');
            if name.is_empty() {
                return None;
            }
            name.to_string()
        }
    };

    let env_dash = format!("{env_prefix}-");
    let prefixed = if env_prefix.is_empty() || base.starts_with(&env_dash) {
        base
    } else {
        format!("{env_dash}{base}")
    };

    let base_domain = base_domain.trim().trim_start_matches('.');
    if base_domain.contains(CONTAINER_NAME_PLACEHOLDER) {
        if base_domain.contains(ENV_PREFIX_PLACEHOLDER) {
            let unprefixed = if env_prefix.is_empty() {
                prefixed.as_str()
            } else {
                prefixed.strip_prefix(&env_dash).unwrap_or(&prefixed)
            };
            return Some(
                base_domain
                    .replace(ENV_PREFIX_PLACEHOLDER, env_prefix)
                    .replace(CONTAINER_NAME_PLACEHOLDER, unprefixed),
            );
        }
        return Some(base_domain.replace(CONTAINER_NAME_PLACEHOLDER, &prefixed));
    }
    if !base_domain.is_empty() {
        let domain = base_domain.replace(ENV_PREFIX_PLACEHOLDER, env_prefix);
        return Some(format!("{prefixed}.{domain}"));
    }
    Some(prefixed)
}

/// Address to register for `container`.
///
/// An operator override wins, then the container's own network address,
/// then `host_ip` for host-network containers.
pub fn resolve_ip(container: &Container, ip_override: Option<&str>, host_ip: Option<&str>) -> Option<String> {
    let non_empty = |s: &&str| !s.trim().is_empty();
    if let Some(ip) = ip_override.filter(non_empty) {
        return Some(ip.to_string());
    }
    if let Some(ip) = container.ip_address.as_deref().filter(non_empty) {
        return Some(ip.to_string());
    }
    if container.is_host_network() {
        return host_ip.filter(non_empty).map(str::to_string);
    }
    None
}

/// Address of the machine running the containers.
///
/// For a remote `tcp://` endpoint this is the endpoint's host.  Otherwise
/// the local hostname is looked up, then `host.docker.internal`, and
/// loopback is the last resort.
pub async fn derive_host_ip(runtime_endpoint: &str, local_hostname: &str) -> String {
    if let Some(host) = remote_endpoint_host(runtime_endpoint) {
        return host;
    }

    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to load system resolver config: {}. Using {}", e, LOOPBACK);
            return LOOPBACK.to_string();
        }
    };

    for name in [local_hostname, DOCKER_INTERNAL_HOST] {
        if name.is_empty() {
            continue;
        }
        match resolver.lookup_ip(name).await {
            Ok(lookup) => {
                let found = lookup.iter().find(|ip| matches!(ip, IpAddr::V4(v4) if !v4.is_loopback()));
                if let Some(ip) = found.or_else(|| lookup.iter().next()) {
                    debug!("Host IP from {}: {}", name, ip);
                    return ip.to_string();
                }
            }
            Err(e) => debug!("Lookup of {} failed: {}", name, e),
        }
    }
    LOOPBACK.to_string()
}

fn remote_endpoint_host(runtime_endpoint: &str) -> Option<String> {
    let rest = runtime_endpoint.strip_prefix("tcp://")?;
    let host = rest.split(':').next().unwrap_or_default();
    (!host.is_empty()).then(|| host.to_string())
}
