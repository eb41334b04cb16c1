//! Stable identity of one agent process.
//!
//! The instance id partitions the shared ledger.  It is derived from
//! where the agent runs, so a restarted agent on the same host finds
//! and recovers the records it owned before.

use sha2::{Digest, Sha256};

/// Length of the hex instance id.
const INSTANCE_ID_LEN: usize = 8;
/// Maximum length of a derived environment prefix.
const ENV_PREFIX_MAX: usize = 10;
/// Used when the hostname has no usable characters.
pub const FALLBACK_ENV_PREFIX: &str = "env";

/// Identity of this agent inside the shared ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub instance_id: String,
    pub env_prefix: String,
    /// Local hostname, persisted for diagnostics.
    pub hostname: String,
    pub base_domain: String,
}

impl Identity {
    /// Builds the identity, deriving whatever the operator did not pin.
    pub fn resolve(
        local_hostname: &str,
        runtime_endpoint: &str,
        base_domain: &str,
        instance_id: Option<&str>,
        env_prefix: Option<&str>,
    ) -> Self {
        let instance_id = match instance_id.filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => derive_instance_id(local_hostname, runtime_endpoint, base_domain),
        };
        let env_prefix = match env_prefix.filter(|s| !s.is_empty()) {
            Some(prefix) => prefix.to_string(),
            None => derive_env_prefix(local_hostname),
        };
        Self {
            instance_id,
            env_prefix,
            hostname: local_hostname.to_string(),
            base_domain: base_domain.to_string(),
        }
    }
}

/// Truncated SHA-256 of `host-endpoint-domain`.
pub fn derive_instance_id(local_hostname: &str, runtime_endpoint: &str, base_domain: &str) -> String {
    let digest = Sha256::digest(format!("{local_hostname}-{runtime_endpoint}-{base_domain}"));
    let mut id = hex::encode(digest);
    id.truncate(INSTANCE_ID_LEN);
    id
}

/// Short DNS-safe label derived from the hostname.
pub fn derive_env_prefix(local_hostname: &str) -> String {
    let cleaned: String = local_hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .map(|c| c.to_ascii_lowercase())
        .take(ENV_PREFIX_MAX)
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        FALLBACK_ENV_PREFIX.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Name of the local machine, empty if it cannot be determined.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_default()
}
