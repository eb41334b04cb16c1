use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use crate::error::Result;
use crate::types::DnsRecord;

pub mod pihole;
pub use pihole::PiHoleProvider;

/// Remote resolver holding the custom `hostname -> ip` records.
///
/// `add_record` is treated as idempotent: the reconciler never checks for
/// an existing record before adding.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn add_record(&self, hostname: &str, ip: &str) -> Result<()>;

    async fn remove_record(&self, hostname: &str, ip: &str) -> Result<()>;

    /// Records currently known to the resolver.  Diagnostics only.
    async fn list_records(&self) -> Result<Vec<DnsRecord>> {
        Ok(Vec::new())
    }
}

/// Logs changes instead of performing them.  Listing still hits the
/// wrapped provider since it has no side effects.
pub struct DryRunProvider {
    inner: Arc<dyn DnsProvider>,
}

impl DryRunProvider {
    pub fn new(inner: Arc<dyn DnsProvider>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DnsProvider for DryRunProvider {
    async fn add_record(&self, hostname: &str, ip: &str) -> Result<()> {
        info!("[DRY RUN] Would add DNS record: {} -> {}", hostname, ip);
        Ok(())
    }

    async fn remove_record(&self, hostname: &str, ip: &str) -> Result<()> {
        info!("[DRY RUN] Would remove DNS record: {} -> {}", hostname, ip);
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<DnsRecord>> {
        self.inner.list_records().await
    }
}
