//! The reconciliation engine.
//!
//! A [`Reconciler`] owns this agent's slice of the shared ledger and is
//! the only component that talks to the DNS provider.  A record moves
//! through `unmanaged -> registered -> removed`; records whose container
//! vanished without a stop event are picked up by the sweep.
//!
//! Failed provider calls leave both the in-memory map and the ledger
//! untouched.  There is no retry queue: the next start event or sweep
//! tries again.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::error::Result;
use crate::identity::Identity;
use crate::notify::Notifier;
use crate::provider::DnsProvider;
use crate::proxy::TraefikRenderer;
use crate::resolve::{resolve_ip, NamingRules};
use crate::runtime::ContainerRuntime;
use crate::state::{now_secs, StateStore};
use crate::types::{Container, ContainerEvent, DnsRecord, EventAction};

/// Knobs of the engine that come from configuration.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub naming: NamingRules,
    /// Containers with this label set to `true` are not managed.
    pub disabled_label: String,
    /// Address registered for every container when set.
    pub ip_override: Option<String>,
    /// Address of host-network containers.
    pub host_ip: Option<String>,
    /// Peers silent for longer than this are reaped.
    pub inactive_threshold: Duration,
}

/// Cooperative stop signal owned by a [`Reconciler`].
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`trigger`](Self::trigger) has been called.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Summary of one reap pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub instances: Vec<String>,
    pub records_removed: usize,
    pub records_failed: usize,
}

pub struct Reconciler {
    identity: Identity,
    settings: ReconcileSettings,
    runtime: Arc<dyn ContainerRuntime>,
    provider: Arc<dyn DnsProvider>,
    notifier: Arc<dyn Notifier>,
    store: StateStore,
    proxy: Option<TraefikRenderer>,
    /// container id -> record this instance owns
    records: BTreeMap<String, DnsRecord>,
    last_seen: f64,
    shutdown: Shutdown,
}

impl Reconciler {
    /// Creates the engine and recovers the records this instance owned
    /// before a restart.
    pub fn new(
        identity: Identity,
        settings: ReconcileSettings,
        runtime: Arc<dyn ContainerRuntime>,
        provider: Arc<dyn DnsProvider>,
        notifier: Arc<dyn Notifier>,
        store: StateStore,
    ) -> Self {
        let ledger = store.load();
        let (records, last_seen) = ledger
            .instances
            .get(&identity.instance_id)
            .map(|entry| (entry.records.clone(), entry.last_seen))
            .unwrap_or_default();
        info!(
            "Loaded {} DNS records for instance {}",
            records.len(),
            identity.instance_id
        );
        Self {
            identity,
            settings,
            runtime,
            provider,
            notifier,
            store,
            proxy: None,
            records,
            last_seen,
            shutdown: Shutdown::new(),
        }
    }

    pub fn with_proxy(mut self, proxy: TraefikRenderer) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Records this instance currently owns.
    pub fn records(&self) -> &BTreeMap<String, DnsRecord> {
        &self.records
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Registers `container` with the resolver.
    ///
    /// Unmanageable containers (opted out, no hostname, no address) are
    /// skipped without touching the resolver.
    pub async fn on_container_start(&mut self, container: &Container) {
        if container.flag(&self.settings.disabled_label) {
            info!("DNS disabled for container {}, skipping", container.name);
            return;
        }
        let Some(hostname) = self.settings.naming.resolve_hostname(container) else {
            debug!("No hostname found for container {}", container.id);
            return;
        };
        let Some(ip) = resolve_ip(
            container,
            self.settings.ip_override.as_deref(),
            self.settings.host_ip.as_deref(),
        ) else {
            warn!("No IP found for container {} ({})", container.name, hostname);
            return;
        };
        let record = DnsRecord::new(hostname, ip);

        if !self.records.contains_key(&container.id) {
            if let Some((owner, theirs)) = self.claimed_elsewhere(&container.id) {
                warn!(
                    "Container {} is already registered as {} by instance {}, skipping",
                    container.id, theirs, owner
                );
                return;
            }
        }

        // Replacing a record is remove + add.
        if let Some(previous) = self.records.get(&container.id).cloned() {
            if previous != record {
                info!(
                    "Record for container {} changed: {} => {}",
                    container.id, previous, record
                );
                if !self.remove_owned(&container.id, &previous).await {
                    return;
                }
            }
        }

        if let Err(e) = self
            .provider
            .add_record(record.hostname(), record.ip())
            .await
        {
            error!("Failed to register {} for container {}: {}", record, container.id, e);
            return;
        }

        self.records.insert(container.id.clone(), record.clone());
        self.persist().await;
        if !self.records.contains_key(&container.id) {
            return;
        }
        info!(
            "Registered {} for container {} (instance {})",
            record, container.id, self.identity.instance_id
        );

        if let Some(proxy) = &self.proxy {
            if let Err(e) = proxy.render(container, &record) {
                warn!("Failed to render proxy config for {}: {}", record.hostname(), e);
            }
        }
        self.notifier
            .notify(&format!("[{}] Added DNS record: {}", self.identity.env_prefix, record))
            .await;
    }

    /// Removes the record owned for `container_id`, if any.
    pub async fn on_container_stop(&mut self, container_id: &str) {
        let Some(record) = self.records.get(container_id).cloned() else {
            debug!("No record owned for container {}", container_id);
            return;
        };
        if self.remove_owned(container_id, &record).await {
            self.persist().await;
        }
    }

    /// Dispatches one runtime event.
    pub async fn handle_event(&mut self, event: ContainerEvent) {
        match event.action {
            EventAction::Start => match self.runtime.inspect(&event.container_id).await {
                Ok(Some(container)) => self.on_container_start(&container).await,
                Ok(None) => warn!("Container {} not found", event.container_id),
                Err(e) => error!("Failed to inspect container {}: {}", event.container_id, e),
            },
            EventAction::Stop => self.on_container_stop(&event.container_id).await,
        }
    }

    /// Removes records whose container is no longer running.  Returns how
    /// many were removed.
    ///
    /// If the runtime cannot be listed nothing is considered stale.
    pub async fn sweep_stale_records(&mut self) -> Result<usize> {
        info!(
            "Cleaning up stale DNS records for instance {}...",
            self.identity.instance_id
        );
        let running: HashSet<String> = self
            .runtime
            .running_containers()
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let stale: Vec<(String, DnsRecord)> = self
            .records
            .iter()
            .filter(|(id, _)| !running.contains(*id))
            .map(|(id, rec)| (id.clone(), rec.clone()))
            .collect();

        let mut removed = 0;
        for (container_id, record) in stale {
            info!("Removing stale DNS record managed by this instance: {}", record);
            if self.remove_owned(&container_id, &record).await {
                removed += 1;
            }
        }
        if removed > 0 {
            self.persist().await;
            info!("Cleaned up {} stale DNS records", removed);
        }
        Ok(removed)
    }

    /// Reaps peers whose heartbeat is older than the inactivity threshold.
    pub async fn reap_inactive_instances(&mut self) -> ReapReport {
        self.reap_inactive_instances_at(now_secs()).await
    }

    /// [`reap_inactive_instances`](Self::reap_inactive_instances) against
    /// an explicit clock.
    ///
    /// Record removal is best effort.  A record still claimed by an
    /// instance that is not being reaped is left at the resolver.  Ledger
    /// entries are dropped in one locked update, skipping any peer that
    /// heartbeated in the meantime.
    pub async fn reap_inactive_instances_at(&mut self, now: f64) -> ReapReport {
        let threshold = self.settings.inactive_threshold.as_secs_f64();
        let own_id = self.identity.instance_id.clone();
        let ledger = self.store.load();
        let inactive = ledger.inactive_peers(&own_id, now, threshold);
        let mut report = ReapReport::default();
        if inactive.is_empty() {
            return report;
        }
        info!(
            "Found {} inactive instances, cleaning up their DNS records",
            inactive.len()
        );

        let claimed: HashSet<&DnsRecord> = ledger
            .instances
            .iter()
            .filter(|(id, _)| !inactive.contains(*id))
            .flat_map(|(_, entry)| entry.records.values())
            .chain(self.records.values())
            .collect();

        for peer in &inactive {
            let Some(entry) = ledger.instances.get(peer) else {
                continue;
            };
            for record in entry.records.values() {
                if claimed.contains(record) {
                    debug!("Keeping {} of inactive instance {}: still claimed", record, peer);
                    continue;
                }
                info!("Removing DNS record from inactive instance {}: {}", peer, record);
                match self.provider.remove_record(record.hostname(), record.ip()).await {
                    Ok(()) => report.records_removed += 1,
                    Err(e) => {
                        warn!("Failed to remove {} of inactive instance {}: {}", record, peer, e);
                        report.records_failed += 1;
                    }
                }
            }
        }

        let dropped = self.store.update(|state| {
            let mut dropped = Vec::new();
            for peer in &inactive {
                let still_inactive = state
                    .instances
                    .get(peer)
                    .map(|e| now - e.last_seen > threshold)
                    .unwrap_or(false);
                if still_inactive {
                    state.instances.remove(peer);
                    dropped.push(peer.clone());
                }
            }
            dropped
        });
        match dropped {
            Ok(dropped) => report.instances = dropped,
            Err(e) => warn!("Failed to drop inactive instances from shared state: {}", e),
        }

        if !report.instances.is_empty() {
            info!("Cleaned up {} inactive instances", report.instances.len());
            self.notifier
                .notify(&format!(
                    "[{}] Reaped {} inactive instance(s): {}",
                    self.identity.env_prefix,
                    report.instances.len(),
                    report.instances.join(", ")
                ))
                .await;
        }
        report
    }

    /// Startup pass: sweep, reap, then register everything running.
    pub async fn startup(&mut self) {
        self.tick().await;
        info!("Syncing existing running containers...");
        match self.runtime.running_containers().await {
            Ok(containers) => {
                for container in &containers {
                    self.on_container_start(container).await;
                }
            }
            Err(e) => error!("Failed to sync existing containers: {}", e),
        }
    }

    /// Periodic pass: sweep, reap and heartbeat.
    pub async fn tick(&mut self) {
        let swept = match self.sweep_stale_records().await {
            Ok(removed) => removed,
            Err(e) => {
                error!("Failed to cleanup stale DNS records: {}", e);
                0
            }
        };
        self.reap_inactive_instances().await;
        if swept == 0 {
            self.persist().await;
        }
    }

    /// Removes `record` at the resolver and forgets it.  The caller
    /// persists.
    async fn remove_owned(&mut self, container_id: &str, record: &DnsRecord) -> bool {
        if let Err(e) = self
            .provider
            .remove_record(record.hostname(), record.ip())
            .await
        {
            error!(
                "Failed to remove {} for container {}, keeping it for retry: {}",
                record, container_id, e
            );
            return false;
        }
        self.records.remove(container_id);
        info!("Removed {} for container {}", record, container_id);

        if let Some(proxy) = &self.proxy {
            if let Err(e) = proxy.remove(record.hostname(), container_id) {
                warn!("Failed to delete proxy config for {}: {}", record.hostname(), e);
            }
        }
        self.notifier
            .notify(&format!("[{}] Removed DNS record: {}", self.identity.env_prefix, record))
            .await;
        true
    }

    /// Instance other than this one whose ledger entry holds
    /// `container_id`, with its record.
    fn claimed_elsewhere(&self, container_id: &str) -> Option<(String, DnsRecord)> {
        let own = &self.identity.instance_id;
        self.store
            .load()
            .instances
            .into_iter()
            .filter(|(id, _)| id != own)
            .find_map(|(id, mut entry)| entry.records.remove(container_id).map(|r| (id, r)))
    }

    /// Writes this instance's entry and heartbeat.  On failure the
    /// in-memory records stay authoritative until the next successful
    /// write.
    ///
    /// A container id this entry does not hold yet but another instance
    /// does is left to that instance: it is dropped here and, unless both
    /// registered the same record, removed at the resolver.
    async fn persist(&mut self) -> bool {
        let identity = &self.identity;
        let mut records = self.records.clone();
        let heartbeat = self.last_seen.max(now_secs());
        let written = self.store.update(|state| {
            let mut contested = Vec::new();
            for (id, entry) in state.instances.iter() {
                if id == &identity.instance_id {
                    continue;
                }
                for (container_id, theirs) in &entry.records {
                    if let Some(ours) = records.remove(container_id) {
                        contested.push((container_id.clone(), ours, theirs.clone()));
                    }
                }
            }
            let entry = state.instances.entry(identity.instance_id.clone()).or_default();
            // Ids this entry already holds stay ours.
            contested.retain(|(container_id, ours, _)| {
                if entry.records.contains_key(container_id) {
                    records.insert(container_id.clone(), ours.clone());
                    false
                } else {
                    true
                }
            });
            entry.hostname = identity.hostname.clone();
            entry.base_domain = identity.base_domain.clone();
            entry.env_prefix = identity.env_prefix.clone();
            entry.last_seen = entry.last_seen.max(heartbeat);
            entry.records = records;
            (entry.last_seen, contested)
        });
        let contested = match written {
            Ok((last_seen, contested)) => {
                self.last_seen = last_seen;
                contested
            }
            Err(e) => {
                warn!(
                    "Failed to save state for instance {}: {}",
                    self.identity.instance_id, e
                );
                return false;
            }
        };
        for (container_id, ours, theirs) in contested {
            warn!(
                "Container {} was claimed by another instance as {}, dropping {}",
                container_id, theirs, ours
            );
            self.records.remove(&container_id);
            if ours != theirs {
                if let Err(e) = self.provider.remove_record(ours.hostname(), ours.ip()).await {
                    error!("Failed to remove {} for container {}: {}", ours, container_id, e);
                }
            }
        }
        true
    }
}
