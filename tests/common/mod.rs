//! In-memory fakes for the runtime, the resolver and the notifier.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

use dockdns::identity::Identity;
use dockdns::notify::Notifier;
use dockdns::provider::DnsProvider;
use dockdns::resolve::NamingRules;
use dockdns::runtime::ContainerRuntime;
use dockdns::{Container, ContainerEvent, DnsRecord, Error, ReconcileSettings, Reconciler, Result, StateStore};

// --- Constants ---

pub const LABEL: &str = "dns.hostname";
pub const DISABLED_LABEL: &str = "dockdns.disabled";
pub const HOST_IP: &str = "192.168.1.50";
pub const THRESHOLD_SECS: u64 = 300;

// --- FakeRuntime ---

/// Scripted container runtime.
///
/// Each call to `events()` pops the next scripted batch; once the script
/// is exhausted the stream stays pending forever.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    inner: Arc<Mutex<RuntimeInner>>,
}

#[derive(Default)]
struct RuntimeInner {
    containers: BTreeMap<String, Container>,
    batches: VecDeque<Vec<Result<ContainerEvent>>>,
    fail_listing: bool,
    events_calls: usize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&self, container: Container) {
        let mut inner = self.inner.lock().unwrap();
        inner.containers.insert(container.id.clone(), container);
    }

    pub fn kill(&self, id: &str) {
        self.inner.lock().unwrap().containers.remove(id);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.inner.lock().unwrap().fail_listing = fail;
    }

    pub fn script(&self, batch: Vec<Result<ContainerEvent>>) {
        self.inner.lock().unwrap().batches.push_back(batch);
    }

    pub fn events_calls(&self) -> usize {
        self.inner.lock().unwrap().events_calls
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn running_containers(&self) -> Result<Vec<Container>> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_listing {
            return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "daemon unavailable")));
        }
        Ok(inner.containers.values().filter(|c| c.running).cloned().collect())
    }

    async fn inspect(&self, id: &str) -> Result<Option<Container>> {
        Ok(self.inner.lock().unwrap().containers.get(id).cloned())
    }

    fn events(&self) -> BoxStream<'static, Result<ContainerEvent>> {
        let mut inner = self.inner.lock().unwrap();
        inner.events_calls += 1;
        match inner.batches.pop_front() {
            Some(batch) => stream::iter(batch).boxed(),
            None => stream::pending::<Result<ContainerEvent>>().boxed(),
        }
    }
}

// --- FakeProvider ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(String, String),
    Remove(String, String),
}

/// Resolver double that records calls and keeps a record set.
#[derive(Clone, Default)]
pub struct FakeProvider {
    inner: Arc<Mutex<ProviderInner>>,
}

#[derive(Default)]
struct ProviderInner {
    calls: Vec<Call>,
    records: HashSet<DnsRecord>,
    fail_add: bool,
    fail_remove: bool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_add(&self, fail: bool) {
        self.inner.lock().unwrap().fail_add = fail;
    }

    pub fn fail_remove(&self, fail: bool) {
        self.inner.lock().unwrap().fail_remove = fail;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn adds(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Add(..))).count()
    }

    pub fn removes(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Remove(h, ip) => Some((h, ip)),
                Call::Add(..) => None,
            })
            .collect()
    }

    pub fn has(&self, hostname: &str, ip: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .records
            .contains(&DnsRecord::new(hostname, ip))
    }

    pub fn seed(&self, hostname: &str, ip: &str) {
        self.inner.lock().unwrap().records.insert(DnsRecord::new(hostname, ip));
    }
}

fn refused(action: &'static str, hostname: &str, ip: &str) -> Error {
    Error::Provider {
        action,
        hostname: hostname.to_string(),
        ip: ip.to_string(),
        reason: "refused".into(),
    }
}

#[async_trait]
impl DnsProvider for FakeProvider {
    async fn add_record(&self, hostname: &str, ip: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Add(hostname.into(), ip.into()));
        if inner.fail_add {
            return Err(refused("add", hostname, ip));
        }
        inner.records.insert(DnsRecord::new(hostname, ip));
        Ok(())
    }

    async fn remove_record(&self, hostname: &str, ip: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Remove(hostname.into(), ip.into()));
        if inner.fail_remove {
            return Err(refused("remove", hostname, ip));
        }
        inner.records.remove(&DnsRecord::new(hostname, ip));
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<DnsRecord>> {
        Ok(self.inner.lock().unwrap().records.iter().cloned().collect())
    }
}

// --- RecordingNotifier ---

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<String>>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

// --- Harness ---

/// One simulated agent wired to fakes.
pub struct Agent {
    pub reconciler: Reconciler,
    pub runtime: FakeRuntime,
    pub provider: FakeProvider,
    pub notifier: RecordingNotifier,
}

pub fn identity(instance_id: &str, env_prefix: &str) -> Identity {
    Identity {
        instance_id: instance_id.into(),
        env_prefix: env_prefix.into(),
        hostname: format!("{env_prefix}.example"),
        base_domain: String::new(),
    }
}

pub fn settings(env_prefix: &str, base_domain: &str) -> ReconcileSettings {
    ReconcileSettings {
        naming: NamingRules {
            hostname_label: LABEL.into(),
            env_prefix: env_prefix.into(),
            base_domain: base_domain.into(),
        },
        disabled_label: DISABLED_LABEL.into(),
        ip_override: None,
        host_ip: Some(HOST_IP.into()),
        inactive_threshold: Duration::from_secs(THRESHOLD_SECS),
    }
}

pub fn agent_with(
    state_dir: &Path,
    instance_id: &str,
    env_prefix: &str,
    runtime: FakeRuntime,
    provider: FakeProvider,
) -> Agent {
    let notifier = RecordingNotifier::default();
    let reconciler = Reconciler::new(
        identity(instance_id, env_prefix),
        settings(env_prefix, ""),
        Arc::new(runtime.clone()),
        Arc::new(provider.clone()),
        Arc::new(notifier.clone()),
        StateStore::new(state_dir),
    );
    Agent {
        reconciler,
        runtime,
        provider,
        notifier,
    }
}

pub fn agent(state_dir: &Path, instance_id: &str, env_prefix: &str) -> Agent {
    agent_with(state_dir, instance_id, env_prefix, FakeRuntime::new(), FakeProvider::new())
}

/// Container labelled with an explicit hostname and bridged address.
pub fn labelled(id: &str, hostname: &str, ip: &str) -> Container {
    Container::new(id, format!("/{hostname}-ctr"))
        .with_label(LABEL, hostname)
        .with_ip(ip)
        .with_network_mode("bridge")
}

pub fn ledger_records(state_dir: &Path, instance_id: &str) -> Option<BTreeMap<String, DnsRecord>> {
    StateStore::new(state_dir)
        .load()
        .records_of(instance_id)
        .cloned()
}

/// Ledger snapshot as `instance id -> container ids`.
pub fn ownership(state_dir: &Path) -> HashMap<String, Vec<String>> {
    StateStore::new(state_dir)
        .load()
        .instances
        .into_iter()
        .map(|(id, entry)| (id, entry.records.into_keys().collect()))
        .collect()
}
