//! Shared, file-backed ledger of record ownership.
//!
//! Every agent sharing a resolver points at the same ledger file.  Each
//! agent only ever writes its own entry under `instances`, except when it
//! reaps a peer that stopped heartbeating.
//!
//! Access is serialized with advisory locks (`flock`) taken on a sibling
//! `.lock` file: shared for [`StateStore::load`], exclusive for
//! [`StateStore::save`] and [`StateStore::update`].  The ledger itself is
//! always rewritten in full through a temp file and an atomic rename, so
//! a crash mid-write leaves the previous ledger intact.
//!
//! `load` followed by `save` does not hold the lock in between.  Two
//! agents doing that concurrently lose one of the two changes (last
//! writer wins on the whole ledger).  [`StateStore::update`] holds one
//! exclusive lock across read, mutation and write and is what the
//! reconciler uses.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::DnsRecord;

/// File name of the ledger inside the state directory.
pub const STATE_FILE_NAME: &str = "dockdns-shared-state.json";

/// Permission bits of the ledger file.
#[cfg(unix)]
const LEDGER_MODE: u32 = 0o644;

/// The persisted ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    /// Epoch seconds of the last write.  Diagnostics only.
    #[serde(default)]
    pub last_updated: f64,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceEntry>,
}

/// One agent's partition of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceEntry {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub base_domain: String,
    #[serde(default)]
    pub env_prefix: String,
    /// Heartbeat, epoch seconds.
    #[serde(default)]
    pub last_seen: f64,
    /// container id -> record
    #[serde(default)]
    pub records: BTreeMap<String, DnsRecord>,
}

impl SharedState {
    /// Records owned by `instance_id`, if it has an entry.
    pub fn records_of(&self, instance_id: &str) -> Option<&BTreeMap<String, DnsRecord>> {
        self.instances.get(instance_id).map(|i| &i.records)
    }

    /// Ids of instances other than `own_id` whose heartbeat is older than
    /// `threshold_secs` at `now`.
    pub fn inactive_peers(&self, own_id: &str, now: f64, threshold_secs: f64) -> Vec<String> {
        self.instances
            .iter()
            .filter(|(id, entry)| id.as_str() != own_id && now - entry.last_seen > threshold_secs)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Current time as fractional epoch seconds.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Locked access to the ledger file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Releases the advisory lock when dropped.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl StateStore {
    /// Ledger at `<state_dir>/dockdns-shared-state.json`.
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self::at(state_dir.as_ref().join(STATE_FILE_NAME))
    }

    /// Ledger at an explicit file path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the ledger under a shared lock.
    ///
    /// A missing or unreadable ledger is logged and reported as empty; this
    /// never fails the caller.
    pub fn load(&self) -> SharedState {
        match self.try_load() {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to load shared state from {}: {}", self.path.display(), e);
                SharedState::default()
            }
        }
    }

    /// Like [`load`](Self::load) but surfaces lock and IO failures.
    pub fn try_load(&self) -> Result<SharedState> {
        if !self.path.exists() {
            return Ok(SharedState::default());
        }
        let _guard = self.lock(false)?;
        self.read_unlocked()
    }

    /// Writes the whole ledger under an exclusive lock, stamping
    /// `last_updated`.
    pub fn save(&self, state: &mut SharedState) -> Result<()> {
        self.ensure_dir()?;
        let _guard = self.lock(true)?;
        state.last_updated = now_secs();
        self.write_unlocked(state)
    }

    /// Read-modify-write under a single exclusive lock.
    ///
    /// `f` sees the latest ledger on disk; whatever it leaves behind is
    /// written back in full.  A ledger that exists but cannot be read
    /// fails the update without writing, so peers' entries survive.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SharedState) -> T,
    {
        self.ensure_dir()?;
        let _guard = self.lock(true)?;
        let mut state = self.read_unlocked()?;
        let out = f(&mut state);
        state.last_updated = now_secs();
        self.write_unlocked(&state)?;
        Ok(out)
    }

    fn ensure_dir(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    fn lock(&self, exclusive: bool) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|source| Error::Lock {
                path: self.lock_path.clone(),
                source,
            })?;
        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|source| Error::Lock {
            path: self.lock_path.clone(),
            source,
        })?;
        Ok(LockGuard { file })
    }

    /// Caller must hold the lock.  Unparsable content counts as empty; any
    /// IO error other than a missing file is returned.
    fn read_unlocked(&self) -> Result<SharedState> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(SharedState::default()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(SharedState::default());
        }
        Ok(match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "Shared state {} is corrupt, starting from an empty ledger: {}",
                    self.path.display(),
                    e
                );
                SharedState::default()
            }
        })
    }

    /// Caller must hold the exclusive lock.
    fn write_unlocked(&self, state: &SharedState) -> Result<()> {
        let dir = match self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, state)?;
        tmp.write_all(b"\n")?;
        set_ledger_mode(tmp.as_file())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        debug!(
            "Wrote shared state with {} instances to {}",
            state.instances.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Temp files start out as 0600; agents under other uids must still be
/// able to read the ledger.
#[cfg(unix)]
fn set_ledger_mode(file: &File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(LEDGER_MODE))
}

#[cfg(not(unix))]
fn set_ledger_mode(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn entry(last_seen: f64, records: &[(&str, &str, &str)]) -> InstanceEntry {
        InstanceEntry {
            hostname: "node".into(),
            base_domain: "lan".into(),
            env_prefix: "node".into(),
            last_seen,
            records: records
                .iter()
                .map(|(id, host, ip)| (id.to_string(), DnsRecord::new(*host, *ip)))
                .collect(),
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested"));
        assert_eq!(store.load(), SharedState::default());
    }

    #[test]
    fn corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().instances.is_empty());
    }

    #[test]
    fn round_trip_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = SharedState::default();
        state.instances.insert(
            "aaaa1111".into(),
            entry(100.5, &[("c1", "host1-api", "10.0.0.7"), ("c2", "host1-db", "10.0.0.8")]),
        );
        state.instances.insert("bbbb2222".into(), entry(200.0, &[]));
        store.save(&mut state).unwrap();

        let loaded = store.load();
        assert_eq!(loaded, state);

        let mut again = loaded.clone();
        store.save(&mut again).unwrap();
        let reloaded = store.load();
        assert_eq!(reloaded.instances, state.instances);
    }

    #[test]
    fn reads_ledgers_written_by_older_agents() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(
            store.path(),
            r#"{
              "instances": {
                "ab12cd34": {
                  "hostname": "node1",
                  "base_domain": "",
                  "env_prefix": "node1",
                  "last_seen": 1700000000.25,
                  "records": {"deadbeef": ["node1-web", "172.17.0.2"]}
                }
              },
              "last_updated": 1700000000.5
            }"#,
        )
        .unwrap();
        let state = store.load();
        let records = state.records_of("ab12cd34").unwrap();
        assert_eq!(records["deadbeef"], DnsRecord::new("node1-web", "172.17.0.2"));
        assert_eq!(state.last_updated, 1700000000.5);
    }

    #[test]
    fn save_stamps_last_updated() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut state = SharedState::default();
        store.save(&mut state).unwrap();
        assert!(state.last_updated > 0.0);
        assert_eq!(store.load().last_updated, state.last_updated);
    }

    #[cfg(unix)]
    #[test]
    fn ledger_is_readable_by_other_users() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&mut SharedState::default()).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode & 0o044, 0o044, "ledger mode {mode:o}");

        store.update(|_| ()).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, LEDGER_MODE);
    }

    #[test]
    fn unreadable_ledger_fails_update_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the ledger path cannot be read as a file.
        let store = StateStore::at(dir.path().join("ledger"));
        fs::create_dir(store.path()).unwrap();
        fs::write(store.path().join("marker"), "peer data").unwrap();

        let touched = store.update(|state| {
            state.instances.insert("me".into(), entry(1.0, &[]));
        });
        assert!(touched.is_err());
        assert!(store.path().is_dir());
        assert!(store.path().join("marker").exists());
        assert!(store.load().instances.is_empty());
    }

    #[test]
    fn inactive_peers_skip_self_and_fresh_entries() {
        let mut state = SharedState::default();
        state.instances.insert("me".into(), entry(0.0, &[]));
        state.instances.insert("old".into(), entry(1000.0 - 301.0, &[]));
        state.instances.insert("fresh".into(), entry(1000.0 - 299.0, &[]));
        assert_eq!(state.inactive_peers("me", 1000.0, 300.0), vec!["old".to_string()]);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path()));
        let writers = 8;
        let rounds = 20;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for r in 0..rounds {
                        store
                            .update(|state| {
                                let e = state.instances.entry(format!("inst{w}")).or_default();
                                e.records.insert(
                                    format!("c{w}-{r}"),
                                    DnsRecord::new(format!("h{w}-{r}"), "10.0.0.1"),
                                );
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let state = store.load();
        assert_eq!(state.instances.len(), writers);
        for w in 0..writers {
            assert_eq!(state.records_of(&format!("inst{w}")).unwrap().len(), rounds);
        }
    }
}
