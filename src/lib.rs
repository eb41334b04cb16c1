//! dockdns keeps a resolver's custom DNS records in sync with the
//! containers running on a host.
//!
//! Several agents (typically one per host) may share one resolver.  They
//! coordinate only through a shared ledger file recording which agent
//! owns which record, so no agent deletes another's records, and records
//! of an agent that died are eventually cleaned up by the survivors.
//!
//! ```text
//!  runtime events ──▶ Driver ──▶ Reconciler ──▶ DnsProvider (Pi-hole)
//!                                    │
//!                                    ▼
//!                          StateStore (shared ledger)
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod identity;
pub mod notify;
pub mod provider;
pub mod proxy;
pub mod reconcile;
pub mod resolve;
pub mod runtime;
pub mod state;
pub mod types;

pub use config::Config;
pub use driver::Driver;
pub use error::{Error, Result};
pub use identity::Identity;
pub use reconcile::{ReconcileSettings, Reconciler, Shutdown};
pub use state::{SharedState, StateStore};
pub use types::{Container, ContainerEvent, DnsRecord, EventAction};
