//! Traefik dynamic configuration for registered containers.
//!
//! One YAML file per container routes `Host(<hostname>)` to the
//! container's address.  Traefik's file provider picks the files up from
//! the output directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use log::{info, warn};
use serde::Serialize;

use crate::error::Result;
use crate::types::{Container, DnsRecord};

/// Length of the container id suffix in file names.
const SHORT_ID_LEN: usize = 12;

pub struct TraefikRenderer {
    output_dir: PathBuf,
    port_label: String,
    dry_run: bool,
}

impl TraefikRenderer {
    pub fn new(output_dir: impl Into<PathBuf>, port_label: impl Into<String>, dry_run: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            port_label: port_label.into(),
            dry_run,
        }
    }

    /// Path of the config file for a container and its hostname.  Always
    /// a direct child of the output directory.
    pub fn config_path(&self, hostname: &str, container_id: &str) -> PathBuf {
        let short: String = container_id.chars().take(SHORT_ID_LEN).collect();
        self.output_dir
            .join(format!("{}_{}.yaml", file_stem(hostname), file_stem(&short)))
    }

    /// Port to route to: the port label, else the first exposed port.
    pub fn target_port(&self, container: &Container) -> Option<u16> {
        if let Some(port) = container.label(&self.port_label) {
            return port.trim().parse().ok();
        }
        let mut exposed: Vec<&String> = container.exposed_ports.iter().collect();
        exposed.sort();
        exposed
            .into_iter()
            .find_map(|p| p.split('/').next().and_then(|n| n.parse().ok()))
    }

    /// Writes the route for `record`.  Returns the file written, or `None`
    /// when the container has no port to route to.
    pub fn render(&self, container: &Container, record: &DnsRecord) -> Result<Option<PathBuf>> {
        let Some(port) = self.target_port(container) else {
            warn!(
                "No port for {} (set '{}' or expose one), skipping Traefik config",
                record.hostname(),
                self.port_label
            );
            return Ok(None);
        };
        if record.hostname().contains('`') {
            warn!(
                "Hostname {:?} cannot appear in a Traefik rule, skipping Traefik config",
                record.hostname()
            );
            return Ok(None);
        }
        let path = self.config_path(record.hostname(), &container.id);
        let body = render_router(record, port)?;
        if self.dry_run {
            info!("[DRY RUN] Would write {}:\n{}", path.display(), body);
            return Ok(Some(path));
        }
        fs::create_dir_all(&self.output_dir)?;
        fs::write(&path, body)?;
        info!("[TRAEFIK] Wrote config to {}", path.display());
        Ok(Some(path))
    }

    /// Deletes the route for `hostname`/`container_id` if present.
    pub fn remove(&self, hostname: &str, container_id: &str) -> Result<()> {
        let path = self.config_path(hostname, container_id);
        if !path.exists() {
            return Ok(());
        }
        if self.dry_run {
            info!("[DRY RUN] Would delete {}", path.display());
            return Ok(());
        }
        fs::remove_file(&path)?;
        info!("[TRAEFIK] Removed config: {}", path.display());
        Ok(())
    }
}

/// File name component: anything but `[A-Za-z0-9._-]` becomes `_`, and a
/// stem made only of dots is replaced so it cannot name a parent.
fn file_stem(raw: &str) -> String {
    let stem: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.chars().all(|c| c == '.') {
        stem.replace('.', "_")
    } else {
        stem
    }
}

#[derive(Serialize)]
struct DynamicConfig {
    http: HttpConfig,
}

#[derive(Serialize)]
struct HttpConfig {
    routers: BTreeMap<String, Router>,
    services: BTreeMap<String, Service>,
}

#[derive(Serialize)]
struct Router {
    rule: String,
    service: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Service {
    load_balancer: LoadBalancer,
}

#[derive(Serialize)]
struct LoadBalancer {
    servers: Vec<Server>,
}

#[derive(Serialize)]
struct Server {
    url: String,
}

fn render_router(record: &DnsRecord, port: u16) -> Result<String> {
    let name: String = record
        .hostname()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let config = DynamicConfig {
        http: HttpConfig {
            routers: BTreeMap::from([(
                name.clone(),
                Router {
                    rule: format!("Host(`{}`)", record.hostname()),
                    service: name.clone(),
                },
            )]),
            services: BTreeMap::from([(
                name,
                Service {
                    load_balancer: LoadBalancer {
                        servers: vec![Server {
                            url: format!("http://{}:{}", record.ip(), port),
                        }],
                    },
                },
            )]),
        },
    };
    Ok(format!(
        "# Generated by dockdns\n{}",
        serde_yaml::to_string(&config)?
    ))
}
