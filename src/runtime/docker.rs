use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::errors::Error as BollardError;
use bollard::models::ContainerInspectResponse;
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::future;
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, warn};

use super::ContainerRuntime;
use crate::error::{Error, Result};
use crate::types::{Container, ContainerEvent, EventAction};

/// Seconds before a Docker API request is abandoned.
const DOCKER_TIMEOUT_SECS: u64 = 120;

pub struct DockerRuntime {
    docker: Docker,
    /// Network whose address is preferred when a container has several.
    network_name: Option<String>,
}

impl DockerRuntime {
    /// Connects to the daemon at `endpoint` (`unix://` or `tcp://`).
    pub fn connect(endpoint: &str, network_name: Option<String>) -> Result<Self> {
        let docker = if let Some(path) = endpoint.strip_prefix("unix://") {
            Docker::connect_with_socket(path, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            Docker::connect_with_http(endpoint, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else if endpoint.is_empty() {
            Docker::connect_with_local_defaults()?
        } else {
            return Err(Error::Config(format!("Unsupported Docker endpoint: {endpoint}")));
        };
        Ok(Self {
            docker,
            network_name,
        })
    }

    /// Checks that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn running_containers(&self) -> Result<Vec<Container>> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(opts)).await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for id in summaries.into_iter().filter_map(|s| s.id) {
            // Containers can vanish between list and inspect.
            if let Some(container) = self.inspect(&id).await? {
                containers.push(container);
            }
        }
        Ok(containers)
    }

    async fn inspect(&self, id: &str) -> Result<Option<Container>> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(detail) => Ok(Some(to_container(detail, self.network_name.as_deref()))),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} not found", id);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn events(&self) -> BoxStream<'static, Result<ContainerEvent>> {
        let filters: HashMap<String, Vec<String>> = [
            ("type", ["container"].as_slice()),
            ("event", ["start", "die", "kill", "stop"].as_slice()),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
        .collect();
        let opts = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        self.docker
            .events(Some(opts))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(event) => {
                        let action = event.action.as_deref().and_then(EventAction::parse);
                        let id = event.actor.and_then(|a| a.id).filter(|id| !id.is_empty());
                        match (action, id) {
                            (Some(action), Some(container_id)) => Some(Ok(ContainerEvent {
                                container_id,
                                action,
                            })),
                            _ => None,
                        }
                    }
                    Err(e) => {
                        warn!("Error in Docker event stream: {}", e);
                        Some(Err(e.into()))
                    }
                })
            })
            .boxed()
    }
}

fn to_container(detail: ContainerInspectResponse, network_name: Option<&str>) -> Container {
    let ip_address = get_ip(&detail, network_name);
    let config = detail.config.unwrap_or_default();
    let mut exposed_ports: Vec<String> = config
        .exposed_ports
        .map(|ports| ports.into_keys().collect())
        .unwrap_or_default();
    exposed_ports.sort();

    Container {
        id: detail.id.unwrap_or_default(),
        name: detail.name.unwrap_or_default(),
        labels: config.labels.unwrap_or_default(),
        ip_address,
        network_mode: detail.host_config.and_then(|h| h.network_mode),
        exposed_ports,
        running: detail.state.and_then(|s| s.running).unwrap_or(false),
    }
}

/// Address on the preferred network, else on any attached network.
fn get_ip(detail: &ContainerInspectResponse, network_name: Option<&str>) -> Option<String> {
    let settings = detail.network_settings.as_ref()?;
    let non_empty = |s: &Option<String>| s.as_ref().filter(|v| !v.is_empty()).cloned();

    if let Some(networks) = &settings.networks {
        if let Some(net) = network_name.and_then(|n| networks.get(n)) {
            if let Some(ip) = non_empty(&net.ip_address).or_else(|| non_empty(&net.global_ipv6_address)) {
                return Some(ip);
            }
        }
        let mut names: Vec<&String> = networks.keys().collect();
        names.sort();
        for name in names {
            if let Some(ip) = non_empty(&networks[name].ip_address) {
                return Some(ip);
            }
        }
    }
    non_empty(&settings.ip_address)
}
