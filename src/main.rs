//! dockdns daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

use dockdns::identity::{local_hostname, Identity};
use dockdns::notify::{LogNotifier, Notifier, TelegramNotifier};
use dockdns::provider::{DnsProvider, DryRunProvider, PiHoleProvider};
use dockdns::proxy::TraefikRenderer;
use dockdns::resolve::{derive_host_ip, NamingRules};
use dockdns::runtime::{ContainerRuntime, DockerRuntime};
use dockdns::{Config, Driver, ReconcileSettings, Reconciler, StateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting DockDNS with config: {:?}", redacted(&cfg));

    let hostname = local_hostname();
    let identity = Identity::resolve(
        &hostname,
        &cfg.docker_host,
        &cfg.base_domain,
        cfg.instance_id.as_deref(),
        cfg.env_prefix.as_deref(),
    );

    info!("Pi-hole server: {}", cfg.pihole_url);
    info!("DNS label: {}", cfg.dns_label);
    info!("Shared state directory: {}", cfg.state_dir.display());
    if !cfg.base_domain.is_empty() {
        info!("Base domain: {}", cfg.base_domain);
    }
    info!("Service instance ID: {}", identity.instance_id);
    info!("Environment prefix: {}", identity.env_prefix);

    // Container Runtime (Docker)
    let docker = DockerRuntime::connect(&cfg.docker_host, cfg.network_name.clone())?;
    docker.ping().await?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    let host_ip = match &cfg.docker_host_ip {
        Some(ip) => ip.clone(),
        None => derive_host_ip(&cfg.docker_host, &hostname).await,
    };
    info!("Docker host IP: {}", host_ip);

    // DNS provider
    let pihole: Arc<dyn DnsProvider> =
        Arc::new(PiHoleProvider::new(&cfg.pihole_url, cfg.pihole_api_token.clone())?);
    match pihole.list_records().await {
        Ok(records) => info!("Pi-hole currently holds {} custom records", records.len()),
        Err(e) => error!("Failed to list Pi-hole records: {}", e),
    }
    let provider: Arc<dyn DnsProvider> = if cfg.dry_run {
        info!("Dry run: resolver changes are logged only");
        Arc::new(DryRunProvider::new(pihole))
    } else {
        pihole
    };

    let notifier: Arc<dyn Notifier> = match cfg.telegram() {
        Some((token, chat_id)) => Arc::new(TelegramNotifier::new(token, chat_id)),
        None => Arc::new(LogNotifier),
    };

    let settings = ReconcileSettings {
        naming: NamingRules {
            hostname_label: cfg.dns_label.clone(),
            env_prefix: identity.env_prefix.clone(),
            base_domain: cfg.base_domain.clone(),
        },
        disabled_label: cfg.disabled_label.clone(),
        ip_override: cfg.dns_ip.clone(),
        host_ip: Some(host_ip),
        inactive_threshold: cfg.inactive_threshold(),
    };

    let mut reconciler = Reconciler::new(
        identity,
        settings,
        Arc::clone(&runtime),
        provider,
        notifier,
        StateStore::new(&cfg.state_dir),
    );
    if let Some(dir) = &cfg.traefik_output_dir {
        reconciler = reconciler.with_proxy(TraefikRenderer::new(dir, &cfg.port_label, cfg.dry_run));
    }
    let shutdown = reconciler.shutdown_handle();

    let driver = Driver::new(
        reconciler,
        runtime,
        cfg.sweep_interval(),
        cfg.reconnect_backoff(),
    );
    let driver_handle = tokio::spawn(driver.run());

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    shutdown.trigger();
    if let Err(e) = driver_handle.await {
        error!("Event loop task failed: {}", e);
    }

    info!("Shutdown complete.");
    Ok(())
}

/// Config for logging, with credentials masked.
fn redacted(cfg: &Config) -> Config {
    let mask = |v: &Option<String>| v.as_ref().map(|_| "***".to_string());
    Config {
        pihole_api_token: mask(&cfg.pihole_api_token),
        telegram_token: mask(&cfg.telegram_token),
        ..cfg.clone()
    }
}
