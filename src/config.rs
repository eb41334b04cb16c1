use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub pihole_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pihole_api_token: Option<String>,

    /// Label carrying an explicit hostname.
    pub dns_label: String,
    /// Containers with this label set to `true` are left alone.
    pub disabled_label: String,
    /// Reverse-proxy port override label.
    pub port_label: String,
    /// Plain domain or template with `{container-name}` / `{env-prefix}`.
    pub base_domain: String,

    pub docker_host: String,
    /// Preferred network when a container is attached to several.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    /// Address used for host-network containers.  Derived when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_host_ip: Option<String>,
    /// Address registered for every container, overriding detection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_ip: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_prefix: Option<String>,
    pub state_dir: PathBuf,

    pub inactive_threshold_secs: u64,
    pub sweep_interval_secs: u64,
    pub reconnect_backoff_secs: u64,

    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traefik_output_dir: Option<PathBuf>,

    pub notifications_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pihole_url: "http://pihole.local".into(),
            pihole_api_token: None,
            dns_label: "dns.hostname".into(),
            disabled_label: "dockdns.disabled".into(),
            port_label: "dockdns.source.port".into(),
            base_domain: String::new(),
            docker_host: std::env::var("DOCKER_HOST").unwrap_or_else(|_| DEFAULT_DOCKER_HOST.into()),
            network_name: None,
            docker_host_ip: None,
            dns_ip: None,
            instance_id: None,
            env_prefix: None,
            state_dir: PathBuf::from("/shared-state"),
            inactive_threshold_secs: 300,
            sweep_interval_secs: 60,
            reconnect_backoff_secs: 5,
            dry_run: false,
            traefik_output_dir: None,
            notifications_enabled: true,
            telegram_token: None,
            telegram_chat_id: None,
        }
    }
}

impl Config {
    /// Defaults, then `dockdns.toml`, `dockdns.json` and `DOCKDNS_*`
    /// environment variables.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("dockdns.toml"))
            .merge(Json::file("dockdns.json"))
            .merge(Env::prefixed("DOCKDNS_"))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("DOCKDNS_PIHOLE_API_TOKEN_FILE") {
            config.pihole_api_token = Some(read_secret(&secret_file)?);
        }
        if let Ok(secret_file) = std::env::var("DOCKDNS_TELEGRAM_TOKEN_FILE") {
            config.telegram_token = Some(read_secret(&secret_file)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pihole_url.trim().is_empty() {
            return Err(Error::Config("pihole_url must not be empty".into()));
        }
        if self.inactive_threshold_secs == 0 {
            return Err(Error::Config("inactive_threshold_secs must be positive".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::Config("sweep_interval_secs must be positive".into()));
        }
        // The heartbeat is written once per sweep; peers must see at least
        // two of them inside the inactivity window.
        if self.sweep_interval_secs.saturating_mul(2) > self.inactive_threshold_secs {
            return Err(Error::Config(format!(
                "sweep_interval_secs ({}) must be at most half of inactive_threshold_secs ({})",
                self.sweep_interval_secs, self.inactive_threshold_secs
            )));
        }
        Ok(())
    }

    pub fn inactive_threshold(&self) -> Duration {
        Duration::from_secs(self.inactive_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    /// Telegram credentials when notifications should go there.
    pub fn telegram(&self) -> Option<(&str, &str)> {
        if !self.notifications_enabled {
            return None;
        }
        match (self.telegram_token.as_deref(), self.telegram_chat_id.as_deref()) {
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => Some((token, chat)),
            _ => None,
        }
    }
}

fn read_secret(path: &str) -> Result<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}
