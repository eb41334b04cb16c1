//! Pi-hole custom DNS adapter.
//!
//! Talks to the legacy admin endpoint
//! `/admin/scripts/pi-hole/php/customdns.php` with form posts.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::Client;

use super::DnsProvider;
use crate::error::{Error, Result};
use crate::types::DnsRecord;

const CUSTOM_DNS_PATH: &str = "/admin/scripts/pi-hole/php/customdns.php";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PiHoleProvider {
    endpoint: String,
    api_token: Option<String>,
    client: Client,
}

impl PiHoleProvider {
    pub fn new(base_url: &str, api_token: Option<String>) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        if base_url.is_empty() {
            return Err(Error::Config("Pi-hole URL must not be empty".into()));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            endpoint: format!("{base_url}{CUSTOM_DNS_PATH}"),
            api_token: api_token.filter(|t| !t.is_empty()),
            client,
        })
    }

    fn form<'a>(&'a self, action: &'a str, hostname: &'a str, ip: &'a str) -> Vec<(&'a str, &'a str)> {
        let mut form = vec![("action", action), ("domain", hostname), ("ip", ip)];
        if let Some(token) = &self.api_token {
            form.push(("auth", token.as_str()));
        }
        form
    }

    async fn change(&self, action: &'static str, hostname: &str, ip: &str) -> Result<()> {
        let wire_action = if action == "add" { "add" } else { "delete" };
        let response = self
            .client
            .post(&self.endpoint)
            .form(&self.form(wire_action, hostname, ip))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match response {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Failed to {} DNS record {} -> {}: {}", action, hostname, ip, e);
                Err(Error::Provider {
                    action,
                    hostname: hostname.to_string(),
                    ip: ip.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl DnsProvider for PiHoleProvider {
    async fn add_record(&self, hostname: &str, ip: &str) -> Result<()> {
        self.change("add", hostname, ip).await?;
        info!("Added DNS record: {} -> {}", hostname, ip);
        Ok(())
    }

    async fn remove_record(&self, hostname: &str, ip: &str) -> Result<()> {
        self.change("remove", hostname, ip).await?;
        info!("Removed DNS record: {} -> {}", hostname, ip);
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<DnsRecord>> {
        let mut query = vec![("action", "get")];
        if let Some(token) = &self.api_token {
            query.push(("auth", token.as_str()));
        }
        let body = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let records = parse_custom_dns(&body);
        debug!("Pi-hole reports {} custom records", records.len());
        Ok(records)
    }
}

/// Parses `"<ip> <hostname>"` lines, skipping anything else.
fn parse_custom_dns(body: &str) -> Vec<DnsRecord> {
    body.lines()
        .filter_map(|line| {
            let (ip, hostname) = line.trim().split_once(' ')?;
            let hostname = hostname.trim();
            (!ip.is_empty() && !hostname.is_empty()).then(|| DnsRecord::new(hostname, ip))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing() {
        let body = "10.0.0.7 host1-api\n\n172.17.0.2 host1-web.lan\ngarbage\n";
        assert_eq!(
            parse_custom_dns(body),
            vec![
                DnsRecord::new("host1-api", "10.0.0.7"),
                DnsRecord::new("host1-web.lan", "172.17.0.2"),
            ]
        );
    }

    #[test]
    fn form_carries_token_only_when_set() {
        let with = PiHoleProvider::new("http://pi.hole/", Some("secret".into())).unwrap();
        assert_eq!(with.endpoint, "http://pi.hole/admin/scripts/pi-hole/php/customdns.php");
        assert!(with.form("add", "a", "1.2.3.4").contains(&("auth", "secret")));

        let without = PiHoleProvider::new("http://pi.hole", Some(String::new())).unwrap();
        assert_eq!(without.form("delete", "a", "1.2.3.4").len(), 3);
    }

    #[test]
    fn empty_url_is_rejected() {
        assert!(matches!(PiHoleProvider::new("", None), Err(Error::Config(_))));
    }
}
