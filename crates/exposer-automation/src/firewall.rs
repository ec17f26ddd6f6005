//! Hetzner Cloud Firewall client.
//!
//! The reconciler replaces the full rule set each cycle. Rules carrying
//! the managed tag in their description are ours to drop and regenerate;
//! everything else is preserved verbatim, and an SSH rule is kept or
//! created so a reconcile can never lock the operator out.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Description marking rules owned by this system.
pub const MANAGED_RULE_TAG: &str = "exposer";

const API_BASE: &str = "https://api.hetzner.cloud/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Firewall client errors.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("firewall management disabled (no token or firewall id)")]
    Disabled,

    #[error("firewall api returned status {status}: {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("firewall request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// One firewall rule as the REST API represents it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewallRule {
    pub direction: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_ips: Vec<String>,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FirewallRule {
    /// An inbound TCP rule open to the world.
    fn open_tcp(port: &str, description: &str) -> Self {
        Self {
            direction: "in".to_string(),
            source_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            protocol: "tcp".to_string(),
            port: Some(port.to_string()),
            description: Some(description.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct FirewallEnvelope {
    firewall: FirewallBody,
}

#[derive(Deserialize)]
struct FirewallBody {
    #[serde(default)]
    rules: Vec<FirewallRule>,
}

/// Client for one cloud firewall. Disabled unless both credentials are
/// present.
pub struct FirewallClient {
    token: Option<String>,
    firewall_id: Option<String>,
    http: reqwest::Client,
}

impl FirewallClient {
    pub fn new(token: Option<String>, firewall_id: Option<String>) -> Self {
        Self {
            token,
            firewall_id,
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("default TLS backend"),
        }
    }

    pub fn enabled(&self) -> bool {
        self.credentials().is_some()
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (self.token.as_deref(), self.firewall_id.as_deref()) {
            (Some(token), Some(id)) if !token.is_empty() && !id.is_empty() => Some((token, id)),
            _ => None,
        }
    }

    /// Fetch the current rule set.
    pub async fn rules(&self) -> Result<Vec<FirewallRule>, FirewallError> {
        let (token, id) = self.credentials().ok_or(FirewallError::Disabled)?;

        let response = self
            .http
            .get(format!("{API_BASE}/firewalls/{id}"))
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FirewallError::Api { status, body });
        }

        let envelope: FirewallEnvelope = response.json().await?;
        Ok(envelope.firewall.rules)
    }

    /// Replace the full rule set in a single call.
    pub async fn set_rules(&self, rules: &[FirewallRule]) -> Result<(), FirewallError> {
        let (token, id) = self.credentials().ok_or(FirewallError::Disabled)?;

        let response = self
            .http
            .post(format!("{API_BASE}/firewalls/{id}/actions/set_rules"))
            .bearer_auth(token)
            .json(&serde_json::json!({ "rules": rules }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FirewallError::Api { status, body });
        }

        Ok(())
    }

    /// Ensure the given external ports (plus SSH and the proxy's standard
    /// ports) are open. No-op when disabled.
    pub async fn ensure_ports_open(&self, ports: &[u16]) -> Result<(), FirewallError> {
        if !self.enabled() {
            debug!("firewall management disabled");
            return Ok(());
        }

        let current = self.rules().await?;
        let desired = build_rules(&current, ports);
        self.set_rules(&desired).await
    }
}

/// Build the replacement rule set: retain every rule not carrying the
/// managed tag, keep or create the SSH rule, then add the proxy's standard
/// ports and one rule per exposed external port.
pub fn build_rules(current: &[FirewallRule], ports: &[u16]) -> Vec<FirewallRule> {
    let mut rules: Vec<FirewallRule> = current
        .iter()
        .filter(|rule| rule.description.as_deref() != Some(MANAGED_RULE_TAG))
        .cloned()
        .collect();

    let has_ssh = rules
        .iter()
        .any(|rule| rule.port.as_deref() == Some("22") && rule.protocol == "tcp");
    if !has_ssh {
        rules.push(FirewallRule::open_tcp("22", "SSH"));
    }

    let mut added = std::collections::HashSet::new();
    for port in [80u16, 443] {
        if added.insert(port) {
            rules.push(FirewallRule::open_tcp(&port.to_string(), MANAGED_RULE_TAG));
        }
    }
    for port in ports {
        if added.insert(*port) {
            rules.push(FirewallRule::open_tcp(&port.to_string(), MANAGED_RULE_TAG));
        }
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed(port: &str) -> FirewallRule {
        FirewallRule::open_tcp(port, MANAGED_RULE_TAG)
    }

    #[test]
    fn test_disabled_without_credentials() {
        assert!(!FirewallClient::new(None, None).enabled());
        assert!(!FirewallClient::new(Some("tok".to_string()), None).enabled());
        assert!(!FirewallClient::new(None, Some("123".to_string())).enabled());
        assert!(!FirewallClient::new(Some(String::new()), Some("123".to_string())).enabled());
        assert!(
            FirewallClient::new(Some("tok".to_string()), Some("123".to_string())).enabled()
        );
    }

    #[test]
    fn test_build_rules_from_scratch() {
        let rules = build_rules(&[], &[25565]);

        let ports: Vec<_> = rules.iter().filter_map(|r| r.port.as_deref()).collect();
        assert_eq!(ports, vec!["22", "80", "443", "25565"]);
        assert_eq!(rules[0].description.as_deref(), Some("SSH"));
        assert!(rules[1..]
            .iter()
            .all(|r| r.description.as_deref() == Some(MANAGED_RULE_TAG)));
    }

    #[test]
    fn test_build_rules_preserves_unmanaged_and_ssh() {
        let custom = FirewallRule {
            direction: "in".to_string(),
            source_ips: vec!["203.0.113.0/24".to_string()],
            protocol: "udp".to_string(),
            port: Some("51820".to_string()),
            description: Some("wireguard".to_string()),
        };
        let ssh = FirewallRule::open_tcp("22", "operator ssh");
        let stale = managed("30001");

        let rules = build_rules(&[custom.clone(), ssh.clone(), stale], &[8080]);

        assert!(rules.contains(&custom));
        // The existing SSH rule is kept as-is, not duplicated.
        assert_eq!(
            rules
                .iter()
                .filter(|r| r.port.as_deref() == Some("22"))
                .count(),
            1
        );
        assert!(rules.contains(&ssh));
        // The stale managed port is gone, the new one is present.
        assert!(!rules.iter().any(|r| r.port.as_deref() == Some("30001")));
        assert!(rules.iter().any(|r| r.port.as_deref() == Some("8080")));
    }

    #[test]
    fn test_build_rules_deduplicates_standard_ports() {
        let rules = build_rules(&[], &[80, 443, 9000]);
        let count_80 = rules.iter().filter(|r| r.port.as_deref() == Some("80")).count();
        let count_443 = rules
            .iter()
            .filter(|r| r.port.as_deref() == Some("443"))
            .count();
        assert_eq!(count_80, 1);
        assert_eq!(count_443, 1);
        assert!(rules.iter().any(|r| r.port.as_deref() == Some("9000")));
    }

    #[test]
    fn test_rule_serialization_shape() {
        let rule = FirewallRule::open_tcp("80", MANAGED_RULE_TAG);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["direction"], "in");
        assert_eq!(json["protocol"], "tcp");
        assert_eq!(json["port"], "80");
        assert_eq!(json["description"], "exposer");
        assert_eq!(json["source_ips"][0], "0.0.0.0/0");
    }

    #[tokio::test]
    async fn test_rules_error_when_disabled() {
        let client = FirewallClient::new(None, None);
        assert!(matches!(
            client.rules().await,
            Err(FirewallError::Disabled)
        ));
        // ensure_ports_open is a silent no-op instead.
        assert!(client.ensure_ports_open(&[80]).await.is_ok());
    }
}
