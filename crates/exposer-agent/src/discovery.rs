//! Discovery of annotated cluster services.
//!
//! A service opts into exposure with two annotations, `<prefix>/subdomain`
//! and `<prefix>/ports`. Discovery lists all services, filters on the
//! annotations, resolves each survivor to a concrete endpoint address, and
//! emits validated [`ExposedService`] values. Per-service problems skip
//! that service only; discovery is best-effort.

use std::collections::HashSet;
use std::str::FromStr;

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use thiserror::Error;
use tracing::{debug, info, warn};

use exposer_proto::{ExposedService, PortMapping, Protocol, ValidationError};

/// Discovery configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Annotation prefix, e.g. `expose.example.com`.
    pub annotation_prefix: String,
}

impl DiscoveryConfig {
    pub fn new(annotation_prefix: impl Into<String>) -> Self {
        Self {
            annotation_prefix: annotation_prefix.into(),
        }
    }

    pub fn subdomain_annotation(&self) -> String {
        format!("{}/subdomain", self.annotation_prefix)
    }

    pub fn ports_annotation(&self) -> String {
        format!("{}/ports", self.annotation_prefix)
    }
}

/// Discovery errors. Most are per-service and only ever logged.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("ports annotation is empty")]
    EmptyPorts,

    #[error("invalid port token {0:?} (expected PORT/PROTOCOL)")]
    BadToken(String),

    #[error("invalid port number in {0:?}")]
    BadPort(String),

    #[error("invalid protocol in {0:?}")]
    BadProtocol(String),

    #[error("no valid ports found")]
    NoValidPorts,

    #[error("service validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("cluster api error: {0}")]
    Kube(#[from] kube::Error),
}

/// A service that carries the exposure annotations but has not been
/// resolved to an endpoint yet.
#[derive(Debug)]
struct PendingExposure {
    name: String,
    namespace: String,
    subdomain: String,
    ports: Vec<PortMapping>,
}

/// Enumerate every annotated service in the cluster and resolve it to a
/// validated [`ExposedService`].
pub async fn discover_services(
    client: &Client,
    config: &DiscoveryConfig,
) -> Result<Vec<ExposedService>, DiscoveryError> {
    let services: Api<Service> = Api::all(client.clone());
    let list = services.list(&ListParams::default()).await?;

    let mut discovered = Vec::new();
    let mut seen = HashSet::new();

    for svc in list.iter() {
        let pending = match extract_exposure(svc, config) {
            Ok(Some(pending)) => pending,
            Ok(None) => continue,
            Err(e) => {
                debug!(
                    name = svc.metadata.name.as_deref().unwrap_or(""),
                    namespace = svc.metadata.namespace.as_deref().unwrap_or(""),
                    error = %e,
                    "skipping service"
                );
                continue;
            }
        };

        let endpoints: Api<Endpoints> = Api::namespaced(client.clone(), &pending.namespace);
        let record = match endpoints.get(&pending.name).await {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    name = %pending.name,
                    namespace = %pending.namespace,
                    error = %e,
                    "skipping service without endpoint record"
                );
                continue;
            }
        };

        let Some((target_ip, endpoint_port)) = resolve_endpoint(&record) else {
            warn!(
                name = %pending.name,
                namespace = %pending.namespace,
                "skipping service with no ready endpoint"
            );
            continue;
        };

        let mut ports = pending.ports;
        // TODO: dispatch one resolved endpoint port per requested mapping;
        // today only the first mapping gets the endpoint's declared port
        // and the rest fall back to their external port number.
        if let (Some(first), Some(port)) = (ports.first_mut(), endpoint_port) {
            first.target_port = port;
        }
        if ports.len() > 1 {
            debug!(
                name = %pending.name,
                "multiple port mappings requested, only the first is endpoint-resolved"
            );
        }

        let exposed = ExposedService {
            name: pending.name,
            namespace: pending.namespace,
            subdomain: pending.subdomain,
            ports,
            target_ip,
        };

        if let Err(e) = exposed.validate() {
            debug!(name = %exposed.name, error = %e, "skipping invalid service");
            continue;
        }

        if !seen.insert(exposed.subdomain.clone()) {
            warn!(
                subdomain = %exposed.subdomain,
                name = %exposed.name,
                namespace = %exposed.namespace,
                "duplicate subdomain, keeping first observed service"
            );
            continue;
        }

        discovered.push(exposed);
    }

    info!(count = discovered.len(), "discovered exposed services");
    Ok(discovered)
}

/// Read the exposure annotations off a service. `Ok(None)` means the
/// service simply does not opt in.
fn extract_exposure(
    svc: &Service,
    config: &DiscoveryConfig,
) -> Result<Option<PendingExposure>, DiscoveryError> {
    let annotations = match &svc.metadata.annotations {
        Some(annotations) => annotations,
        None => return Ok(None),
    };

    let subdomain = annotations.get(&config.subdomain_annotation());
    let ports = annotations.get(&config.ports_annotation());
    let (Some(subdomain), Some(ports)) = (subdomain, ports) else {
        return Ok(None);
    };

    let ports = parse_ports(ports)?;

    Ok(Some(PendingExposure {
        name: svc.metadata.name.clone().unwrap_or_default(),
        namespace: svc.metadata.namespace.clone().unwrap_or_default(),
        subdomain: subdomain.clone(),
        ports,
    }))
}

/// Parse a ports annotation such as `"25565/tcp, 25565/udp"`.
fn parse_ports(annotation: &str) -> Result<Vec<PortMapping>, DiscoveryError> {
    if annotation.trim().is_empty() {
        return Err(DiscoveryError::EmptyPorts);
    }

    let mut ports = Vec::new();
    for token in annotation.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        let Some((port, protocol)) = token.split_once('/') else {
            return Err(DiscoveryError::BadToken(token.to_string()));
        };
        if protocol.contains('/') {
            return Err(DiscoveryError::BadToken(token.to_string()));
        }

        let port: u16 = port
            .trim()
            .parse()
            .ok()
            .filter(|p| *p >= 1)
            .ok_or_else(|| DiscoveryError::BadPort(token.to_string()))?;
        let protocol = Protocol::from_str(&protocol.trim().to_lowercase())
            .map_err(|_| DiscoveryError::BadProtocol(token.to_string()))?;

        ports.push(PortMapping {
            port,
            target_port: 0,
            protocol,
        });
    }

    if ports.is_empty() {
        return Err(DiscoveryError::NoValidPorts);
    }
    Ok(ports)
}

/// Pick the first address of the first ready subset, and that subset's
/// first declared port.
fn resolve_endpoint(record: &Endpoints) -> Option<(String, Option<u16>)> {
    let subsets = record.subsets.as_deref()?;

    for subset in subsets {
        let Some(addresses) = subset.addresses.as_deref() else {
            continue;
        };
        let Some(address) = addresses.first() else {
            continue;
        };

        let port = subset
            .ports
            .as_deref()
            .and_then(|ports| ports.first())
            .and_then(|p| u16::try_from(p.port).ok());

        return Some((address.ip.clone(), port));
    }

    None
}
