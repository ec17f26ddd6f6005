//! Service registry: owns the listeners and the per-protocol port
//! allocation table.
//!
//! All mutation runs under a single write lock; readers snapshot under the
//! read lock. Within one update, removals and replacements happen before
//! additions, so a subdomain whose config changed briefly has zero
//! listeners rather than two.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use exposer_proto::{ExposedService, PortMapping, Protocol};

use crate::forwarder::Forwarder;
use crate::listener::PortListener;

/// A single transport an allocation occupies. TCP and UDP are independent
/// namespaces; a `tcp+udp` mapping occupies the same number in both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    Tcp,
    Udp,
}

fn flows(protocol: Protocol) -> &'static [Flow] {
    match protocol {
        Protocol::Tcp => &[Flow::Tcp],
        Protocol::Udp => &[Flow::Udp],
        Protocol::TcpUdp => &[Flow::Tcp, Flow::Udp],
    }
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no available ports in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },
}

struct ServiceEntry {
    service: ExposedService,
    /// Keys of the listeners started for this service, by allocated port.
    /// Allocated ports can differ from requested ports after a remap.
    listener_keys: Vec<(u16, Protocol)>,
}

#[derive(Default)]
struct Inner {
    services: HashMap<String, ServiceEntry>,
    listeners: HashMap<(u16, Protocol), PortListener>,
    allocated: HashSet<(u16, Flow)>,
}

/// Registry of exposed services and their port listeners.
pub struct ServiceRegistry {
    inner: RwLock<Inner>,
    range_start: u16,
    range_end: u16,
    forwarder: Arc<Forwarder>,
}

impl ServiceRegistry {
    pub fn new(range_start: u16, range_end: u16, forwarder: Arc<Forwarder>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            range_start,
            range_end,
            forwarder,
        }
    }

    /// Apply a full desired state: tear down services that disappeared or
    /// changed, then add what is new. Per-port failures are logged and do
    /// not fail the rest of the update.
    pub async fn update(&self, desired: Vec<ExposedService>) {
        let mut inner = self.inner.write().await;

        info!(count = desired.len(), "updating service registry");

        let mut desired_map: HashMap<String, ExposedService> = HashMap::new();
        for svc in desired {
            desired_map.insert(svc.subdomain.clone(), svc);
        }

        // Removals and replacements first.
        let current: Vec<String> = inner.services.keys().cloned().collect();
        for subdomain in current {
            let unchanged = desired_map
                .get(&subdomain)
                .map(|new_svc| services_equal(&inner.services[&subdomain].service, new_svc));

            match unchanged {
                None => {
                    info!(%subdomain, "removing service");
                    Self::remove_locked(&mut inner, &subdomain).await;
                }
                Some(true) => {
                    // Structurally identical: leave the listeners alone.
                    desired_map.remove(&subdomain);
                }
                Some(false) => {
                    info!(%subdomain, "service configuration changed");
                    Self::remove_locked(&mut inner, &subdomain).await;
                }
            }
        }

        // Then additions.
        for (subdomain, svc) in desired_map {
            info!(%subdomain, "adding service");
            self.add_locked(&mut inner, svc).await;
        }

        info!(active_services = inner.services.len(), "service registry updated");
    }

    /// Remove one service and free everything it held.
    pub async fn remove_service(&self, subdomain: &str) {
        let mut inner = self.inner.write().await;
        Self::remove_locked(&mut inner, subdomain).await;
    }

    /// Snapshot of the registered services.
    pub async fn services(&self) -> Vec<ExposedService> {
        let inner = self.inner.read().await;
        inner
            .services
            .values()
            .map(|entry| entry.service.clone())
            .collect()
    }

    pub async fn get_service(&self, subdomain: &str) -> Option<ExposedService> {
        let inner = self.inner.read().await;
        inner
            .services
            .get(subdomain)
            .map(|entry| entry.service.clone())
    }

    pub async fn listener_count(&self) -> usize {
        self.inner.read().await.listeners.len()
    }

    pub async fn is_allocated(&self, port: u16, flow: Flow) -> bool {
        self.inner.read().await.allocated.contains(&(port, flow))
    }

    /// Id of the listener serving `(port, protocol)`, if any. Stable ids
    /// across updates prove the absence of listener churn.
    pub async fn listener_id(&self, port: u16, protocol: Protocol) -> Option<u64> {
        self.inner
            .read()
            .await
            .listeners
            .get(&(port, protocol))
            .map(|l| l.id())
    }

    /// Stop every listener and clear the registry.
    pub async fn close(&self) {
        let mut inner = self.inner.write().await;

        info!("closing service registry");

        for (_, listener) in inner.listeners.drain() {
            listener.stop().await;
        }
        inner.services.clear();
        inner.allocated.clear();
    }

    async fn add_locked(&self, inner: &mut Inner, svc: ExposedService) {
        let subdomain = svc.subdomain.clone();
        let mut listener_keys = Vec::new();

        for mapping in svc.ports.clone() {
            let port = match self.allocate_locked(inner, &mapping) {
                Ok(port) => port,
                Err(e) => {
                    error!(
                        %subdomain,
                        port = mapping.port,
                        protocol = %mapping.protocol,
                        error = %e,
                        "failed to allocate port"
                    );
                    continue;
                }
            };

            match PortListener::start(port, &svc, &mapping, self.forwarder.clone()).await {
                Ok(listener) => {
                    inner.listeners.insert((port, mapping.protocol), listener);
                    listener_keys.push((port, mapping.protocol));
                }
                Err(e) => {
                    error!(
                        %subdomain,
                        port,
                        protocol = %mapping.protocol,
                        error = %e,
                        "failed to start listener"
                    );
                    Self::deallocate_locked(inner, port, mapping.protocol);
                }
            }
        }

        inner.services.insert(
            subdomain,
            ServiceEntry {
                service: svc,
                listener_keys,
            },
        );
    }

    async fn remove_locked(inner: &mut Inner, subdomain: &str) {
        let Some(entry) = inner.services.remove(subdomain) else {
            return;
        };

        for key in entry.listener_keys {
            if let Some(listener) = inner.listeners.remove(&key) {
                listener.stop().await;
            }
            Self::deallocate_locked(inner, key.0, key.1);
        }
    }

    /// Allocate a port for a mapping: the requested port if every flow it
    /// needs is free, else the first number in the configured range free
    /// for all of them.
    fn allocate_locked(&self, inner: &mut Inner, mapping: &PortMapping) -> Result<u16, RegistryError> {
        let wanted = flows(mapping.protocol);

        if wanted.iter().all(|f| !inner.allocated.contains(&(mapping.port, *f))) {
            for f in wanted {
                inner.allocated.insert((mapping.port, *f));
            }
            return Ok(mapping.port);
        }

        for port in self.range_start..=self.range_end {
            if wanted.iter().all(|f| !inner.allocated.contains(&(port, *f))) {
                for f in wanted {
                    inner.allocated.insert((port, *f));
                }
                warn!(
                    requested = mapping.port,
                    allocated = port,
                    protocol = %mapping.protocol,
                    "port conflict, allocated alternative"
                );
                return Ok(port);
            }
        }

        Err(RegistryError::PortExhausted {
            start: self.range_start,
            end: self.range_end,
        })
    }

    fn deallocate_locked(inner: &mut Inner, port: u16, protocol: Protocol) {
        for f in flows(protocol) {
            inner.allocated.remove(&(port, *f));
        }
    }
}

/// Structural comparison: identity fields plus the ordered port list by
/// port and protocol.
fn services_equal(a: &ExposedService, b: &ExposedService) -> bool {
    if a.name != b.name
        || a.namespace != b.namespace
        || a.subdomain != b.subdomain
        || a.target_ip != b.target_ip
        || a.ports.len() != b.ports.len()
    {
        return false;
    }
    a.ports
        .iter()
        .zip(&b.ports)
        .all(|(pa, pb)| pa.port == pb.port && pa.protocol == pb.protocol)
}
