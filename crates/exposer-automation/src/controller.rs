//! Reconciliation loop aligning HAProxy and the cloud firewall with the
//! currently registered services.
//!
//! Runs on a timer with an on-demand trigger. HAProxy failures fail the
//! cycle; firewall failures are logged only. Reconciliation is additive on
//! the proxy: mappings for domains no longer in desired state are left in
//! place to stay safe against racing external edits.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use exposer_proto::ExposedService;

use crate::firewall::FirewallClient;
use crate::haproxy::{BackendConfig, ConfigGenerator, HaproxyClient, HaproxyError};

/// Thunk handing the reconciler the current registered service list.
pub type ServiceSource = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Vec<ExposedService>> + Send>> + Send + Sync,
>;

/// Reconciler errors. Only proxy-side problems surface; the firewall is
/// best-effort.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("haproxy reconciliation failed: {0}")]
    Haproxy(#[from] HaproxyError),

    #[error("haproxy socket unreachable after {0} attempts")]
    StartupBudgetExhausted(u32),
}

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub haproxy_socket: PathBuf,
    pub haproxy_map: PathBuf,
    pub haproxy_config: PathBuf,
    pub cert_dir: PathBuf,
    pub firewall_token: Option<String>,
    pub firewall_id: Option<String>,
    pub domain: String,
    pub interval: Duration,
    /// Grace period before the first cycle so a connecting agent can push
    /// state first.
    pub settle_delay: Duration,
    /// Startup attempts to reach the proxy admin socket.
    pub startup_attempts: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            haproxy_socket: PathBuf::from("/var/run/haproxy.sock"),
            haproxy_map: PathBuf::from("/etc/haproxy/domains.map"),
            haproxy_config: PathBuf::from("/etc/haproxy/haproxy.cfg"),
            cert_dir: PathBuf::from("/etc/ssl/private"),
            firewall_token: None,
            firewall_id: None,
            domain: "example.com".to_string(),
            interval: Duration::from_secs(30),
            settle_delay: Duration::from_secs(5),
            startup_attempts: 30,
        }
    }
}

/// The reconciler: timer-driven with an on-demand trigger.
pub struct Reconciler {
    haproxy: HaproxyClient,
    generator: ConfigGenerator,
    firewall: FirewallClient,
    domain: String,
    haproxy_config: PathBuf,
    interval: Duration,
    settle_delay: Duration,
    startup_attempts: u32,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    cycles: AtomicU64,
    errors: AtomicU64,
    last_success: std::sync::Mutex<Option<SystemTime>>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        Self {
            haproxy: HaproxyClient::new(&config.haproxy_socket, &config.haproxy_map),
            generator: ConfigGenerator::new(&config.haproxy_map, &config.cert_dir),
            firewall: FirewallClient::new(config.firewall_token, config.firewall_id),
            domain: config.domain,
            haproxy_config: config.haproxy_config,
            interval: config.interval,
            settle_delay: config.settle_delay,
            startup_attempts: config.startup_attempts,
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            cycles: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_success: std::sync::Mutex::new(None),
        }
    }

    /// Request an out-of-band cycle. Coalesces with any pending request;
    /// the single run loop serializes execution.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    pub fn reconciliations(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn reconciliation_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn last_success(&self) -> Option<SystemTime> {
        *self.last_success.lock().expect("last_success lock")
    }

    /// Run until shutdown. Fails only if the proxy socket never becomes
    /// reachable within the startup budget.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        source: ServiceSource,
    ) -> Result<(), ReconcileError> {
        info!(
            domain = %self.domain,
            interval_secs = self.interval.as_secs(),
            firewall_enabled = self.firewall.enabled(),
            "starting reconciler"
        );

        if !self.wait_for_haproxy(&mut shutdown).await? {
            return Ok(());
        }

        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = tokio::time::sleep(self.settle_delay) => {}
        }

        let mut trigger_rx = self
            .trigger_rx
            .lock()
            .await
            .take()
            .expect("reconciler run called twice");

        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("reconciler stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
                Some(()) = trigger_rx.recv() => debug!("on-demand reconciliation requested"),
            }

            let services = source().await;
            if let Err(e) = self.reconcile(&services).await {
                error!(error = %e, "reconciliation failed");
            }
        }
    }

    /// One reconciliation cycle over the given service list.
    pub async fn reconcile(&self, services: &[ExposedService]) -> Result<(), ReconcileError> {
        info!(service_count = services.len(), "starting reconciliation");

        let mut desired_mappings = HashMap::new();
        let mut desired_ports = Vec::new();
        let mut backends = Vec::new();

        for svc in services {
            let Some(first) = svc.ports.first() else {
                continue;
            };

            let fqdn = format!("{}.{}", svc.subdomain, self.domain);
            desired_mappings.insert(fqdn, format!("backend_{}", first.port));
            desired_ports.push(first.port);
            backends.push(BackendConfig {
                name: svc.name.clone(),
                port: first.port,
            });
        }

        if let Err(e) = self.reconcile_haproxy(&desired_mappings, &backends).await {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }

        if let Err(e) = self.firewall.ensure_ports_open(&desired_ports).await {
            warn!(error = %e, "firewall reconciliation failed");
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        *self.last_success.lock().expect("last_success lock") = Some(SystemTime::now());

        info!(
            domains = desired_mappings.len(),
            ports = desired_ports.len(),
            "reconciliation complete"
        );
        Ok(())
    }

    /// Additive sync of the domain map, then a full config regeneration.
    async fn reconcile_haproxy(
        &self,
        desired: &HashMap<String, String>,
        backends: &[BackendConfig],
    ) -> Result<(), HaproxyError> {
        let current = self.haproxy.current_mappings().await?;

        for (fqdn, backend) in desired {
            match current.get(fqdn) {
                Some(existing) if existing == backend => continue,
                Some(_) => {
                    // Backend changed: replace the mapping.
                    if let Err(e) = self.haproxy.remove_mapping(fqdn).await {
                        warn!(domain = %fqdn, error = %e, "failed to remove stale mapping");
                    }
                    self.haproxy.add_mapping(fqdn, backend).await?;
                    info!(domain = %fqdn, backend = %backend, "replaced domain mapping");
                }
                None => {
                    self.haproxy.add_mapping(fqdn, backend).await?;
                    info!(domain = %fqdn, backend = %backend, "added domain mapping");
                }
            }
        }

        self.generator
            .generate(backends, &self.haproxy_config)
            .await?;
        debug!(backends = backends.len(), "regenerated haproxy config");

        Ok(())
    }

    /// Block until the proxy socket answers, with 1-second-incrementing
    /// backoff. Returns `Ok(false)` if shutdown interrupted the wait.
    async fn wait_for_haproxy(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, ReconcileError> {
        for attempt in 1..=self.startup_attempts {
            match self.haproxy.validate().await {
                Ok(()) => return Ok(true),
                Err(e) => warn!(attempt, error = %e, "haproxy not ready, retrying"),
            }

            tokio::select! {
                _ = shutdown.changed() => return Ok(false),
                _ = tokio::time::sleep(Duration::from_secs(attempt as u64)) => {}
            }
        }

        match self.haproxy.validate().await {
            Ok(()) => Ok(true),
            Err(_) => Err(ReconcileError::StartupBudgetExhausted(
                self.startup_attempts,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exposer_proto::{PortMapping, Protocol};
    use std::path::Path;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixListener;

    fn service(subdomain: &str, port: u16) -> ExposedService {
        ExposedService {
            name: subdomain.to_string(),
            namespace: "default".to_string(),
            subdomain: subdomain.to_string(),
            ports: vec![PortMapping {
                port,
                target_port: 0,
                protocol: Protocol::Tcp,
            }],
            target_ip: "10.0.0.1".to_string(),
        }
    }

    async fn spawn_fake_socket(path: &Path) -> tokio::sync::mpsc::UnboundedReceiver<String> {
        let listener = UnixListener::bind(path).unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut reader = tokio::io::BufReader::new(stream);
                    let mut command = String::new();
                    let _ = reader.read_line(&mut command).await;
                    let _ = tx.send(command.trim_end().to_string());
                });
            }
        });
        rx
    }

    fn reconciler_in(dir: &Path) -> Reconciler {
        Reconciler::new(ReconcilerConfig {
            haproxy_socket: dir.join("haproxy.sock"),
            haproxy_map: dir.join("domains.map"),
            haproxy_config: dir.join("haproxy.cfg"),
            cert_dir: dir.join("certs"),
            domain: "example.com".to_string(),
            ..ReconcilerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_reconcile_adds_missing_mapping_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut commands = spawn_fake_socket(&dir.path().join("haproxy.sock")).await;

        // The map already knows web; api is missing.
        let map = dir.path().join("domains.map");
        std::fs::write(&map, "web.example.com backend_80\n").unwrap();

        let reconciler = reconciler_in(dir.path());
        reconciler
            .reconcile(&[service("web", 80), service("api", 443)])
            .await
            .unwrap();

        // Exactly one runtime command, for the missing entry.
        let command = commands.recv().await.unwrap();
        assert_eq!(
            command,
            format!("add map {} api.example.com backend_443", map.display())
        );
        assert!(commands.try_recv().is_err());

        let contents = std::fs::read_to_string(&map).unwrap();
        assert!(contents.contains("web.example.com backend_80"));
        assert!(contents.contains("api.example.com backend_443"));

        // The generated config covers both backends.
        let config = std::fs::read_to_string(dir.path().join("haproxy.cfg")).unwrap();
        assert!(config.contains("backend backend_80"));
        assert!(config.contains("backend backend_443"));

        assert_eq!(reconciler.reconciliations(), 1);
        assert_eq!(reconciler.reconciliation_errors(), 0);
        assert!(reconciler.last_success().is_some());
    }

    #[tokio::test]
    async fn test_reconcile_replaces_changed_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut commands = spawn_fake_socket(&dir.path().join("haproxy.sock")).await;

        let map = dir.path().join("domains.map");
        std::fs::write(&map, "web.example.com backend_8080\n").unwrap();

        let reconciler = reconciler_in(dir.path());
        reconciler.reconcile(&[service("web", 80)]).await.unwrap();

        let first = commands.recv().await.unwrap();
        let second = commands.recv().await.unwrap();
        assert!(first.starts_with(&format!("del map {} web.example.com", map.display())));
        assert!(second.starts_with(&format!("add map {} web.example.com backend_80", map.display())));

        let contents = std::fs::read_to_string(&map).unwrap();
        assert!(contents.contains("web.example.com backend_80"));
        assert!(!contents.contains("backend_8080"));
    }

    #[tokio::test]
    async fn test_reconcile_is_additive_for_unmanaged_entries() {
        let dir = tempfile::tempdir().unwrap();
        let _commands = spawn_fake_socket(&dir.path().join("haproxy.sock")).await;

        let map = dir.path().join("domains.map");
        std::fs::write(&map, "legacy.example.com backend_9999\n").unwrap();

        let reconciler = reconciler_in(dir.path());
        reconciler.reconcile(&[service("web", 80)]).await.unwrap();

        // The stale entry survives; removal is out of scope for safety.
        let contents = std::fs::read_to_string(&map).unwrap();
        assert!(contents.contains("legacy.example.com backend_9999"));
        assert!(contents.contains("web.example.com backend_80"));
    }

    #[tokio::test]
    async fn test_proxy_failure_fails_cycle_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        // No fake socket: runtime commands cannot be issued.

        // Seed a mapping for a different backend so the cycle must talk to
        // the (dead) socket.
        let map = dir.path().join("domains.map");
        std::fs::write(&map, "").unwrap();

        let reconciler = reconciler_in(dir.path());
        let err = reconciler.reconcile(&[service("web", 80)]).await;
        assert!(err.is_err());
        assert_eq!(reconciler.reconciliation_errors(), 1);
        assert_eq!(reconciler.reconciliations(), 0);
        assert!(reconciler.last_success().is_none());
    }

    #[tokio::test]
    async fn test_services_without_ports_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let _commands = spawn_fake_socket(&dir.path().join("haproxy.sock")).await;

        let mut empty = service("ghost", 80);
        empty.ports.clear();

        let reconciler = reconciler_in(dir.path());
        reconciler.reconcile(&[empty]).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join("domains.map"))
            .unwrap_or_default();
        assert!(!contents.contains("ghost"));
    }

    #[tokio::test]
    async fn test_startup_budget_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(ReconcilerConfig {
            haproxy_socket: dir.path().join("never.sock"),
            haproxy_map: dir.path().join("domains.map"),
            haproxy_config: dir.path().join("haproxy.cfg"),
            cert_dir: dir.path().join("certs"),
            startup_attempts: 1,
            ..ReconcilerConfig::default()
        });

        let (_tx, shutdown) = watch::channel(false);
        let source: ServiceSource = Arc::new(|| Box::pin(async { Vec::new() }));

        let err = reconciler.run(shutdown, source).await.unwrap_err();
        assert!(matches!(err, ReconcileError::StartupBudgetExhausted(1)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_during_startup_wait() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Arc::new(Reconciler::new(ReconcilerConfig {
            haproxy_socket: dir.path().join("never.sock"),
            haproxy_map: dir.path().join("domains.map"),
            haproxy_config: dir.path().join("haproxy.cfg"),
            cert_dir: dir.path().join("certs"),
            ..ReconcilerConfig::default()
        }));

        let (tx, shutdown) = watch::channel(false);
        let source: ServiceSource = Arc::new(|| Box::pin(async { Vec::new() }));

        let handle = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.run(shutdown, source).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not stop on shutdown")
            .unwrap();
        assert!(result.is_ok());
    }
}
