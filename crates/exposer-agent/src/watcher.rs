//! Change-driven watch over the cluster's services.
//!
//! Every add/update/delete event triggers a full re-enumeration of the
//! annotated subset rather than an incremental delta; the set is small and
//! each emitted list is a complete snapshot, so bursts coalesce naturally
//! at the receiving channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use exposer_proto::ExposedService;

use crate::discovery::{discover_services, DiscoveryConfig};

/// Callback invoked with the full resolved service list.
pub type OnChange = Arc<
    dyn Fn(Vec<ExposedService>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync,
>;

/// Watches cluster services and re-enumerates on every change.
pub struct ServiceWatcher {
    client: Client,
    config: DiscoveryConfig,
    on_change: OnChange,
}

impl ServiceWatcher {
    pub fn new(client: Client, config: DiscoveryConfig, on_change: OnChange) -> Self {
        Self {
            client,
            config,
            on_change,
        }
    }

    /// Run the watch until shutdown. Watch errors are logged and retried;
    /// the periodic re-scan elsewhere covers anything missed meanwhile.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("starting service watcher");

        let api: Api<Service> = Api::all(self.client.clone());
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("service watcher stopping");
                    return;
                }
                event = events.try_next() => match event {
                    Ok(Some(watcher::Event::InitDone)) => {
                        debug!("watch cache synced");
                        self.refresh().await;
                    }
                    Ok(Some(watcher::Event::Apply(_) | watcher::Event::Delete(_))) => {
                        debug!("service change detected");
                        self.refresh().await;
                    }
                    Ok(Some(watcher::Event::Init | watcher::Event::InitApply(_))) => {}
                    Ok(None) => {
                        warn!("watch stream ended");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "watch error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    async fn refresh(&self) {
        match discover_services(&self.client, &self.config).await {
            Ok(services) => (self.on_change)(services).await,
            Err(e) => error!(error = %e, "failed to discover services"),
        }
    }
}
