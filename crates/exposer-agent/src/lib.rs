//! Cluster agent library: discovery of annotated services, the
//! change-driven watch, and the client loop that pushes desired state to
//! the edge server.

pub mod client;
pub mod discovery;
pub mod watcher;

pub use client::ServerClient;
pub use discovery::{discover_services, DiscoveryConfig, DiscoveryError};
pub use watcher::{OnChange, ServiceWatcher};
