//! Reconciliation of external collaborators with the service registry:
//! the HAProxy domain map and generated config, and the cloud-firewall
//! rule set.

pub mod controller;
pub mod firewall;
pub mod haproxy;

pub use controller::{ReconcileError, Reconciler, ReconcilerConfig, ServiceSource};
pub use firewall::{FirewallClient, FirewallError, FirewallRule, MANAGED_RULE_TAG};
pub use haproxy::{BackendConfig, ConfigGenerator, HaproxyClient, HaproxyError};
