//! Traffic assertions against the sample app.
//!
//! Every check records its outcomes into the caller's [`crate::report::Tally`]
//! and returns whether it passed. `Err` is reserved for fatal conditions
//! (cluster command failures, missing fixtures, and default-route exhaustion).

pub mod default_route;
pub mod fault_delay;
pub mod traffic_split;
pub mod version_routing;

pub use default_route::check_default_route;
pub use fault_delay::{check_fault_delay, DelayExpectation, DelayPhase, DelayWindow};
pub use traffic_split::{check_traffic_split, SplitTarget};
pub use version_routing::check_version_routing;

use crate::cluster::MeshCluster;
use crate::eventual::RetryPolicy;
use crate::fixtures::FixtureSet;
use crate::probe::ProductPageClient;
use std::time::Duration;
use tracing::warn;

/// Everything a check needs to talk to the cluster and the ingress.
pub struct CheckContext<'a> {
    pub cluster: &'a dyn MeshCluster,
    pub namespace: &'a str,
    pub page: &'a ProductPageClient,
    pub fixtures: &'a FixtureSet,
    pub retry: RetryPolicy,
    /// Blind wait after each rule change.
    pub propagation: Duration,
}

impl CheckContext<'_> {
    /// Log a snapshot of the namespace after a failed assertion.
    pub async fn dump_debug(&self) {
        match self.cluster.dump_debug(self.namespace).await {
            Ok(state) => warn!(namespace = %self.namespace, "Cluster state after failure:\n{}", state),
            Err(e) => warn!(namespace = %self.namespace, error = %e, "Failed to collect diagnostics"),
        }
    }
}
