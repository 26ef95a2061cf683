//! Orphan pod reconciliation.
//!
//! A crash leaves managed pods running with no session in memory. The
//! reconciler lists every managed pod and deletes those the registry does
//! not know about. It runs before the broker accepts connections and again
//! after shutdown has drained live sessions.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::{ClusterError, PodCluster, MANAGED_LABEL_SELECTOR};
use crate::lifecycle::PodLifecycle;

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Orphans a delete was issued for.
    pub deleted: Vec<String>,
    /// Managed pods left alone because a live session owns them.
    pub retained: Vec<String>,
}

/// Deletes managed pods that no live session owns.
pub struct OrphanReconciler<C> {
    lifecycle: Arc<PodLifecycle<C>>,
}

impl<C: PodCluster> OrphanReconciler<C> {
    pub fn new(lifecycle: Arc<PodLifecycle<C>>) -> Self {
        Self { lifecycle }
    }

    /// Runs one sweep.
    ///
    /// Fails only if the pod list cannot be fetched. Individual deletes are
    /// best-effort.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ClusterError> {
        let pods = self
            .lifecycle
            .cluster()
            .list_pods(MANAGED_LABEL_SELECTOR)
            .await?;

        let registry = self.lifecycle.registry();
        let mut report = ReconcileReport::default();

        for pod in pods {
            if registry.contains(&pod) {
                debug!(pod = %pod, "Keeping pod owned by a live session");
                report.retained.push(pod);
                continue;
            }

            info!(pod = %pod, "Deleting orphaned pod");
            self.lifecycle.delete_safe(&pod).await;
            report.deleted.push(pod);
        }

        info!(
            deleted = report.deleted.len(),
            retained = report.retained.len(),
            "Reconciliation complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, PodPhase, PodStatusView};
    use crate::registry::SessionRegistry;

    fn running() -> PodStatusView {
        PodStatusView::new(PodPhase::Running, true)
    }

    fn setup() -> (Arc<InMemoryCluster>, Arc<PodLifecycle<InMemoryCluster>>) {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = Arc::new(PodLifecycle::new(
            Arc::clone(&cluster),
            Arc::new(SessionRegistry::new()),
        ));
        (cluster, lifecycle)
    }

    #[tokio::test]
    async fn test_deletes_orphans_and_keeps_owned() {
        let (cluster, lifecycle) = setup();
        cluster.insert_pod("user-11111", &[("app", "terminal-pod")], running());
        cluster.insert_pod("user-22222", &[("app", "terminal-pod")], running());
        cluster.insert_pod("user-33333", &[("app", "terminal-pod")], running());
        lifecycle.registry().store("user-22222");

        let report = OrphanReconciler::new(Arc::clone(&lifecycle))
            .reconcile()
            .await
            .unwrap();

        assert_eq!(report.deleted, vec!["user-11111", "user-33333"]);
        assert_eq!(report.retained, vec!["user-22222"]);
        assert_eq!(cluster.pod_names(), vec!["user-22222".to_string()]);
    }

    #[tokio::test]
    async fn test_ignores_unmanaged_pods() {
        let (cluster, lifecycle) = setup();
        cluster.insert_pod("web-0", &[("app", "web")], running());
        cluster.insert_pod("db-0", &[], running());

        let report = OrphanReconciler::new(lifecycle).reconcile().await.unwrap();

        assert_eq!(report, ReconcileReport::default());
        assert_eq!(cluster.pod_names(), vec!["db-0".to_string(), "web-0".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_cluster() {
        let (_cluster, lifecycle) = setup();
        let report = OrphanReconciler::new(lifecycle).reconcile().await.unwrap();
        assert!(report.deleted.is_empty());
        assert!(report.retained.is_empty());
    }

    #[tokio::test]
    async fn test_list_failure_is_reported() {
        let (cluster, lifecycle) = setup();
        cluster.insert_pod("user-11111", &[("app", "terminal-pod")], running());
        cluster.fail_lists("forbidden");

        let result = OrphanReconciler::new(lifecycle).reconcile().await;
        assert!(matches!(result, Err(ClusterError::Api(_))));
        assert!(cluster.has_pod("user-11111"));
    }

    #[tokio::test]
    async fn test_delete_failures_do_not_abort_sweep() {
        let (cluster, lifecycle) = setup();
        cluster.insert_pod("user-11111", &[("app", "terminal-pod")], running());
        cluster.insert_pod("user-22222", &[("app", "terminal-pod")], running());
        cluster.fail_deletes("conflict");

        let report = OrphanReconciler::new(lifecycle).reconcile().await.unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(cluster.pod_names().len(), 2);
    }
}
