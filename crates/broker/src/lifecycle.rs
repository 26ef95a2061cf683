//! Pod lifecycle management.
//!
//! Creates session pods (retrying on name collisions and transient
//! failures), waits for them to become ready, and tears them down. Every
//! blocking step observes a [`CancellationToken`] so client disconnects and
//! process shutdown can interrupt it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{build_pod, ClusterError, PodCluster, PodPhase};
use crate::naming::{generate_pod_name, rename_after_collision};
use crate::registry::SessionRegistry;

/// Pause before retrying a create that failed for a reason other than a
/// name collision.
pub const CREATE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between readiness polls.
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a single delete call.
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from provisioning a pod.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The pod did not become ready in time.
    #[error("pod {pod} not ready within {timeout:?}")]
    DeadlineExceeded { pod: String, timeout: Duration },

    /// The pod reached a phase it cannot leave.
    #[error("pod {pod} terminated in phase {phase:?} before becoming ready")]
    PodTerminated { pod: String, phase: PodPhase },

    /// Every create attempt failed.
    #[error("after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: u32, last: ClusterError },

    /// `max_attempts` was zero.
    #[error("max_attempts must be at least 1")]
    InvalidAttempts,

    /// The orchestrator failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Creates, watches and deletes session pods.
pub struct PodLifecycle<C> {
    cluster: Arc<C>,
    registry: Arc<SessionRegistry>,
    retry_interval: Duration,
    poll_interval: Duration,
    delete_timeout: Duration,
}

impl<C: PodCluster> PodLifecycle<C> {
    /// Creates a lifecycle manager with the default timings.
    pub fn new(cluster: Arc<C>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            cluster,
            registry,
            retry_interval: CREATE_RETRY_INTERVAL,
            poll_interval: READY_POLL_INTERVAL,
            delete_timeout: DELETE_TIMEOUT,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    pub fn cluster(&self) -> &Arc<C> {
        &self.cluster
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Submits the session pod specification under `pod_name`.
    pub async fn create_pod(&self, pod_name: &str) -> Result<(), ClusterError> {
        self.cluster.create_pod(&build_pod(pod_name)).await
    }

    /// Creates a pod for `user_id`, retrying up to `max_attempts` times.
    ///
    /// A name collision renames the pod and retries immediately; any other
    /// failure waits for the retry interval and retries under the same
    /// name. On success the accepted name is stored in the registry and
    /// returned.
    pub async fn create_with_retry(
        &self,
        user_id: &str,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<String, LifecycleError> {
        if max_attempts == 0 {
            return Err(LifecycleError::InvalidAttempts);
        }

        let mut pod_name = generate_pod_name(user_id);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(LifecycleError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
                result = self.create_pod(&pod_name) => result,
            };

            let err = match result {
                Ok(()) => {
                    self.registry.store(&pod_name);
                    info!(pod = %pod_name, user_id = %user_id, attempt, "Created pod");
                    return Ok(pod_name);
                }
                Err(err) => err,
            };

            if attempt >= max_attempts {
                warn!(pod = %pod_name, attempts = attempt, error = %err, "Giving up on pod creation");
                return Err(LifecycleError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            if err.is_already_exists() {
                let renamed = rename_after_collision(&pod_name);
                warn!(pod = %pod_name, renamed = %renamed, attempt, "Pod name collision, retrying");
                pod_name = renamed;
            } else {
                warn!(pod = %pod_name, attempt, error = %err, "Pod creation failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
                    _ = tokio::time::sleep(self.retry_interval) => {}
                }
            }
        }
    }

    /// Polls until the pod is running and ready.
    ///
    /// The first poll happens immediately. Fails with `DeadlineExceeded`
    /// once `timeout` elapses, `Cancelled` when `cancel` fires, and with
    /// the orchestrator error if a status fetch fails.
    pub async fn wait_for_ready(
        &self,
        pod_name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let expired = || LifecycleError::DeadlineExceeded {
            pod: pod_name.to_string(),
            timeout,
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
                _ = &mut deadline => return Err(expired()),
                _ = ticker.tick() => {}
            }

            let status = tokio::select! {
                _ = cancel.cancelled() => return Err(LifecycleError::Cancelled),
                _ = &mut deadline => return Err(expired()),
                status = self.cluster.pod_status(pod_name) => status?,
            };

            if status.is_ready() {
                info!(pod = %pod_name, "Pod is ready");
                return Ok(());
            }

            if matches!(status.phase, PodPhase::Succeeded | PodPhase::Failed) {
                return Err(LifecycleError::PodTerminated {
                    pod: pod_name.to_string(),
                    phase: status.phase,
                });
            }

            debug!(pod = %pod_name, phase = ?status.phase, ready = status.ready, "Pod not ready yet");
        }
    }

    /// Deletes a pod without ever failing.
    ///
    /// The call is bounded by the delete timeout. Failures are logged and
    /// left for the orphan reconciler.
    pub async fn delete_safe(&self, pod_name: &str) {
        match tokio::time::timeout(self.delete_timeout, self.cluster.delete_pod(pod_name)).await {
            Ok(Ok(())) => info!(pod = %pod_name, "Deleted pod"),
            Ok(Err(ClusterError::NotFound(_))) => {
                debug!(pod = %pod_name, "Pod already gone");
            }
            Ok(Err(e)) => warn!(pod = %pod_name, error = %e, "Failed to delete pod"),
            Err(_) => warn!(
                pod = %pod_name,
                timeout = ?self.delete_timeout,
                "Timed out deleting pod"
            ),
        }
    }

    /// Deletes the pod and drops it from the registry.
    pub async fn release(&self, pod_name: &str) {
        self.delete_safe(pod_name).await;
        self.registry.remove(pod_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, PodStatusView};
    use crate::naming::{MAX_POD_NAME_LENGTH, POD_NAME_PREFIX};

    fn lifecycle(cluster: &Arc<InMemoryCluster>) -> PodLifecycle<InMemoryCluster> {
        PodLifecycle::new(Arc::clone(cluster), Arc::new(SessionRegistry::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_first_attempt() {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = lifecycle(&cluster);

        let name = lifecycle
            .create_with_retry("alice", 3, &CancellationToken::new())
            .await
            .unwrap();

        assert!(name.starts_with(POD_NAME_PREFIX));
        assert!(name.len() <= MAX_POD_NAME_LENGTH);
        assert!(cluster.has_pod(&name));
        assert_eq!(cluster.create_calls(), 1);
        assert!(lifecycle.registry().contains(&name));
        assert_eq!(lifecycle.registry().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_after_collisions() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.fail_next_creates_with_conflict(2);
        let lifecycle = lifecycle(&cluster);

        let name = lifecycle
            .create_with_retry("alice", 3, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(cluster.create_calls(), 3);
        assert_eq!(cluster.pod_names(), vec![name.clone()]);
        assert_eq!(lifecycle.registry().names(), vec![name]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collisions_do_not_wait() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.fail_next_creates_with_conflict(2);
        let lifecycle = lifecycle(&cluster);

        let started = tokio::time::Instant::now();
        lifecycle
            .create_with_retry("alice", 3, &CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() < CREATE_RETRY_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_waits_and_keeps_name() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.fail_next_creates_with_error(1, "etcd unavailable");
        let lifecycle = lifecycle(&cluster);

        let started = tokio::time::Instant::now();
        let name = lifecycle
            .create_with_retry("alice", 3, &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() >= CREATE_RETRY_INTERVAL);
        let attempted = cluster.attempted_names();
        assert_eq!(attempted.len(), 2);
        assert_eq!(attempted[0], attempted[1]);
        assert_eq!(attempted[1], name);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_exhausted_by_conflicts() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.fail_next_creates_with_conflict(3);
        let lifecycle = lifecycle(&cluster);

        let err = lifecycle
            .create_with_retry("alice", 3, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err
            .to_string()
            .starts_with("after 3 attempts, last error: pod already exists"));
        match err {
            LifecycleError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.is_already_exists());
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(lifecycle.registry().is_empty());
        assert!(cluster.pod_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_zero_attempts() {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = lifecycle(&cluster);

        let err = lifecycle
            .create_with_retry("alice", 0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidAttempts));
        assert_eq!(cluster.create_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_cancelled_before_start() {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = lifecycle(&cluster);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = lifecycle
            .create_with_retry("alice", 3, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Cancelled));
        assert_eq!(cluster.create_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_cancelled_during_backoff() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.fail_next_creates_with_error(5, "quota exceeded");
        let lifecycle = lifecycle(&cluster);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let err = lifecycle
            .create_with_retry("alice", 5, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Cancelled));
        assert_eq!(cluster.create_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_after_transition() {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = lifecycle(&cluster);
        lifecycle.create_pod("user-aaaaa").await.unwrap();

        let flip = Arc::clone(&cluster);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            flip.set_status("user-aaaaa", PodStatusView::new(PodPhase::Running, true));
        });

        let started = tokio::time::Instant::now();
        lifecycle
            .wait_for_ready("user-aaaaa", Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3500));
        assert!(elapsed <= Duration::from_millis(3500) + READY_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_requires_condition() {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = lifecycle(&cluster);
        lifecycle.create_pod("user-bbbbb").await.unwrap();
        cluster.set_status("user-bbbbb", PodStatusView::new(PodPhase::Running, false));

        let err = lifecycle
            .wait_for_ready("user-bbbbb", Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::DeadlineExceeded { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_cancelled() {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = lifecycle(&cluster);
        lifecycle.create_pod("user-ccccc").await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let err = lifecycle
            .wait_for_ready("user-ccccc", Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_status_error() {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = lifecycle(&cluster);

        let err = lifecycle
            .wait_for_ready("user-missing", Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Cluster(ClusterError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_ready_terminal_phase() {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = lifecycle(&cluster);
        lifecycle.create_pod("user-ddddd").await.unwrap();
        cluster.set_status("user-ddddd", PodStatusView::new(PodPhase::Failed, false));

        let err = lifecycle
            .wait_for_ready("user-ddddd", Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::PodTerminated {
                phase: PodPhase::Failed,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_safe_removes_pod() {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = lifecycle(&cluster);
        lifecycle.create_pod("user-eeeee").await.unwrap();

        lifecycle.delete_safe("user-eeeee").await;
        assert!(!cluster.has_pod("user-eeeee"));
        assert_eq!(cluster.deleted_pods(), vec!["user-eeeee".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_safe_swallows_errors() {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = lifecycle(&cluster);

        // Missing pod.
        lifecycle.delete_safe("user-none0").await;

        cluster.fail_deletes("apiserver unavailable");
        lifecycle.create_pod("user-fffff").await.unwrap();
        lifecycle.delete_safe("user-fffff").await;
        assert!(cluster.has_pod("user-fffff"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_safe_is_bounded() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.hang_deletes();
        let lifecycle = lifecycle(&cluster);
        lifecycle.create_pod("user-99999").await.unwrap();

        let started = tokio::time::Instant::now();
        lifecycle.delete_safe("user-99999").await;
        assert!(started.elapsed() >= DELETE_TIMEOUT);
        assert!(started.elapsed() < DELETE_TIMEOUT + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_unregisters() {
        let cluster = Arc::new(InMemoryCluster::new());
        let lifecycle = lifecycle(&cluster);

        let name = lifecycle
            .create_with_retry("alice", 1, &CancellationToken::new())
            .await
            .unwrap();
        lifecycle.release(&name).await;

        assert!(!lifecycle.registry().contains(&name));
        assert!(!cluster.has_pod(&name));
    }
}
