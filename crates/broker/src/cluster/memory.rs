//! In-process cluster.
//!
//! Stands in for Kubernetes in tests and local development. Pods live in a
//! map, create outcomes can be scripted, deletes are recorded, and exec
//! attaches an echo shell that writes every input chunk straight back.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use k8s_openapi::api::core::v1::Pod;
use protocol::TerminalSize;

use super::{ClusterError, PodCluster, PodPhase, PodStatusView};
use crate::bridge::{TerminalInput, TerminalOutput, TerminalResize, TerminalStreams};

const ECHO_BUFFER_SIZE: usize = 4096;

/// Scripted result for the next create call.
#[derive(Debug, Clone)]
enum CreateOutcome {
    Conflict,
    Error(String),
}

#[derive(Debug, Clone)]
struct MemoryPod {
    labels: BTreeMap<String, String>,
    status: PodStatusView,
}

#[derive(Debug, Default)]
struct State {
    pods: BTreeMap<String, MemoryPod>,
    create_script: VecDeque<CreateOutcome>,
    attempted: Vec<String>,
    deleted: Vec<String>,
    resizes: Vec<TerminalSize>,
    execs: Vec<(String, Vec<String>)>,
    auto_ready: bool,
    delete_error: Option<String>,
    hang_deletes: bool,
    list_error: Option<String>,
    exec_error: Option<String>,
}

/// A cluster kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    /// Creates an empty cluster whose new pods start out pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cluster whose new pods are immediately ready.
    pub fn auto_ready() -> Self {
        let cluster = Self::new();
        cluster.lock().auto_ready = true;
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a pod directly, bypassing the create path.
    pub fn insert_pod(&self, name: &str, labels: &[(&str, &str)], status: PodStatusView) {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.lock()
            .pods
            .insert(name.to_string(), MemoryPod { labels, status });
    }

    /// Makes the next `count` creates fail with a name conflict.
    pub fn fail_next_creates_with_conflict(&self, count: usize) {
        let mut state = self.lock();
        state
            .create_script
            .extend(std::iter::repeat(CreateOutcome::Conflict).take(count));
    }

    /// Makes the next `count` creates fail with a generic error.
    pub fn fail_next_creates_with_error(&self, count: usize, message: &str) {
        let mut state = self.lock();
        state
            .create_script
            .extend(std::iter::repeat(CreateOutcome::Error(message.to_string())).take(count));
    }

    /// Makes every delete fail with `message`.
    pub fn fail_deletes(&self, message: &str) {
        self.lock().delete_error = Some(message.to_string());
    }

    /// Makes every delete block forever.
    pub fn hang_deletes(&self) {
        self.lock().hang_deletes = true;
    }

    /// Makes list calls fail with `message`.
    pub fn fail_lists(&self, message: &str) {
        self.lock().list_error = Some(message.to_string());
    }

    /// Makes exec calls fail with `message`.
    pub fn fail_execs(&self, message: &str) {
        self.lock().exec_error = Some(message.to_string());
    }

    /// Overrides the observed status of a pod.
    pub fn set_status(&self, name: &str, status: PodStatusView) {
        if let Some(pod) = self.lock().pods.get_mut(name) {
            pod.status = status;
        }
    }

    pub fn has_pod(&self, name: &str) -> bool {
        self.lock().pods.contains_key(name)
    }

    /// Names of all pods currently present, sorted.
    pub fn pod_names(&self) -> Vec<String> {
        self.lock().pods.keys().cloned().collect()
    }

    /// Number of create calls made so far.
    pub fn create_calls(&self) -> usize {
        self.lock().attempted.len()
    }

    /// Names passed to create, in call order.
    pub fn attempted_names(&self) -> Vec<String> {
        self.lock().attempted.clone()
    }

    /// Pods removed by successful deletes, in call order.
    pub fn deleted_pods(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// Terminal sizes delivered to exec sessions.
    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.lock().resizes.clone()
    }

    /// Pod name and command of each exec call.
    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.lock().execs.clone()
    }

    fn record_resize(&self, size: TerminalSize) {
        self.lock().resizes.push(size);
    }
}

impl PodCluster for InMemoryCluster {
    async fn create_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let mut state = self.lock();
        state.attempted.push(name.clone());

        match state.create_script.pop_front() {
            Some(CreateOutcome::Conflict) => return Err(ClusterError::AlreadyExists(name)),
            Some(CreateOutcome::Error(message)) => return Err(ClusterError::Api(message)),
            None => {}
        }

        if state.pods.contains_key(&name) {
            return Err(ClusterError::AlreadyExists(name));
        }

        let status = if state.auto_ready {
            PodStatusView::new(PodPhase::Running, true)
        } else {
            PodStatusView::new(PodPhase::Pending, false)
        };
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        state.pods.insert(name, MemoryPod { labels, status });
        Ok(())
    }

    async fn pod_status(&self, name: &str) -> Result<PodStatusView, ClusterError> {
        self.lock()
            .pods
            .get(name)
            .map(|pod| pod.status)
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let hang = self.lock().hang_deletes;
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if let Some(message) = state.delete_error.clone() {
            return Err(ClusterError::Api(message));
        }
        match state.pods.remove(name) {
            Some(_) => {
                state.deleted.push(name.to_string());
                Ok(())
            }
            None => Err(ClusterError::NotFound(name.to_string())),
        }
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<String>, ClusterError> {
        let state = self.lock();
        if let Some(message) = state.list_error.clone() {
            return Err(ClusterError::Api(message));
        }

        let wanted: Vec<(&str, &str)> = label_selector
            .split(',')
            .filter(|term| !term.is_empty())
            .filter_map(|term| term.split_once('='))
            .collect();

        Ok(state
            .pods
            .iter()
            .filter(|(_, pod)| {
                wanted
                    .iter()
                    .all(|(k, v)| pod.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn exec_attach<I, O, R>(
        &self,
        name: &str,
        command: &[String],
        streams: TerminalStreams<I, O, R>,
    ) -> Result<(), ClusterError>
    where
        I: TerminalInput,
        O: TerminalOutput,
        R: TerminalResize,
    {
        {
            let mut state = self.lock();
            if let Some(message) = state.exec_error.clone() {
                return Err(ClusterError::Stream(message));
            }
            match state.pods.get(name) {
                Some(pod) if pod.status.is_ready() => {}
                Some(_) => {
                    return Err(ClusterError::Stream(format!("pod {} is not running", name)))
                }
                None => return Err(ClusterError::NotFound(name.to_string())),
            }
            state.execs.push((name.to_string(), command.to_vec()));
        }

        let TerminalStreams {
            stdin: mut input,
            stdout: mut output,
            resize: mut resizes,
        } = streams;

        let echo = async {
            let mut buf = vec![0u8; ECHO_BUFFER_SIZE];
            loop {
                let n = input
                    .read(&mut buf)
                    .await
                    .map_err(|e| ClusterError::Stream(e.to_string()))?;
                if n == 0 {
                    return Ok(());
                }
                output
                    .write(&buf[..n])
                    .await
                    .map_err(|e| ClusterError::Stream(e.to_string()))?;
            }
        };

        let track_resizes = async {
            while let Some(size) = resizes.next_size().await {
                self.record_resize(size);
            }
            std::future::pending::<Result<(), ClusterError>>().await
        };

        tokio::select! {
            result = echo => result,
            result = track_resizes => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{build_pod, MANAGED_LABEL_SELECTOR};

    #[tokio::test]
    async fn test_create_and_status() {
        let cluster = InMemoryCluster::new();
        cluster.create_pod(&build_pod("user-aaaaa")).await.unwrap();

        let status = cluster.pod_status("user-aaaaa").await.unwrap();
        assert_eq!(status.phase, PodPhase::Pending);
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn test_auto_ready() {
        let cluster = InMemoryCluster::auto_ready();
        cluster.create_pod(&build_pod("user-aaaaa")).await.unwrap();
        assert!(cluster.pod_status("user-aaaaa").await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let cluster = InMemoryCluster::new();
        cluster.create_pod(&build_pod("user-aaaaa")).await.unwrap();
        let err = cluster.create_pod(&build_pod("user-aaaaa")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_scripted_outcomes_are_consumed_in_order() {
        let cluster = InMemoryCluster::new();
        cluster.fail_next_creates_with_conflict(1);
        cluster.fail_next_creates_with_error(1, "boom");

        let pod = build_pod("user-aaaaa");
        assert!(cluster.create_pod(&pod).await.unwrap_err().is_already_exists());
        assert!(matches!(
            cluster.create_pod(&pod).await,
            Err(ClusterError::Api(msg)) if msg == "boom"
        ));
        assert!(cluster.create_pod(&pod).await.is_ok());
        assert_eq!(cluster.create_calls(), 3);
    }

    #[tokio::test]
    async fn test_list_by_label() {
        let cluster = InMemoryCluster::new();
        cluster.create_pod(&build_pod("user-aaaaa")).await.unwrap();
        cluster.insert_pod(
            "unrelated",
            &[("app", "web")],
            PodStatusView::new(PodPhase::Running, true),
        );

        let names = cluster.list_pods(MANAGED_LABEL_SELECTOR).await.unwrap();
        assert_eq!(names, vec!["user-aaaaa".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_records_and_reports_missing() {
        let cluster = InMemoryCluster::new();
        cluster.create_pod(&build_pod("user-aaaaa")).await.unwrap();

        cluster.delete_pod("user-aaaaa").await.unwrap();
        assert!(matches!(
            cluster.delete_pod("user-aaaaa").await,
            Err(ClusterError::NotFound(_))
        ));
        assert_eq!(cluster.deleted_pods(), vec!["user-aaaaa".to_string()]);
    }
}
