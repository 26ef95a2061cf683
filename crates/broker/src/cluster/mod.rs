//! Cluster orchestrator abstraction.
//!
//! The broker only needs five operations from the orchestrator: create,
//! inspect, delete and list pods, and attach an interactive process to a
//! running pod. [`PodCluster`] captures those so the session lifecycle can
//! run against Kubernetes ([`k8s::KubeCluster`]) or an in-process fake
//! ([`memory::InMemoryCluster`]).

pub mod k8s;
pub mod memory;
pub mod template;

use std::future::Future;

use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

use crate::bridge::{TerminalInput, TerminalOutput, TerminalResize, TerminalStreams};

pub use k8s::KubeCluster;
pub use memory::InMemoryCluster;
pub use template::{build_pod, MANAGED_LABEL_KEY, MANAGED_LABEL_SELECTOR, MANAGED_LABEL_VALUE};

/// Errors reported by the orchestrator.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A pod with this name already exists.
    #[error("pod already exists: {0}")]
    AlreadyExists(String),

    /// The pod does not exist.
    #[error("pod not found: {0}")]
    NotFound(String),

    /// Any other API failure.
    #[error("cluster API error: {0}")]
    Api(String),

    /// The client could not be configured.
    #[error("cluster configuration error: {0}")]
    Config(String),

    /// The exec-attach stream failed.
    #[error("exec stream error: {0}")]
    Stream(String),
}

impl ClusterError {
    /// Returns true for a create conflict on the pod name.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }
}

/// Lifecycle phase reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parses the orchestrator's phase string. Unrecognised values map to
    /// [`PodPhase::Unknown`].
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// Observed state of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodStatusView {
    pub phase: PodPhase,
    /// Whether the `Ready` condition is `True`.
    pub ready: bool,
}

impl PodStatusView {
    pub fn new(phase: PodPhase, ready: bool) -> Self {
        Self { phase, ready }
    }

    /// A pod can take a shell once it is running and ready.
    pub fn is_ready(&self) -> bool {
        self.phase == PodPhase::Running && self.ready
    }
}

/// Orchestrator operations used by the session lifecycle.
///
/// Implementations must be safe for concurrent use by independent
/// sessions.
pub trait PodCluster: Send + Sync + 'static {
    /// Creates `pod`. A name conflict must surface as
    /// [`ClusterError::AlreadyExists`].
    fn create_pod(&self, pod: &Pod) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Fetches the phase and readiness of a pod.
    fn pod_status(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<PodStatusView, ClusterError>> + Send;

    /// Deletes a pod, cascading to dependents in the background.
    fn delete_pod(&self, name: &str) -> impl Future<Output = Result<(), ClusterError>> + Send;

    /// Lists the names of pods matching `label_selector`.
    fn list_pods(
        &self,
        label_selector: &str,
    ) -> impl Future<Output = Result<Vec<String>, ClusterError>> + Send;

    /// Runs `command` in TTY mode inside the pod, relaying the terminal
    /// streams until either side finishes.
    fn exec_attach<I, O, R>(
        &self,
        name: &str,
        command: &[String],
        streams: TerminalStreams<I, O, R>,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send
    where
        I: TerminalInput,
        O: TerminalOutput,
        R: TerminalResize;
}
