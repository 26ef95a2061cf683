//! Kubernetes implementation of [`PodCluster`].

use std::path::Path;
use std::time::Duration;

use futures_util::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{
    Api, AttachParams, DeleteParams, ListParams, PostParams, PropagationPolicy, TerminalSize,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{ClusterError, PodCluster, PodPhase, PodStatusView};
use crate::bridge::{TerminalInput, TerminalOutput, TerminalResize, TerminalStreams};

/// Size of the buffers used to relay exec streams.
const EXEC_BUFFER_SIZE: usize = 4096;

/// How long to wait for the exec status once the process output has ended.
const EXEC_STATUS_WAIT: Duration = Duration::from_secs(5);

/// Pods in one namespace of a Kubernetes cluster.
#[derive(Clone)]
pub struct KubeCluster {
    pods: Api<Pod>,
}

impl KubeCluster {
    /// Builds a client from `kubeconfig`, or infers the configuration
    /// (in-cluster first, then the default kubeconfig) when it is `None`.
    pub async fn connect(namespace: &str, kubeconfig: Option<&Path>) -> Result<Self, ClusterError> {
        let client = match kubeconfig {
            Some(path) => {
                info!("Using kubeconfig file {:?}", path);
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| ClusterError::Config(e.to_string()))?;
                let config =
                    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| ClusterError::Config(e.to_string()))?;
                Client::try_from(config).map_err(|e| ClusterError::Config(e.to_string()))?
            }
            None => {
                info!("Inferring Kubernetes configuration");
                Client::try_default()
                    .await
                    .map_err(|e| ClusterError::Config(e.to_string()))?
            }
        };

        Ok(Self {
            pods: Api::namespaced(client, namespace),
        })
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.reason == "AlreadyExists" || response.code == 409 => {
                ClusterError::AlreadyExists(response.message.clone())
            }
            kube::Error::Api(response) if response.reason == "NotFound" || response.code == 404 => {
                ClusterError::NotFound(response.message.clone())
            }
            _ => ClusterError::Api(err.to_string()),
        }
    }
}

impl PodCluster for KubeCluster {
    async fn create_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        self.pods.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn pod_status(&self, name: &str) -> Result<PodStatusView, ClusterError> {
        let pod = self.pods.get(name).await?;
        Ok(status_view(&pod))
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        self.pods.delete(name, &params).await?;
        Ok(())
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<String>, ClusterError> {
        let pods = self
            .pods
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
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
        // With a TTY the container's stderr is merged into stdout.
        let params = AttachParams::interactive_tty();
        let mut attached = self.pods.exec(name, command.to_vec(), &params).await?;

        let stdin = attached
            .stdin()
            .ok_or_else(|| ClusterError::Stream("exec stdin unavailable".to_string()))?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| ClusterError::Stream("exec stdout unavailable".to_string()))?;
        let mut size_tx = attached
            .terminal_size()
            .ok_or_else(|| ClusterError::Stream("exec resize channel unavailable".to_string()))?;
        let status = attached
            .take_status()
            .ok_or_else(|| ClusterError::Stream("exec status unavailable".to_string()))?;

        let TerminalStreams {
            stdin: mut input,
            stdout: mut output,
            resize: mut resizes,
        } = streams;

        let forward_resizes = async {
            while let Some(size) = resizes.next_size().await {
                let size = TerminalSize {
                    width: size.cols,
                    height: size.rows,
                };
                if size_tx.send(size).await.is_err() {
                    break;
                }
            }
            std::future::pending::<Result<(), ClusterError>>().await
        };

        let process_exited = tokio::select! {
            result = pump_input(&mut input, stdin) => result.map(|()| false)?,
            result = pump_output(stdout, &mut output) => result.map(|()| true)?,
            result = forward_resizes => result.map(|()| false)?,
        };
        if !process_exited {
            debug!(pod = %name, "Client input ended");
            return Ok(());
        }

        match tokio::time::timeout(EXEC_STATUS_WAIT, status).await {
            Ok(status) => {
                debug!(pod = %name, "Exec stream finished");
                exec_result(status)
            }
            Err(_) => {
                warn!(pod = %name, "No exec status after output ended");
                Ok(())
            }
        }
    }
}

/// Reads phase and the `Ready` condition out of a pod.
fn status_view(pod: &Pod) -> PodStatusView {
    let Some(status) = &pod.status else {
        return PodStatusView::new(PodPhase::Unknown, false);
    };

    let phase = status
        .phase
        .as_deref()
        .map(PodPhase::parse)
        .unwrap_or(PodPhase::Unknown);
    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");

    PodStatusView::new(phase, ready)
}

/// Maps the status the API server sends when an exec ends.
///
/// A shell exiting non-zero is the user's doing and counts as a normal end.
/// Any other failure means the exec itself broke.
fn exec_result(status: Option<Status>) -> Result<(), ClusterError> {
    match status {
        Some(status) if status.status.as_deref() == Some("Failure") => {
            if status.reason.as_deref() == Some("NonZeroExitCode") {
                return Ok(());
            }
            Err(ClusterError::Stream(
                status
                    .message
                    .unwrap_or_else(|| "exec failed".to_string()),
            ))
        }
        Some(_) => Ok(()),
        None => Err(ClusterError::Stream(
            "exec ended without a status".to_string(),
        )),
    }
}

/// Copies client input into the process until the client goes away.
async fn pump_input<I, W>(input: &mut I, mut stdin: W) -> Result<(), ClusterError>
where
    I: TerminalInput,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; EXEC_BUFFER_SIZE];
    loop {
        let n = input
            .read(&mut buf)
            .await
            .map_err(|e| ClusterError::Stream(e.to_string()))?;
        if n == 0 {
            let _ = stdin.shutdown().await;
            return Ok(());
        }
        stdin
            .write_all(&buf[..n])
            .await
            .map_err(|e| ClusterError::Stream(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| ClusterError::Stream(e.to_string()))?;
    }
}

/// Copies process output to the client until the process exits.
async fn pump_output<Rd, O>(mut stdout: Rd, output: &mut O) -> Result<(), ClusterError>
where
    Rd: AsyncRead + Unpin,
    O: TerminalOutput,
{
    let mut buf = vec![0u8; EXEC_BUFFER_SIZE];
    loop {
        let n = stdout
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
}
