//! The fixed pod specification used for every session.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Label key marking pods owned by the broker.
pub const MANAGED_LABEL_KEY: &str = "app";

/// Label value marking pods owned by the broker.
pub const MANAGED_LABEL_VALUE: &str = "terminal-pod";

/// Selector matching every broker-managed pod.
pub const MANAGED_LABEL_SELECTOR: &str = "app=terminal-pod";

const CONTAINER_NAME: &str = "terminal";
const CONTAINER_IMAGE: &str = "ubuntu:latest";

/// Keeps the container alive until it is asked to stop.
const KEEP_ALIVE_SCRIPT: &str = "trap 'exit 0' SIGTERM; while true; do sleep 1; done";

const CPU_REQUEST: &str = "250m";
const MEMORY_REQUEST: &str = "128Mi";
const CPU_LIMIT: &str = "500m";
const MEMORY_LIMIT: &str = "256Mi";

/// Builds the pod for a session. Only the name varies between sessions.
pub fn build_pod(name: &str) -> Pod {
    let labels = BTreeMap::from([(
        MANAGED_LABEL_KEY.to_string(),
        MANAGED_LABEL_VALUE.to_string(),
    )]);

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(CONTAINER_IMAGE.to_string()),
        command: Some(vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            KEEP_ALIVE_SCRIPT.to_string(),
        ]),
        stdin: Some(true),
        tty: Some(true),
        resources: Some(ResourceRequirements {
            requests: Some(quantities(CPU_REQUEST, MEMORY_REQUEST)),
            limits: Some(quantities(CPU_LIMIT, MEMORY_LIMIT)),
            ..Default::default()
        }),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_metadata() {
        let pod = build_pod("user-abcde");
        assert_eq!(pod.metadata.name.as_deref(), Some("user-abcde"));

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("terminal-pod"));
        assert_eq!(
            MANAGED_LABEL_SELECTOR,
            format!("{}={}", MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE)
        );
    }

    #[test]
    fn test_single_interactive_container() {
        let spec = build_pod("user-abcde").spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers.len(), 1);

        let container = &spec.containers[0];
        assert_eq!(container.name, "terminal");
        assert_eq!(container.image.as_deref(), Some("ubuntu:latest"));
        assert_eq!(container.stdin, Some(true));
        assert_eq!(container.tty, Some(true));

        let command = container.command.as_ref().unwrap();
        assert_eq!(command[0], "/bin/bash");
        assert!(command[2].contains("trap 'exit 0' SIGTERM"));
    }

    #[test]
    fn test_resources() {
        let spec = build_pod("user-abcde").spec.unwrap();
        let resources = spec.containers[0].resources.clone().unwrap();

        let requests = resources.requests.unwrap();
        assert_eq!(requests["cpu"], Quantity("250m".to_string()));
        assert_eq!(requests["memory"], Quantity("128Mi".to_string()));

        let limits = resources.limits.unwrap();
        assert_eq!(limits["cpu"], Quantity("500m".to_string()));
        assert_eq!(limits["memory"], Quantity("256Mi".to_string()));
    }

    #[test]
    fn test_pod_differs_only_by_name() {
        let mut a = build_pod("user-11111");
        let b = build_pod("user-22222");
        a.metadata.name = b.metadata.name.clone();
        assert_eq!(a, b);
    }
}
