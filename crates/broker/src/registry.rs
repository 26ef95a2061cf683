//! Registry of pods currently owned by live sessions.
//!
//! A pod name is present while some session believes it owns that pod and
//! has not finished tearing it down. The orphan reconciler treats every
//! managed pod missing from here as reclaimable.

use dashmap::DashMap;

/// Thread-safe set of pod names owned by live sessions.
///
/// Every operation touches a single key; there are no cross-key
/// transactions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    pods: DashMap<String, ()>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            pods: DashMap::new(),
        }
    }

    /// Records that a session owns `pod_name`.
    pub fn store(&self, pod_name: &str) {
        self.pods.insert(pod_name.to_string(), ());
        tracing::debug!(pod = %pod_name, "Registered pod");
    }

    /// Forgets `pod_name`. Returns true if it was present.
    pub fn remove(&self, pod_name: &str) -> bool {
        let removed = self.pods.remove(pod_name).is_some();
        if removed {
            tracing::debug!(pod = %pod_name, "Unregistered pod");
        }
        removed
    }

    /// Returns true if a live session owns `pod_name`.
    pub fn contains(&self, pod_name: &str) -> bool {
        self.pods.contains_key(pod_name)
    }

    /// Number of registered pods.
    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Snapshot of the registered pod names, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.pods.iter().map(|entry| entry.key().clone()).collect()
    }
}
