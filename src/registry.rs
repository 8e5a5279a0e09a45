//! In-memory directory of active deployments keyed by function name.
//!
//! A name maps to at most one live deployment at any instant. Mutating
//! operations (deploy, delete, wipe) serialize on
//! [`FunctionRegistry::lock_mutations`], holding the guard for their whole
//! critical section so their engine side effects can never interleave.
//! Readers take the map's read lock and observe whole deployments only;
//! deployments are replaced behind `Arc`, never mutated in place.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::data_model::FunctionDeployment;

#[derive(Default)]
struct Deployments {
    by_name: HashMap<String, Arc<FunctionDeployment>>,
    /// Insertion order, for deterministic list output.
    order: Vec<String>,
}

#[derive(Default)]
pub struct FunctionRegistry {
    deployments: RwLock<Deployments>,
    mutation_lock: Mutex<()>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes mutating operations. The guard must be held across the
    /// whole deploy/delete/wipe critical section, not just the map update.
    pub async fn lock_mutations(&self) -> MutexGuard<'_, ()> {
        self.mutation_lock.lock().await
    }

    pub async fn get(&self, name: &str) -> Option<Arc<FunctionDeployment>> {
        self.deployments.read().await.by_name.get(name).cloned()
    }

    /// Insert a fully provisioned deployment. A replaced entry keeps its
    /// position in the listing order; a new entry goes to `position` when
    /// given (a redeploy reclaiming the slot its predecessor held), to the
    /// end otherwise.
    pub async fn commit(&self, deployment: FunctionDeployment, position: Option<usize>) {
        let mut state = self.deployments.write().await;
        let name = deployment.name.clone();
        if state
            .by_name
            .insert(name.clone(), Arc::new(deployment))
            .is_none()
        {
            match position {
                Some(position) if position <= state.order.len() => {
                    state.order.insert(position, name);
                }
                _ => state.order.push(name),
            }
        }
    }

    /// Remove a deployment, returning it together with the position it held
    /// in the listing order.
    pub async fn remove(&self, name: &str) -> Option<(Arc<FunctionDeployment>, usize)> {
        let mut state = self.deployments.write().await;
        let removed = state.by_name.remove(name)?;
        let position = state
            .order
            .iter()
            .position(|n| n == name)
            .unwrap_or(state.order.len());
        state.order.retain(|n| n != name);
        Some((removed, position))
    }

    /// Committed deployments in insertion order.
    pub async fn snapshot(&self) -> Vec<Arc<FunctionDeployment>> {
        let state = self.deployments.read().await;
        state
            .order
            .iter()
            .filter_map(|name| state.by_name.get(name).cloned())
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.deployments.read().await.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn deployment(name: &str) -> FunctionDeployment {
        FunctionDeployment {
            name: name.to_string(),
            resource_path: format!("/{name}"),
            replica_count: 1,
            content_hash: "abc123".to_string(),
            environment: HashMap::new(),
            network: format!("{name}-net"),
            replicas: vec![],
            image_ref: format!("{name}-img"),
        }
    }

    #[tokio::test]
    async fn test_commit_and_get() {
        let registry = FunctionRegistry::new();
        registry.commit(deployment("echo"), None).await;
        let dep = registry.get("echo").await.unwrap();
        assert_eq!(dep.resource_path, "/echo");
        assert!(registry.get("other").await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_preserves_insertion_order() {
        let registry = FunctionRegistry::new();
        for name in ["c", "a", "b"] {
            registry.commit(deployment(name), None).await;
        }
        let names: Vec<_> = registry
            .snapshot()
            .await
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_remove_drops_from_order() {
        let registry = FunctionRegistry::new();
        registry.commit(deployment("a"), None).await;
        registry.commit(deployment("b"), None).await;
        assert!(registry.remove("a").await.is_some());
        assert!(registry.remove("a").await.is_none());
        let names: Vec<_> = registry
            .snapshot()
            .await
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(names, vec!["b"]);
    }

    #[tokio::test]
    async fn test_recommit_keeps_position() {
        let registry = FunctionRegistry::new();
        registry.commit(deployment("a"), None).await;
        registry.commit(deployment("b"), None).await;
        let mut replacement = deployment("a");
        replacement.content_hash = "def456".to_string();
        registry.commit(replacement, None).await;
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "a");
        assert_eq!(snapshot[0].content_hash, "def456");
    }

    #[tokio::test]
    async fn test_redeploy_reclaims_list_position() {
        let registry = FunctionRegistry::new();
        for name in ["a", "b", "c"] {
            registry.commit(deployment(name), None).await;
        }
        let (_, position) = registry.remove("b").await.unwrap();
        assert_eq!(position, 1);
        let mut replacement = deployment("b");
        replacement.content_hash = "def456".to_string();
        registry.commit(replacement, Some(position)).await;
        let names: Vec<_> = registry
            .snapshot()
            .await
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(registry.get("b").await.unwrap().content_hash, "def456");
    }

    #[tokio::test]
    async fn test_mutation_lock_serializes() {
        let registry = Arc::new(FunctionRegistry::new());
        let guard = registry.lock_mutations().await;
        let other = registry.clone();
        let pending = tokio::spawn(async move {
            let _guard = other.lock_mutations().await;
            other.commit(deployment("late"), None).await;
        });
        // The spawned mutation cannot make progress while we hold the lock.
        tokio::task::yield_now().await;
        assert!(registry.is_empty().await);
        drop(guard);
        pending.await.unwrap();
        assert!(registry.get("late").await.is_some());
    }
}
