// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane client.
//!
//! The node asks the control plane for workflow definitions and for the
//! replica counts of its peers, and reports its own counts back after every
//! scaling change. [`LocalControlPlane`] serves all of this from memory,
//! seeded from a directory of workflow files and a static peer view.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use drizzle_dsl::Workflow;
use tracing::{debug, info, warn};

use crate::config::PeerReplicas;
use crate::error::{Error, Result};

/// Replica counts of one node: `function -> count`.
pub type ReplicaCounts = HashMap<String, usize>;

/// Trait for control-plane clients.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch a workflow definition by name.
    async fn get_workflow(&self, name: &str) -> Result<Arc<Workflow>>;

    /// Replica counts of every peer that runs functions of `workflow`.
    async fn get_peer_replicas(&self, workflow: &str) -> Result<PeerReplicas>;

    /// Report this node's counts for the functions of `workflow`.
    async fn sync(&self, node_id: &str, workflow: &str, counts: &ReplicaCounts) -> Result<()>;
}

/// In-memory control plane.
#[derive(Default)]
pub struct LocalControlPlane {
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    peers: RwLock<PeerReplicas>,
    synced: RwLock<HashMap<(String, String), ReplicaCounts>>,
}

impl LocalControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `peers` as the peer view of every workflow.
    pub fn with_peers(self, peers: PeerReplicas) -> Self {
        *write(&self.peers) = peers;
        self
    }

    /// Validate and register a workflow, replacing any with the same name.
    pub fn register(&self, workflow: Workflow) -> Result<()> {
        workflow.validate()?;
        info!(workflow = %workflow.name, flows = workflow.spec.len(), "Registered workflow");
        write(&self.workflows).insert(workflow.name.clone(), Arc::new(workflow));
        Ok(())
    }

    /// Load every `*.json` file in `dir`. Invalid files are skipped with a
    /// warning; a missing directory loads nothing.
    ///
    /// Returns the number of workflows registered.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            warn!(dir = %dir.display(), "Workflow directory does not exist");
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|text| serde_json::from_str::<Workflow>(&text).map_err(Error::from));
            match parsed.and_then(|workflow| self.register(workflow)) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(file = %path.display(), error = %e, "Skipping workflow file"),
            }
        }
        Ok(loaded)
    }

    /// Counts last reported by `node_id` for `workflow`.
    pub fn synced(&self, node_id: &str, workflow: &str) -> Option<ReplicaCounts> {
        read(&self.synced)
            .get(&(node_id.to_string(), workflow.to_string()))
            .cloned()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl ControlPlane for LocalControlPlane {
    async fn get_workflow(&self, name: &str) -> Result<Arc<Workflow>> {
        read(&self.workflows)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::WorkflowNotFound(name.to_string()))
    }

    async fn get_peer_replicas(&self, _workflow: &str) -> Result<PeerReplicas> {
        Ok(read(&self.peers).clone())
    }

    async fn sync(&self, node_id: &str, workflow: &str, counts: &ReplicaCounts) -> Result<()> {
        debug!(node_id, workflow, ?counts, "Replica counts synced");
        write(&self.synced).insert((node_id.to_string(), workflow.to_string()), counts.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline(name: &str) -> serde_json::Value {
        json!({
            "name": name,
            "spec": [
                {"name": "start", "function": "A", "outputs": ["end"], "role": "start"},
                {"name": "end", "function": "B", "role": "end"}
            ]
        })
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let cp = LocalControlPlane::new();
        cp.register(serde_json::from_value(pipeline("wf")).unwrap())
            .unwrap();
        let wf = cp.get_workflow("wf").await.unwrap();
        assert_eq!(wf.spec.len(), 2);
        assert!(matches!(
            cp.get_workflow("nope").await,
            Err(Error::WorkflowNotFound(_))
        ));
    }

    #[test]
    fn test_register_rejects_invalid() {
        let cp = LocalControlPlane::new();
        let mut wf: Workflow = serde_json::from_value(pipeline("wf")).unwrap();
        wf.spec[1].role = drizzle_dsl::Role::Mid;
        assert!(matches!(cp.register(wf), Err(Error::InvalidWorkflow(_))));
    }

    #[test]
    fn test_load_dir_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.json"), pipeline("good").to_string()).unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let cp = LocalControlPlane::new();
        assert_eq!(cp.load_dir(dir.path()).unwrap(), 1);
        assert_eq!(cp.load_dir(&dir.path().join("missing")).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_records_counts() {
        let cp = LocalControlPlane::new();
        let counts = ReplicaCounts::from([("A".to_string(), 2)]);
        cp.sync("node-1", "wf", &counts).await.unwrap();
        assert_eq!(cp.synced("node-1", "wf"), Some(counts));
        assert_eq!(cp.synced("node-2", "wf"), None);
    }

    #[tokio::test]
    async fn test_peer_view() {
        let peers = crate::config::parse_peers("p1=A:2").unwrap();
        let cp = LocalControlPlane::new().with_peers(peers);
        let view = cp.get_peer_replicas("wf").await.unwrap();
        assert_eq!(view["p1"]["A"], 2);
    }
}
