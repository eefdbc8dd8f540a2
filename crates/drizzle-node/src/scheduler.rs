// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function scheduler.
//!
//! Owns one [`InstanceSet`] per function. Requests are placed through
//! [`FunctionScheduler::run`]; the schedule board applies its decisions
//! through [`FunctionScheduler::refresh`]. Every refresh pokes the sync
//! worker, which reports the new replica counts to the control plane.
//!
//! Lock order is scheduler map, then set. The map lock is only held to look
//! up or insert a set, never across an await.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::control_plane::{ControlPlane, ReplicaCounts};
use crate::error::Result;
use crate::events::EventSink;
use crate::instance_set::InstanceSet;
use crate::launcher::WorkerLauncher;
use crate::span::Span;

/// Capacity of the sync trigger channel.
pub const TRIGGER_CAPACITY: usize = 100;

/// Decides whether another instance of a function may be created.
pub trait CreatePolicy: Send + Sync {
    /// `current` is the number of instances the set already holds.
    fn can_create(&self, function_name: &str, current: usize) -> bool;
}

/// Never refuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CreatePolicy for AllowAll {
    fn can_create(&self, _function_name: &str, _current: usize) -> bool {
        true
    }
}

/// Caps the number of instances per function.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaCap(pub usize);

impl CreatePolicy for ReplicaCap {
    fn can_create(&self, _function_name: &str, current: usize) -> bool {
        current < self.0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-node registry of instance sets.
pub struct FunctionScheduler {
    launcher: Arc<dyn WorkerLauncher>,
    policy: Arc<dyn CreatePolicy>,
    ttl: Duration,
    sink: EventSink,
    sets: Mutex<HashMap<String, Arc<InstanceSet>>>,
    /// `workflow -> functions` seen running on this node.
    workflows: Mutex<HashMap<String, BTreeSet<String>>>,
    trigger: mpsc::Sender<()>,
}

impl FunctionScheduler {
    /// Create a scheduler and the receiving end of its sync trigger.
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        policy: Arc<dyn CreatePolicy>,
        ttl: Duration,
        sink: EventSink,
    ) -> (Self, mpsc::Receiver<()>) {
        let (trigger, trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);
        let scheduler = Self {
            launcher,
            policy,
            ttl,
            sink,
            sets: Mutex::new(HashMap::new()),
            workflows: Mutex::new(HashMap::new()),
            trigger,
        };
        (scheduler, trigger_rx)
    }

    /// The set of `function_name`, created empty if absent.
    pub fn get_or_create(&self, function_name: &str) -> Arc<InstanceSet> {
        let mut sets = lock(&self.sets);
        if let Some(set) = sets.get(function_name) {
            return set.clone();
        }
        debug!(function = %function_name, "Creating instance set");
        let set = Arc::new(InstanceSet::new(
            function_name,
            self.launcher.clone(),
            self.policy.clone(),
            self.ttl,
            self.sink.clone(),
        ));
        sets.insert(function_name.to_string(), set.clone());
        set
    }

    pub fn get(&self, function_name: &str) -> Option<Arc<InstanceSet>> {
        lock(&self.sets).get(function_name).cloned()
    }

    /// Run the span's function with `params` on a local instance.
    pub async fn run(&self, span: &Span, params: Value) -> Result<Value> {
        lock(&self.workflows)
            .entry(span.workflow_name.clone())
            .or_default()
            .insert(span.function_name.clone());

        let set = self.get_or_create(&span.function_name);
        set.invoke(params).await
    }

    /// Scale `function_name` to `target` instances and schedule a sync.
    pub async fn refresh(&self, function_name: &str, target: usize) {
        let set = self.get_or_create(function_name);
        let report = set.scale(target).await;
        debug!(function = %function_name, target, ?report, "Refreshed instance set");

        if self.trigger.try_send(()).is_err() {
            debug!(function = %function_name, "Sync already pending");
        }
    }

    /// Running instances per function.
    pub fn stats(&self) -> HashMap<String, usize> {
        lock(&self.sets)
            .iter()
            .map(|(name, set)| (name.clone(), set.stats()))
            .collect()
    }

    /// Running instances of one function; zero if it has no set.
    pub fn function_stats(&self, function_name: &str) -> usize {
        self.get(function_name).map(|set| set.stats()).unwrap_or(0)
    }

    /// Whether one more instance of `function_name` may be created.
    pub fn can_create(&self, function_name: &str) -> bool {
        let current = self.get(function_name).map(|set| set.len()).unwrap_or(0);
        self.policy.can_create(function_name, current)
    }

    /// Per workflow, the counts of the functions it ran here.
    pub fn workflow_counts(&self) -> HashMap<String, ReplicaCounts> {
        let workflows = lock(&self.workflows).clone();
        workflows
            .into_iter()
            .map(|(workflow, functions)| {
                let counts = functions
                    .into_iter()
                    .map(|f| {
                        let count = self.function_stats(&f);
                        (f, count)
                    })
                    .collect();
                (workflow, counts)
            })
            .collect()
    }

    /// Release every instance of every function.
    pub async fn shutdown(&self) {
        let sets: Vec<Arc<InstanceSet>> = lock(&self.sets).drain().map(|(_, set)| set).collect();
        info!(sets = sets.len(), "Releasing all instance sets");
        for set in sets {
            set.release_all().await;
        }
    }
}

/// Background worker reporting replica counts to the control plane.
pub struct SchedulerSync {
    scheduler: Arc<FunctionScheduler>,
    control_plane: Arc<dyn ControlPlane>,
    node_id: String,
    trigger: mpsc::Receiver<()>,
    shutdown: Arc<Notify>,
}

impl SchedulerSync {
    pub fn new(
        scheduler: Arc<FunctionScheduler>,
        control_plane: Arc<dyn ControlPlane>,
        node_id: impl Into<String>,
        trigger: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            scheduler,
            control_plane,
            node_id: node_id.into(),
            trigger,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(mut self) {
        info!(node_id = %self.node_id, "Scheduler sync started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler sync received shutdown signal");
                    break;
                }

                trigger = self.trigger.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                    // Coalesce triggers that piled up meanwhile.
                    while self.trigger.try_recv().is_ok() {}
                    self.sync_once().await;
                }
            }
        }
        info!("Scheduler sync stopped");
    }

    /// Report the current counts of every known workflow.
    pub async fn sync_once(&self) {
        for (workflow, counts) in self.scheduler.workflow_counts() {
            if let Err(e) = self
                .control_plane
                .sync(&self.node_id, &workflow, &counts)
                .await
            {
                warn!(workflow = %workflow, error = %e, "Failed to sync replica counts");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::LocalControlPlane;
    use crate::error::Error;
    use crate::launcher::MockLauncher;
    use serde_json::json;

    fn scheduler(policy: Arc<dyn CreatePolicy>) -> (Arc<FunctionScheduler>, mpsc::Receiver<()>) {
        let (sink, _rx) = EventSink::channel();
        let (scheduler, trigger) = FunctionScheduler::new(
            Arc::new(MockLauncher::new()),
            policy,
            Duration::from_secs(20),
            sink,
        );
        (Arc::new(scheduler), trigger)
    }

    async fn wait_stats(scheduler: &FunctionScheduler, function: &str, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.function_stats(function) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn span(workflow: &str, function: &str) -> Span {
        let mut span = Span::root(workflow, false, None).child("f");
        span.function_name = function.to_string();
        span
    }

    #[test]
    fn test_policies() {
        assert!(AllowAll.can_create("A", 1000));
        assert!(ReplicaCap(2).can_create("A", 1));
        assert!(!ReplicaCap(2).can_create("A", 2));
    }

    #[tokio::test]
    async fn test_refresh_scales_and_triggers_sync() {
        let (scheduler, mut trigger) = scheduler(Arc::new(AllowAll));
        scheduler.refresh("A", 2).await;
        wait_stats(&scheduler, "A", 2).await;

        assert!(trigger.try_recv().is_ok());
        assert_eq!(scheduler.stats()["A"], 2);
        assert_eq!(scheduler.function_stats("B"), 0);

        scheduler.refresh("A", 0).await;
        assert_eq!(scheduler.function_stats("A"), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_without_instance() {
        let (scheduler, _trigger) = scheduler(Arc::new(AllowAll));
        let result = scheduler.run(&span("wf", "A"), json!({})).await;
        assert!(matches!(result, Err(Error::NoInstance(_))));
        // The set now exists, empty.
        assert!(scheduler.get("A").is_some());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_never_exceed_cap() {
        let (scheduler, _trigger) = scheduler(Arc::new(ReplicaCap(3)));
        scheduler.refresh("A", 10).await;
        wait_stats(&scheduler, "A", 3).await;
        assert!(!scheduler.can_create("A"));
        assert!(scheduler.can_create("B"));
        assert_eq!(scheduler.function_stats("A"), 3);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_reports_workflow_counts() {
        let (scheduler, trigger) = scheduler(Arc::new(AllowAll));
        let control_plane = Arc::new(LocalControlPlane::new());
        let sync = SchedulerSync::new(scheduler.clone(), control_plane.clone(), "node-1", trigger);
        let shutdown = sync.shutdown_handle();
        let handle = tokio::spawn(sync.run());

        scheduler.refresh("A", 1).await;
        wait_stats(&scheduler, "A", 1).await;
        let result = scheduler.run(&span("wf", "A"), json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"x": 1, "A": "A"}));

        // Any refresh schedules a sync; the workflow is now known.
        scheduler.refresh("A", 1).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while control_plane.synced("node-1", "wf").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(control_plane.synced("node-1", "wf").unwrap()["A"], 1);

        shutdown.notify_one();
        handle.await.unwrap();
        scheduler.shutdown().await;
    }
}
