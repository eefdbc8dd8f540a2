// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-function instance pools.
//!
//! An [`InstanceSet`] places requests on its least loaded Running instance
//! and converges its size to the target the schedule board asks for.
//! Invoking never spawns: an empty set fails with `NoInstance` and the
//! middleware chain deals with the cold start.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::instance::{Instance, InstanceStatus};
use crate::launcher::WorkerLauncher;
use crate::scheduler::CreatePolicy;
use crate::ttl::TtlManager;

/// Extra attempts after an instance drops out mid-request.
pub const INVOKE_RETRIES: usize = 3;

type InstanceList = Arc<Mutex<Vec<Arc<Instance>>>>;

fn lock(list: &InstanceList) -> MutexGuard<'_, Vec<Arc<Instance>>> {
    list.lock().unwrap_or_else(PoisonError::into_inner)
}

fn running_count(list: &InstanceList) -> usize {
    lock(list).iter().filter(|i| i.is_running()).count()
}

/// What a call to [`InstanceSet::scale`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaleReport {
    pub started: usize,
    pub released: usize,
    pub failed: usize,
    pub rejected: usize,
}

/// Worker instances of one function.
pub struct InstanceSet {
    function_name: String,
    launcher: Arc<dyn WorkerLauncher>,
    policy: Arc<dyn CreatePolicy>,
    instances: InstanceList,
    scale_lock: tokio::sync::Mutex<()>,
    cold_start_tx: mpsc::Sender<()>,
    /// Serializes cold-start waiters; holding it is the access limit.
    cold_start_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    ttl: TtlManager,
    expiry_task: JoinHandle<()>,
}

impl InstanceSet {
    pub fn new(
        function_name: impl Into<String>,
        launcher: Arc<dyn WorkerLauncher>,
        policy: Arc<dyn CreatePolicy>,
        ttl: Duration,
        sink: EventSink,
    ) -> Self {
        let function_name = function_name.into();
        let instances: InstanceList = Arc::new(Mutex::new(Vec::new()));
        let (cold_start_tx, cold_start_rx) = mpsc::channel(1);

        let (expired_tx, mut expired_rx) = mpsc::unbounded_channel::<Arc<Instance>>();
        let ttl = TtlManager::spawn(function_name.clone(), ttl, expired_tx, sink);

        let list = instances.clone();
        let name = function_name.clone();
        let expiry_task = tokio::spawn(async move {
            while let Some(instance) = expired_rx.recv().await {
                lock(&list).retain(|i| i.id() != instance.id());
                debug!(function = %name, instance_id = %instance.id(), "Removing expired instance");
                instance.release();
            }
        });

        Self {
            function_name,
            launcher,
            policy,
            instances,
            scale_lock: tokio::sync::Mutex::new(()),
            cold_start_tx,
            cold_start_rx: tokio::sync::Mutex::new(cold_start_rx),
            ttl,
            expiry_task,
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Number of Running instances.
    pub fn stats(&self) -> usize {
        running_count(&self.instances)
    }

    /// Number of instances in the set, whatever their state.
    pub fn len(&self) -> usize {
        lock(&self.instances).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the instances in placement order.
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        lock(&self.instances).clone()
    }

    /// Lowest-score Running instance; the earliest wins ties.
    fn pick(&self) -> Option<Arc<Instance>> {
        lock(&self.instances)
            .iter()
            .filter(|i| i.is_running())
            .min_by_key(|i| i.score())
            .cloned()
    }

    /// Run `params` on the least loaded instance.
    pub async fn invoke(&self, params: Value) -> Result<Value> {
        for attempt in 0..=INVOKE_RETRIES {
            let instance = self
                .pick()
                .ok_or_else(|| Error::NoInstance(self.function_name.clone()))?;
            self.ttl.reset(instance.id()).await;

            match instance.invoke(params.clone()).await {
                Err(Error::InstanceNotService) => {
                    debug!(
                        function = %self.function_name,
                        instance_id = %instance.id(),
                        attempt,
                        "Instance left service, picking another"
                    );
                }
                other => return other,
            }
        }
        Err(Error::InstanceNotService)
    }

    /// Converge the set to `target` instances.
    pub async fn scale(&self, target: usize) -> ScaleReport {
        let _guard = self.scale_lock.lock().await;
        let mut report = ScaleReport::default();

        // Instances that already left service only take up room.
        let gone: Vec<Arc<Instance>> = {
            let mut list = lock(&self.instances);
            let (gone, kept): (Vec<_>, Vec<_>) = list.drain(..).partition(|i| {
                !matches!(i.status(), InstanceStatus::Init | InstanceStatus::Running)
            });
            *list = kept;
            gone
        };
        for instance in gone {
            self.ttl.release(instance.id()).await;
        }

        let len = self.len();
        if len > target {
            for instance in self.take_victims(len - target) {
                self.ttl.release(instance.id()).await;
                instance.release();
                report.released += 1;
            }
        } else {
            for _ in len..target {
                if !self.policy.can_create(&self.function_name, self.len()) {
                    warn!(
                        function = %self.function_name,
                        error = %Error::ResourceLimit(self.function_name.clone()),
                        "Instance creation refused"
                    );
                    report.rejected += 1;
                    continue;
                }
                match Instance::start(self.launcher.as_ref(), &self.function_name).await {
                    Ok(instance) => {
                        lock(&self.instances).push(instance.clone());
                        self.ttl.append(instance.clone()).await;
                        self.watch_init(instance);
                        report.started += 1;
                    }
                    Err(e) => {
                        warn!(function = %self.function_name, error = %e, "Failed to start instance");
                        report.failed += 1;
                    }
                }
            }
        }

        if report != ScaleReport::default() {
            info!(
                function = %self.function_name,
                target,
                started = report.started,
                released = report.released,
                failed = report.failed,
                rejected = report.rejected,
                "Scaled instance set"
            );
        }
        report
    }

    /// Remove the `count` lowest-score instances; earlier positions go first on ties.
    fn take_victims(&self, count: usize) -> Vec<Arc<Instance>> {
        let mut list = lock(&self.instances);
        let mut order: Vec<(usize, usize)> = list
            .iter()
            .enumerate()
            .map(|(pos, i)| (i.score(), pos))
            .collect();
        order.sort();
        let mut doomed: Vec<usize> = order.into_iter().take(count).map(|(_, pos)| pos).collect();
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        doomed.into_iter().map(|pos| list.remove(pos)).collect()
    }

    fn watch_init(&self, instance: Arc<Instance>) {
        let list = self.instances.clone();
        let signal = self.cold_start_tx.clone();
        tokio::spawn(async move {
            if instance.init_done().await {
                if running_count(&list) >= 1 {
                    let _ = signal.try_send(());
                }
            } else {
                warn!(instance_id = %instance.id(), "Instance exited before becoming ready");
                lock(&list).retain(|i| i.id() != instance.id());
            }
        });
    }

    /// Wait up to `timeout` for the set to have a Running instance.
    ///
    /// Waiters are served one at a time; each re-checks the set after every
    /// signal so a stale signal cannot wake it early. The deadline counts
    /// from the call, including time spent queued behind other waiters.
    pub async fn function_cold_start_done(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let Ok(mut signals) = tokio::time::timeout_at(deadline, self.cold_start_rx.lock()).await
        else {
            return self.stats() > 0;
        };
        if self.stats() > 0 {
            return true;
        }

        loop {
            match tokio::time::timeout_at(deadline, signals.recv()).await {
                Ok(Some(())) if self.stats() > 0 => return true,
                Ok(Some(())) => continue,
                Ok(None) | Err(_) => return self.stats() > 0,
            }
        }
    }

    /// Release every instance and stop the TTL supervisor.
    pub async fn release_all(&self) {
        let _guard = self.scale_lock.lock().await;
        let instances: Vec<Arc<Instance>> = lock(&self.instances).drain(..).collect();
        for instance in &instances {
            instance.release();
        }
        self.ttl.shutdown().await;
        self.expiry_task.abort();
        debug!(function = %self.function_name, released = instances.len(), "Released all instances");
    }
}
