// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idle-instance expiry.
//!
//! Each instance set owns one [`TtlManager`]. A single supervisor task owns
//! every timer of the function and applies commands one at a time, so a
//! timer can never fire for an instance after it has been removed.
//!
//! When a deadline passes and the instance is still busy, the timer is
//! re-armed for a full TTL. Otherwise the instance is handed back to the
//! owning set through the expiry channel and a Ttl Decrease is emitted with
//! the number of timers left.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{EventSink, ScheduleEvent, Source};
use crate::instance::Instance;

/// Default idle time before an instance is released.
pub const DEFAULT_TTL: Duration = Duration::from_secs(20);

/// Depth of the command queue.
const COMMAND_CAPACITY: usize = 10;

/// Operations serialized by the supervisor.
#[derive(Debug)]
pub enum TtlCommand {
    /// Start tracking a new instance.
    Append(Arc<Instance>),
    /// Push the deadline of an instance a full TTL into the future.
    Reset(String),
    /// Drop the timer of an instance that was released elsewhere.
    Release(String),
    /// Stop the supervisor.
    Shutdown,
}

/// Handle to the TTL supervisor of one function.
pub struct TtlManager {
    function_name: String,
    commands: mpsc::Sender<TtlCommand>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TtlManager {
    /// Spawn the supervisor. Expired instances are sent on `expired`.
    pub fn spawn(
        function_name: impl Into<String>,
        ttl: Duration,
        expired: mpsc::UnboundedSender<Arc<Instance>>,
        sink: EventSink,
    ) -> Self {
        let function_name = function_name.into();
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let supervisor = Supervisor {
            function_name: function_name.clone(),
            ttl,
            timers: HashMap::new(),
            expired,
            sink,
        };
        let task = tokio::spawn(supervisor.run(rx));
        Self {
            function_name,
            commands,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    pub async fn append(&self, instance: Arc<Instance>) {
        self.send(TtlCommand::Append(instance)).await;
    }

    pub async fn reset(&self, instance_id: &str) {
        self.send(TtlCommand::Reset(instance_id.to_string())).await;
    }

    pub async fn release(&self, instance_id: &str) {
        self.send(TtlCommand::Release(instance_id.to_string())).await;
    }

    /// Stop the supervisor and wait for it to finish.
    pub async fn shutdown(&self) {
        self.send(TtlCommand::Shutdown).await;
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(function = %self.function_name, error = %e, "TTL supervisor panicked");
        }
    }

    async fn send(&self, command: TtlCommand) {
        if self.commands.send(command).await.is_err() {
            debug!(function = %self.function_name, "TTL supervisor already stopped");
        }
    }
}

struct Supervisor {
    function_name: String,
    ttl: Duration,
    timers: HashMap<String, (Arc<Instance>, Instant)>,
    expired: mpsc::UnboundedSender<Arc<Instance>>,
    sink: EventSink,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::Receiver<TtlCommand>) {
        debug!(function = %self.function_name, ttl_ms = self.ttl.as_millis() as u64, "TTL supervisor started");
        loop {
            let next_deadline = self.timers.values().map(|(_, deadline)| *deadline).min();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(TtlCommand::Shutdown) | None => break,
                    Some(command) => self.apply(command),
                },

                _ = sleep_until(next_deadline), if next_deadline.is_some() => {
                    self.fire_expired();
                }
            }
        }
        debug!(function = %self.function_name, "TTL supervisor stopped");
    }

    fn apply(&mut self, command: TtlCommand) {
        let now = Instant::now();
        match command {
            TtlCommand::Append(instance) => {
                let id = instance.id().to_string();
                self.timers.insert(id, (instance, now + self.ttl));
            }
            TtlCommand::Reset(id) => {
                if let Some((_, deadline)) = self.timers.get_mut(&id) {
                    *deadline = now + self.ttl;
                }
            }
            TtlCommand::Release(id) => {
                if self.timers.remove(&id).is_some() {
                    self.emit_decrease();
                }
            }
            TtlCommand::Shutdown => {}
        }
    }

    fn fire_expired(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .timers
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            let Some((instance, _)) = self.timers.get(&id) else {
                continue;
            };

            if instance.is_running() && instance.has_requests() {
                debug!(function = %self.function_name, instance_id = %id, "Instance busy, re-arming TTL");
                let ttl = self.ttl;
                if let Some((_, deadline)) = self.timers.get_mut(&id) {
                    *deadline = now + ttl;
                }
                continue;
            }

            if let Some((instance, _)) = self.timers.remove(&id) {
                info!(
                    function = %self.function_name,
                    instance_id = %id,
                    remaining = self.timers.len(),
                    "Instance idle past TTL"
                );
                let _ = self.expired.send(instance);
                self.emit_decrease();
            }
        }
    }

    fn emit_decrease(&self) {
        self.sink.to_metrics(ScheduleEvent::decrease(
            self.function_name.clone(),
            self.timers.len(),
            Source::Ttl,
        ));
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
