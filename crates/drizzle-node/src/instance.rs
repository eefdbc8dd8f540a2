// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker instances.
//!
//! An [`Instance`] owns one launched worker and multiplexes any number of
//! concurrent invocations over its pipe pair. Three tasks run per instance:
//!
//! - writer: drains the request queue onto the request pipe
//! - reader: routes each response frame to the waiting caller by id
//! - reaper: waits for the worker to exit and fails whatever is left
//!
//! ```text
//!   Init ──first frame──▶ Running ──release / exit──▶ Terminating ──exit──▶ Terminated
//!    └──────────────────────── exit before first frame ─────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use drizzle_protocol::{FrameError, FrameReader, FrameWriter, READY_ID, RequestFrame, ResponseFrame};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::launcher::{Killer, LaunchSpec, WorkerLauncher};

/// Score of an instance that cannot take requests.
pub const SCORE_NOT_RUNNING: usize = 9999;

/// Depth of the per-instance request queue.
const REQUEST_QUEUE_CAPACITY: usize = 10;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Init,
    Running,
    Terminating,
    Terminated,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Init => "init",
            InstanceStatus::Running => "running",
            InstanceStatus::Terminating => "terminating",
            InstanceStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

type Slot = oneshot::Sender<Result<Value>>;

struct InstanceState {
    status: InstanceStatus,
    outstanding: HashMap<u64, Slot>,
}

/// A worker serving one function.
pub struct Instance {
    id: String,
    function_name: String,
    pid: Option<u32>,
    state: Mutex<InstanceState>,
    status_tx: watch::Sender<InstanceStatus>,
    requests: mpsc::Sender<RequestFrame>,
    next_request_id: AtomicU64,
    cancel: CancellationToken,
    kill: Killer,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("function_name", &self.function_name)
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish()
    }
}

impl Instance {
    /// Launch a worker for `function_name` and start its IO tasks.
    ///
    /// The instance starts in [`InstanceStatus::Init`]; use
    /// [`init_done`](Self::init_done) to wait for the worker to come up.
    pub async fn start(launcher: &dyn WorkerLauncher, function_name: &str) -> Result<Arc<Self>> {
        let spec = LaunchSpec {
            instance_id: Uuid::new_v4().to_string(),
            function_name: function_name.to_string(),
        };
        let handle = launcher.launch(&spec).await?;

        let (requests, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (status_tx, _) = watch::channel(InstanceStatus::Init);

        let instance = Arc::new(Self {
            id: spec.instance_id,
            function_name: spec.function_name,
            pid: handle.pid,
            state: Mutex::new(InstanceState {
                status: InstanceStatus::Init,
                outstanding: HashMap::new(),
            }),
            status_tx,
            requests,
            next_request_id: AtomicU64::new(READY_ID + 1),
            cancel: CancellationToken::new(),
            kill: handle.kill,
        });

        tokio::spawn(write_loop(instance.clone(), handle.requests, request_rx));
        tokio::spawn(read_loop(instance.clone(), handle.responses));

        let reaper = instance.clone();
        let exited = handle.exited;
        tokio::spawn(async move {
            exited.await;
            reaper.on_exit();
        });

        debug!(
            instance_id = %instance.id,
            function = %instance.function_name,
            launcher = launcher.launcher_type(),
            "Instance started"
        );
        Ok(instance)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn status(&self) -> InstanceStatus {
        self.state().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == InstanceStatus::Running
    }

    /// Number of in-flight requests, or [`SCORE_NOT_RUNNING`] when the
    /// instance cannot take work. Lower is better.
    pub fn score(&self) -> usize {
        let state = self.state();
        if state.status == InstanceStatus::Running {
            state.outstanding.len()
        } else {
            SCORE_NOT_RUNNING
        }
    }

    pub fn has_requests(&self) -> bool {
        !self.state().outstanding.is_empty()
    }

    /// Wait until the worker either answered its first frame or exited.
    ///
    /// Returns whether the instance is Running.
    pub async fn init_done(&self) -> bool {
        let mut rx = self.status_tx.subscribe();
        match rx.wait_for(|s| *s != InstanceStatus::Init).await {
            Ok(status) => *status == InstanceStatus::Running,
            Err(_) => false,
        }
    }

    /// Send `params` to the worker and wait for its result.
    pub async fn invoke(&self, params: Value) -> Result<Value> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            if state.status != InstanceStatus::Running {
                return Err(Error::InstanceNotService);
            }
            state.outstanding.insert(id, tx);
        }

        if self.requests.send(RequestFrame::new(id, params)).await.is_err() {
            self.state().outstanding.remove(&id);
            return Err(Error::InstanceNotService);
        }

        rx.await.unwrap_or(Err(Error::InstanceNotService))
    }

    /// Stop the worker. Outstanding callers get `InstanceNotService`.
    ///
    /// Safe to call any number of times.
    pub fn release(&self) {
        let drained = {
            let mut state = self.state();
            match state.status {
                InstanceStatus::Init | InstanceStatus::Running => {
                    self.set_status(&mut state, InstanceStatus::Terminating);
                    std::mem::take(&mut state.outstanding)
                }
                InstanceStatus::Terminating | InstanceStatus::Terminated => return,
            }
        };

        info!(
            instance_id = %self.id,
            function = %self.function_name,
            outstanding = drained.len(),
            "Releasing instance"
        );
        fail_all(drained);
        (self.kill)();
        self.cancel.cancel();
    }

    fn state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: &mut InstanceState, status: InstanceStatus) {
        state.status = status;
        self.status_tx.send_replace(status);
    }

    fn on_frame(&self, frame: ResponseFrame) {
        let slot = {
            let mut state = self.state();
            if state.status == InstanceStatus::Init {
                self.set_status(&mut state, InstanceStatus::Running);
                debug!(instance_id = %self.id, function = %self.function_name, "Instance running");
            }
            if frame.is_ready() {
                return;
            }
            state.outstanding.remove(&frame.id)
        };

        match slot {
            Some(slot) => {
                let outcome = frame.into_result().map_err(Error::WorkerFailed);
                let _ = slot.send(outcome);
            }
            None => debug!(instance_id = %self.id, id = frame.id, "Response for unknown request"),
        }
    }

    fn fail_request(&self, id: u64) {
        if let Some(slot) = self.state().outstanding.remove(&id) {
            let _ = slot.send(Err(Error::InstanceNotService));
        }
    }

    /// The response pipe closed: nothing more will be answered.
    fn on_disconnect(&self) {
        let drained = {
            let mut state = self.state();
            if matches!(state.status, InstanceStatus::Init | InstanceStatus::Running) {
                self.set_status(&mut state, InstanceStatus::Terminating);
            }
            std::mem::take(&mut state.outstanding)
        };
        fail_all(drained);
        self.cancel.cancel();
    }

    fn on_exit(&self) {
        let (previous, drained) = {
            let mut state = self.state();
            let previous = state.status;
            self.set_status(&mut state, InstanceStatus::Terminated);
            (previous, std::mem::take(&mut state.outstanding))
        };

        if matches!(previous, InstanceStatus::Init | InstanceStatus::Running) {
            warn!(
                instance_id = %self.id,
                function = %self.function_name,
                status = %previous,
                outstanding = drained.len(),
                "Worker exited unexpectedly"
            );
        } else {
            debug!(instance_id = %self.id, "Instance terminated");
        }
        fail_all(drained);
        self.cancel.cancel();
    }
}

fn fail_all(slots: HashMap<u64, Slot>) {
    for (_, slot) in slots {
        let _ = slot.send(Err(Error::InstanceNotService));
    }
}

async fn write_loop(
    instance: Arc<Instance>,
    pipe: Box<dyn AsyncWrite + Send + Unpin>,
    mut requests: mpsc::Receiver<RequestFrame>,
) {
    let mut writer = FrameWriter::new(pipe);
    loop {
        tokio::select! {
            biased;

            _ = instance.cancel.cancelled() => break,

            request = requests.recv() => {
                let Some(request) = request else { break };
                let id = request.id;
                if let Err(e) = writer.write_frame(&request).await {
                    warn!(instance_id = %instance.id, id, error = %e, "Failed to write request");
                    instance.fail_request(id);
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(instance: Arc<Instance>, pipe: Box<dyn AsyncRead + Send + Unpin>) {
    let mut reader = FrameReader::new(pipe);
    loop {
        tokio::select! {
            biased;

            _ = instance.cancel.cancelled() => break,

            frame = reader.read_frame::<ResponseFrame>() => match frame {
                Ok(frame) => instance.on_frame(frame),
                Err(FrameError::ConnectionClosed) => {
                    debug!(instance_id = %instance.id, "Response pipe closed");
                    instance.on_disconnect();
                    break;
                }
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %e, "Failed to read response");
                    instance.on_disconnect();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::MockLauncher;
    use futures::FutureExt;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_start_and_invoke() {
        let launcher = MockLauncher::new();
        let instance = Instance::start(&launcher, "A").await.unwrap();
        assert!(instance.init_done().await);
        assert_eq!(instance.status(), InstanceStatus::Running);
        assert_eq!(instance.score(), 0);

        let result = instance.invoke(json!({"a": "b"})).await.unwrap();
        assert_eq!(result, json!({"a": "b", "A": "A"}));
        assert!(!instance.has_requests());
    }

    #[tokio::test]
    async fn test_invoke_before_running_is_rejected() {
        let launcher = MockLauncher::new().with_startup_delay(Duration::from_secs(60));
        let instance = Instance::start(&launcher, "A").await.unwrap();
        assert_eq!(instance.status(), InstanceStatus::Init);
        assert_eq!(instance.score(), SCORE_NOT_RUNNING);
        assert!(matches!(
            instance.invoke(json!({})).await,
            Err(Error::InstanceNotService)
        ));
        instance.release();
    }

    #[tokio::test]
    async fn test_concurrent_invokes_route_by_id() {
        let launcher = MockLauncher::slow(Duration::from_millis(20));
        let instance = Instance::start(&launcher, "F").await.unwrap();
        assert!(instance.init_done().await);

        let calls = (0..8).map(|i| {
            let instance = instance.clone();
            async move { instance.invoke(json!({"n": i})).await }
        });
        let results = futures::future::join_all(calls).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!({"n": i, "F": "F"}));
        }
    }

    #[tokio::test]
    async fn test_score_counts_outstanding() {
        let launcher = MockLauncher::slow(Duration::from_secs(60));
        let instance = Instance::start(&launcher, "A").await.unwrap();
        assert!(instance.init_done().await);

        let pending = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.invoke(json!({})).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while instance.score() != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(instance.has_requests());

        instance.release();
        assert!(matches!(
            pending.await.unwrap(),
            Err(Error::InstanceNotService)
        ));
        assert_eq!(instance.score(), SCORE_NOT_RUNNING);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_terminates() {
        let launcher = MockLauncher::new();
        let instance = Instance::start(&launcher, "A").await.unwrap();
        assert!(instance.init_done().await);

        instance.release();
        instance.release();
        assert_ne!(instance.status(), InstanceStatus::Running);

        let mut rx = instance.status_tx.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s == InstanceStatus::Terminated),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(
            instance.invoke(json!({})).await,
            Err(Error::InstanceNotService)
        ));
    }

    #[tokio::test]
    async fn test_worker_errors_surface() {
        let launcher = MockLauncher::with_handler(Arc::new(|_, _| {
            async { Err("division by zero".to_string()) }.boxed()
        }));
        let instance = Instance::start(&launcher, "A").await.unwrap();
        assert!(instance.init_done().await);
        match instance.invoke(json!({})).await {
            Err(Error::WorkerFailed(msg)) => assert_eq!(msg, "division by zero"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(instance.is_running());
    }
}
