// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Autoscaling event pipeline.
//!
//! ```text
//!  QPS sampler ──┐
//!                ├──▶ metrics aggregator ──┐
//!  TTL manager ──┘                         ├──▶ schedule board ──▶ FunctionScheduler::refresh
//!  cold start / prestart middleware ───────┘
//! ```
//!
//! Producers never block: both channels are bounded and a full channel drops
//! the event with a warning.

use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, warn};

pub mod board;
pub mod metrics;
pub mod qps;

pub use board::{ScheduleBoard, ScoreBoard};
pub use metrics::MetricsAggregator;
pub use qps::{QpsRecorder, QpsSampler};

/// Capacity of the metrics and schedule channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Direction of a scaling wish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Trend {
    #[default]
    None,
    Increase,
    Decrease,
}

/// Producer of a scaling event, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    Schedule,
    Coldstart,
    Prestart,
    Metrics,
    Qps,
    Ttl,
}

impl Source {
    /// Every source, sorted by priority then declaration order.
    pub const ALL: [Source; 6] = [
        Source::Schedule,
        Source::Coldstart,
        Source::Prestart,
        Source::Metrics,
        Source::Qps,
        Source::Ttl,
    ];

    /// Lower runs first.
    pub fn priority(self) -> u8 {
        match self {
            Source::Schedule | Source::Coldstart | Source::Prestart => 1,
            Source::Metrics | Source::Qps | Source::Ttl => 2,
        }
    }

    /// One-shot sources are forgotten after the decision that used them.
    pub fn delete_after_use(self) -> bool {
        matches!(self, Source::Schedule | Source::Coldstart | Source::Prestart)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Schedule => "schedule",
            Source::Coldstart => "coldstart",
            Source::Prestart => "prestart",
            Source::Metrics => "metrics",
            Source::Qps => "qps",
            Source::Ttl => "ttl",
        };
        f.write_str(s)
    }
}

/// A wish to run `target` replicas of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEvent {
    pub function_name: String,
    pub target: usize,
    pub trend: Trend,
    pub source: Source,
}

impl ScheduleEvent {
    /// The neutral event decisions start from.
    pub fn none(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            target: 0,
            trend: Trend::None,
            source: Source::Schedule,
        }
    }

    pub fn increase(function_name: impl Into<String>, target: usize, source: Source) -> Self {
        Self {
            function_name: function_name.into(),
            target,
            trend: Trend::Increase,
            source,
        }
    }

    pub fn decrease(function_name: impl Into<String>, target: usize, source: Source) -> Self {
        Self {
            function_name: function_name.into(),
            target,
            trend: Trend::Decrease,
            source,
        }
    }

    /// Same wish, attributed to another source.
    pub fn restamp(mut self, source: Source) -> Self {
        self.source = source;
        self
    }
}

/// Receiving ends of the event pipeline, consumed by the runtime.
pub struct EventReceivers {
    pub metrics: mpsc::Receiver<ScheduleEvent>,
    pub schedule: mpsc::Receiver<ScheduleEvent>,
}

/// Cloneable, non-blocking entry point into the event pipeline.
#[derive(Clone)]
pub struct EventSink {
    metrics: mpsc::Sender<ScheduleEvent>,
    schedule: mpsc::Sender<ScheduleEvent>,
}

impl EventSink {
    /// Create a sink and the receivers it feeds.
    pub fn channel() -> (Self, EventReceivers) {
        let (metrics, metrics_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (schedule, schedule_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self { metrics, schedule },
            EventReceivers {
                metrics: metrics_rx,
                schedule: schedule_rx,
            },
        )
    }

    /// Hand an event to the metrics aggregator.
    pub fn to_metrics(&self, event: ScheduleEvent) {
        send(&self.metrics, "metrics", event);
    }

    /// Hand an event to the schedule board.
    pub fn to_schedule(&self, event: ScheduleEvent) {
        send(&self.schedule, "schedule", event);
    }
}

fn send(tx: &mpsc::Sender<ScheduleEvent>, channel: &'static str, event: ScheduleEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => warn!(
            channel,
            function = %event.function_name,
            source = %event.source,
            "Event channel full, dropping event"
        ),
        Err(mpsc::error::TrySendError::Closed(event)) => debug!(
            channel,
            function = %event.function_name,
            "Event channel closed"
        ),
    }
}
