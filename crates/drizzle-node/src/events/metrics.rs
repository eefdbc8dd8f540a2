// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Metrics aggregator.
//!
//! Combines the QPS and TTL signals of each function into one Metrics event
//! for the schedule board.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, mpsc};
use tracing::{debug, info};

use super::{EventSink, ScheduleEvent, Source, Trend};

/// Last QPS and TTL events of one function.
#[derive(Debug, Clone, Default)]
pub struct MetricsSlots {
    pub qps: Option<ScheduleEvent>,
    pub ttl: Option<ScheduleEvent>,
}

impl MetricsSlots {
    /// Combine the slots into the event forwarded to the board.
    ///
    /// - one slot: that event, re-stamped as Metrics
    /// - both, QPS increasing: the larger target, Increase
    /// - both, QPS decreasing: the TTL target, Decrease
    pub fn decide(&self) -> Option<ScheduleEvent> {
        match (&self.qps, &self.ttl) {
            (None, None) => None,
            (Some(only), None) | (None, Some(only)) => Some(only.clone().restamp(Source::Metrics)),
            (Some(qps), Some(ttl)) => match qps.trend {
                Trend::Increase => Some(ScheduleEvent::increase(
                    qps.function_name.clone(),
                    qps.target.max(ttl.target),
                    Source::Metrics,
                )),
                Trend::Decrease => Some(ScheduleEvent::decrease(
                    qps.function_name.clone(),
                    ttl.target,
                    Source::Metrics,
                )),
                Trend::None => None,
            },
        }
    }
}

/// Consumer of the metrics channel.
pub struct MetricsAggregator {
    sink: EventSink,
    slots: HashMap<String, MetricsSlots>,
    events: mpsc::Receiver<ScheduleEvent>,
    shutdown: Arc<Notify>,
}

impl MetricsAggregator {
    pub fn new(sink: EventSink, events: mpsc::Receiver<ScheduleEvent>) -> Self {
        Self {
            sink,
            slots: HashMap::new(),
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(mut self) {
        info!("Metrics aggregator started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Metrics aggregator received shutdown signal");
                    break;
                }

                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(decision) = self.handle(event) {
                            self.sink.to_schedule(decision);
                        }
                    }
                    None => break,
                }
            }
        }
        info!("Metrics aggregator stopped");
    }

    /// Record one event; returns what should go to the schedule board.
    pub fn handle(&mut self, event: ScheduleEvent) -> Option<ScheduleEvent> {
        let slots = self.slots.entry(event.function_name.clone()).or_default();
        match event.source {
            Source::Qps => slots.qps = Some(event),
            Source::Ttl => slots.ttl = Some(event),
            other => {
                debug!(source = %other, function = %event.function_name, "Ignoring metrics event");
                return None;
            }
        }
        slots.decide()
    }
}
