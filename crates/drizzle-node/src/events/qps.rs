// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request rate tracking.
//!
//! [`QpsRecorder`] counts requests per function on the hot path with a
//! single atomic increment. [`QpsSampler`] ticks once per period, turns the
//! counters into per-second samples and emits scaling wishes when the target
//! derived from the rate changes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{EventSink, ScheduleEvent, Source};

/// Samples kept per function.
pub const RING_CAPACITY: usize = 1000;

/// Requests per second one instance is expected to absorb.
pub const REQUESTS_PER_INSTANCE: f64 = 10.0;

#[derive(Default)]
struct FunctionCounter {
    total: AtomicU64,
    last_total: AtomicU64,
    samples: Mutex<VecDeque<u64>>,
}

/// Per-function request counters.
#[derive(Default)]
pub struct QpsRecorder {
    counters: DashMap<String, Arc<FunctionCounter>>,
}

impl QpsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request for `function_name`.
    pub fn record(&self, function_name: &str) {
        if let Some(counter) = self.counters.get(function_name) {
            counter.total.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(function_name.to_string())
            .or_default()
            .total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Total requests recorded for `function_name`.
    pub fn total(&self, function_name: &str) -> u64 {
        self.counters
            .get(function_name)
            .map(|c| c.total.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Close the current sample period of every function.
    pub fn tick(&self) {
        for entry in self.counters.iter() {
            let counter = entry.value();
            let total = counter.total.load(Ordering::Relaxed);
            let last = counter.last_total.swap(total, Ordering::Relaxed);
            let mut samples = counter
                .samples
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if samples.len() == RING_CAPACITY {
                samples.pop_front();
            }
            samples.push_back(total.saturating_sub(last));
        }
    }

    /// Average requests per sample over the last `window` samples.
    pub fn rate(&self, function_name: &str, window: usize) -> f64 {
        let Some(counter) = self.counters.get(function_name) else {
            return 0.0;
        };
        let samples = counter
            .samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let taken = samples.len().min(window.max(1));
        if taken == 0 {
            return 0.0;
        }
        let sum: u64 = samples.iter().rev().take(taken).sum();
        sum as f64 / taken as f64
    }

    /// Functions seen so far.
    pub fn functions(&self) -> Vec<String> {
        self.counters.iter().map(|e| e.key().clone()).collect()
    }
}

/// Map a request rate to a replica target.
pub fn qps_target(rate: f64) -> usize {
    if rate <= 0.0 {
        0
    } else {
        ((rate / REQUESTS_PER_INSTANCE).floor() as usize).max(1)
    }
}

/// Configuration for the QPS sampler.
#[derive(Debug, Clone)]
pub struct QpsSamplerConfig {
    /// Sample period.
    pub period: Duration,
    /// Samples averaged into the rate.
    pub window: usize,
}

impl Default for QpsSamplerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            window: 5,
        }
    }
}

/// Background worker turning request counts into Qps events.
pub struct QpsSampler {
    recorder: Arc<QpsRecorder>,
    sink: EventSink,
    config: QpsSamplerConfig,
    previous: HashMap<String, usize>,
    shutdown: Arc<Notify>,
}

impl QpsSampler {
    pub fn new(recorder: Arc<QpsRecorder>, sink: EventSink, config: QpsSamplerConfig) -> Self {
        Self {
            recorder,
            sink,
            config,
            previous: HashMap::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(mut self) {
        info!(
            period_ms = self.config.period.as_millis() as u64,
            window = self.config.window,
            "QPS sampler started"
        );
        let mut interval = tokio::time::interval(self.config.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("QPS sampler received shutdown signal");
                    break;
                }

                _ = interval.tick() => {
                    for event in self.sample() {
                        self.sink.to_metrics(event);
                    }
                }
            }
        }
        info!("QPS sampler stopped");
    }

    /// Close one period and return the wishes that changed.
    pub fn sample(&mut self) -> Vec<ScheduleEvent> {
        self.recorder.tick();

        let mut events = Vec::new();
        for function in self.recorder.functions() {
            let rate = self.recorder.rate(&function, self.config.window);
            let target = qps_target(rate);
            let previous = self.previous.insert(function.clone(), target).unwrap_or(0);

            if target > previous {
                debug!(function = %function, rate, target, "QPS rising");
                events.push(ScheduleEvent::increase(function, target, Source::Qps));
            } else if target < previous {
                debug!(function = %function, rate, target, "QPS falling");
                events.push(ScheduleEvent::decrease(function, target, Source::Qps));
            }
        }
        events
    }
}
