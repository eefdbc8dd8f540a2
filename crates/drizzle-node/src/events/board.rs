// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schedule decision board.
//!
//! One [`ScoreBoard`] per function keeps the latest event of every source
//! and reconciles them into a single target:
//!
//! - walk sources in priority order, merging each into a neutral event
//! - forget one-shot sources
//! - merge the previous best wish and keep the result as the new one
//!
//! Merging into an Increase only ever raises the target, merging into a
//! Decrease only ever lowers it, and None-trend events are ignored.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, mpsc};
use tracing::{debug, info};

use super::{ScheduleEvent, Source, Trend};
use crate::scheduler::FunctionScheduler;

/// Merge `incoming` into `origin`. Returns whether `incoming` was used.
fn merge(origin: &mut ScheduleEvent, incoming: &ScheduleEvent) -> bool {
    if incoming.trend == Trend::None {
        return false;
    }
    match origin.trend {
        Trend::None => *origin = incoming.clone(),
        Trend::Increase => origin.target = origin.target.max(incoming.target),
        Trend::Decrease => origin.target = origin.target.min(incoming.target),
    }
    true
}

/// Per-function aggregator of scaling wishes.
#[derive(Debug, Clone)]
pub struct ScoreBoard {
    function_name: String,
    best_wish: ScheduleEvent,
    scores: HashMap<Source, ScheduleEvent>,
}

impl ScoreBoard {
    pub fn new(function_name: impl Into<String>) -> Self {
        let function_name = function_name.into();
        Self {
            best_wish: ScheduleEvent::none(function_name.clone()),
            function_name,
            scores: HashMap::new(),
        }
    }

    /// The last accepted decision.
    pub fn best_wish(&self) -> &ScheduleEvent {
        &self.best_wish
    }

    /// Latest stored event of `source`, if any.
    pub fn score(&self, source: Source) -> Option<&ScheduleEvent> {
        self.scores.get(&source)
    }

    /// Store `event` as the latest wish of its source.
    pub fn update(&mut self, event: ScheduleEvent) {
        self.scores.insert(event.source, event);
    }

    /// Reconcile all stored wishes.
    ///
    /// Returns `None` when nothing has an opinion yet; the best wish is left
    /// untouched in that case.
    pub fn decide(&mut self) -> Option<ScheduleEvent> {
        let mut origin = ScheduleEvent::none(self.function_name.clone());
        for source in Source::ALL {
            if let Some(score) = self.scores.get(&source) {
                merge(&mut origin, score);
            }
        }

        self.scores.retain(|source, _| !source.delete_after_use());
        merge(&mut origin, &self.best_wish);

        if origin.trend == Trend::None {
            return None;
        }
        self.best_wish = origin.clone();
        Some(origin)
    }
}

/// Single consumer of the schedule channel; applies every decision through
/// [`FunctionScheduler::refresh`] before looking at the next event.
pub struct ScheduleBoard {
    scheduler: Arc<FunctionScheduler>,
    boards: HashMap<String, ScoreBoard>,
    events: mpsc::Receiver<ScheduleEvent>,
    shutdown: Arc<Notify>,
}

impl ScheduleBoard {
    pub fn new(scheduler: Arc<FunctionScheduler>, events: mpsc::Receiver<ScheduleEvent>) -> Self {
        Self {
            scheduler,
            boards: HashMap::new(),
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled or every producer is gone.
    pub async fn run(mut self) {
        info!("Schedule board started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Schedule board received shutdown signal");
                    break;
                }

                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                }
            }
        }
        info!("Schedule board stopped");
    }

    /// Record one event and apply the resulting decision.
    pub async fn handle(&mut self, event: ScheduleEvent) {
        let function_name = event.function_name.clone();
        let board = self
            .boards
            .entry(function_name.clone())
            .or_insert_with(|| ScoreBoard::new(function_name.clone()));

        debug!(
            function = %function_name,
            source = %event.source,
            trend = ?event.trend,
            target = event.target,
            "Schedule event"
        );
        board.update(event);

        match board.decide() {
            Some(decision) => {
                info!(
                    function = %function_name,
                    target = decision.target,
                    trend = ?decision.trend,
                    "Scaling decision"
                );
                self.scheduler.refresh(&function_name, decision.target).await;
            }
            None => debug!(function = %function_name, "No scaling decision"),
        }
    }

    /// Current best wish for `function_name`.
    pub fn best_wish(&self, function_name: &str) -> Option<&ScheduleEvent> {
        self.boards.get(function_name).map(ScoreBoard::best_wish)
    }
}
