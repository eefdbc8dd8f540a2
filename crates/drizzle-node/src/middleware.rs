// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Middleware chain run in front of every flow execution.
//!
//! | Middleware | Priority | Effect |
//! |---|---|---|
//! | `Static` | 1 | forward to a peer when nothing runs locally |
//! | `ColdStart` | 2 | ask for one instance and wait for it |
//! | `PeerForward` | 2 | forward to a peer when the cold start did not finish in time |
//! | `QpsRecord` | 10 | count the request |
//!
//! Lower priorities run first; equal priorities keep insertion order. An
//! error stops the chain with a failure, `Abort` stops it with a result, and
//! when every middleware says `Next` the flow runs on a local instance.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::{EventSink, QpsRecorder, ScheduleEvent, Source};
use crate::peer::PeerForwarder;
use crate::scheduler::FunctionScheduler;
use crate::span::Span;

/// Result of one middleware.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Continue with the next middleware.
    Next,
    /// Stop here; the flow's result is the given value.
    Abort(Value),
}

/// The closed set of middlewares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Middleware {
    Static,
    ColdStart,
    PeerForward,
    QpsRecord,
}

impl Middleware {
    pub fn priority(self) -> u8 {
        match self {
            Middleware::Static => 1,
            Middleware::ColdStart | Middleware::PeerForward => 2,
            Middleware::QpsRecord => 10,
        }
    }
}

/// Ordered middlewares plus what they need to act.
pub struct MiddlewareChain {
    middlewares: Vec<Middleware>,
    scheduler: Arc<FunctionScheduler>,
    sink: EventSink,
    recorder: Arc<QpsRecorder>,
    forwarder: Option<Arc<PeerForwarder>>,
    lsds_wait: Duration,
}

impl MiddlewareChain {
    /// Chain with only the cold-start middleware.
    pub fn new(
        scheduler: Arc<FunctionScheduler>,
        sink: EventSink,
        recorder: Arc<QpsRecorder>,
        lsds_wait: Duration,
    ) -> Self {
        Self {
            middlewares: vec![Middleware::ColdStart],
            scheduler,
            sink,
            recorder,
            forwarder: None,
            lsds_wait,
        }
    }

    /// Add `middleware`, keeping the chain sorted by priority.
    pub fn with(mut self, middleware: Middleware) -> Self {
        if !self.middlewares.contains(&middleware) {
            self.middlewares.push(middleware);
            // Stable: equal priorities keep insertion order.
            self.middlewares.sort_by_key(|m| m.priority());
        }
        self
    }

    pub fn with_forwarder(mut self, forwarder: Arc<PeerForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn middlewares(&self) -> &[Middleware] {
        &self.middlewares
    }

    /// Run the chain for `span`, then the flow itself if nothing aborted.
    pub async fn run(&self, span: &Span, params: Value) -> Result<Value> {
        for middleware in &self.middlewares {
            match self.apply(*middleware, span, &params).await? {
                Outcome::Next => {}
                Outcome::Abort(result) => {
                    debug!(function = %span.function_name, ?middleware, "Middleware aborted chain");
                    return Ok(result);
                }
            }
        }
        self.scheduler.run(span, params).await
    }

    async fn apply(&self, middleware: Middleware, span: &Span, params: &Value) -> Result<Outcome> {
        let function = span.function_name.as_str();
        match middleware {
            Middleware::Static => {
                if self.scheduler.function_stats(function) > 0 || span.forwarded {
                    return Ok(Outcome::Next);
                }
                match &self.forwarder {
                    Some(forwarder) => Ok(Outcome::Abort(forwarder.forward(span, params.clone()).await?)),
                    None => Ok(Outcome::Next),
                }
            }

            Middleware::ColdStart => {
                if self.scheduler.function_stats(function) > 0 {
                    return Ok(Outcome::Next);
                }
                let set = self.scheduler.get_or_create(function);
                info!(function, "Cold start");
                self.sink
                    .to_schedule(ScheduleEvent::increase(function, 1, Source::Coldstart));
                if !set.function_cold_start_done(self.lsds_wait).await {
                    debug!(function, wait_ms = self.lsds_wait.as_millis() as u64, "Cold start still pending");
                }
                Ok(Outcome::Next)
            }

            Middleware::PeerForward => {
                if self.scheduler.function_stats(function) > 0 || span.forwarded {
                    return Ok(Outcome::Next);
                }
                let forwarder = self
                    .forwarder
                    .as_ref()
                    .ok_or_else(|| Error::NoValidTarget(function.to_string()))?;
                Ok(Outcome::Abort(forwarder.forward(span, params.clone()).await?))
            }

            Middleware::QpsRecord => {
                self.recorder.record(function);
                Ok(Outcome::Next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerReplicas;
    use crate::control_plane::LocalControlPlane;
    use crate::events::{EventReceivers, Trend};
    use crate::launcher::MockLauncher;
    use crate::scheduler::AllowAll;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        scheduler: Arc<FunctionScheduler>,
        sink: EventSink,
        events: EventReceivers,
        recorder: Arc<QpsRecorder>,
    }

    fn fixture() -> Fixture {
        let (sink, events) = EventSink::channel();
        let (scheduler, _trigger) = FunctionScheduler::new(
            Arc::new(MockLauncher::new()),
            Arc::new(AllowAll),
            Duration::from_secs(20),
            sink.clone(),
        );
        Fixture {
            scheduler: Arc::new(scheduler),
            sink,
            events,
            recorder: Arc::new(QpsRecorder::new()),
        }
    }

    fn span(function: &str, forwarded: bool) -> Span {
        let mut span = Span::root("wf", forwarded, None).child("f");
        span.function_name = function.to_string();
        span
    }

    fn chain(f: &Fixture, wait: Duration) -> MiddlewareChain {
        MiddlewareChain::new(f.scheduler.clone(), f.sink.clone(), f.recorder.clone(), wait)
    }

    #[test]
    fn test_chain_sorted_by_priority() {
        let f = fixture();
        let chain = chain(&f, Duration::from_millis(1))
            .with(Middleware::QpsRecord)
            .with(Middleware::PeerForward)
            .with(Middleware::Static)
            .with(Middleware::QpsRecord);
        assert_eq!(
            chain.middlewares(),
            &[
                Middleware::Static,
                Middleware::ColdStart,
                Middleware::PeerForward,
                Middleware::QpsRecord
            ]
        );
    }

    #[tokio::test]
    async fn test_cold_start_requests_an_instance() {
        let mut f = fixture();
        let chain = chain(&f, Duration::from_millis(50)).with(Middleware::QpsRecord);

        let result = chain.run(&span("A", false), json!({})).await;
        assert!(matches!(result, Err(Error::NoInstance(_))));

        let event = f.events.schedule.try_recv().unwrap();
        assert_eq!(event.source, Source::Coldstart);
        assert_eq!(event.trend, Trend::Increase);
        assert_eq!(event.target, 1);
        assert_eq!(f.recorder.total("A"), 1);
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_warm_function_runs_locally() {
        let mut f = fixture();
        f.scheduler.refresh("A", 1).await;
        let set = f.scheduler.get("A").unwrap();
        assert!(set.function_cold_start_done(Duration::from_secs(5)).await);

        let chain = chain(&f, Duration::from_millis(50));
        let result = chain.run(&span("A", false), json!({"a": "b"})).await.unwrap();
        assert_eq!(result, json!({"a": "b", "A": "A"}));
        assert!(f.events.schedule.try_recv().is_err());
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_static_forwards_cold_function() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "message": "", "result": {"from": "peer"}, "time": "1ms"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut f = fixture();
        let peers = PeerReplicas::from([(server.uri(), [("A".to_string(), 1)].into())]);
        let control_plane = Arc::new(LocalControlPlane::new().with_peers(peers));
        let forwarder = PeerForwarder::new(control_plane, "self", Duration::from_secs(5)).unwrap();
        let chain = chain(&f, Duration::from_millis(50))
            .with(Middleware::Static)
            .with_forwarder(Arc::new(forwarder));

        let result = chain.run(&span("A", false), json!({})).await.unwrap();
        assert_eq!(result, json!({"from": "peer"}));
        // Static runs before the cold start, so nothing was requested.
        assert!(f.events.schedule.try_recv().is_err());
        f.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_forwarded_span_is_not_forwarded_again() {
        let f = fixture();
        let chain = chain(&f, Duration::from_millis(20)).with(Middleware::PeerForward);
        let result = chain.run(&span("A", true), json!({})).await;
        assert!(matches!(result, Err(Error::NoInstance(_))));

        let result = chain.run(&span("A", false), json!({})).await;
        assert!(matches!(result, Err(Error::NoValidTarget(_))));
        f.scheduler.shutdown().await;
    }
}
