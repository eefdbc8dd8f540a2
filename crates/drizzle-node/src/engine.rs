// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow DAG interpreter.
//!
//! Starting from a flow, the engine runs the flow's function through the
//! middleware chain, optionally evaluates its switch tree, then runs every
//! successor on its own task with its own copy of the result. The result of
//! a flow with successors is `{successor: result, ...}`; an end flow, or a
//! flow without successors, yields its own result.
//!
//! Siblings are joined with a [`JoinSet`]: the first failure aborts the
//! remaining siblings and is returned, so a request never sees a partial
//! result.

use std::collections::HashSet;
use std::sync::Arc;

use drizzle_dsl::{ROOT_CONDITION, Role, Statement, Workflow};
use futures::future::{BoxFuture, FutureExt, try_join_all};
use serde_json::{Map, Value, json};
use tokio::task::JoinSet;
use tracing::{Instrument, debug};

use crate::error::{Error, Result};
use crate::events::{EventSink, ScheduleEvent, Source};
use crate::middleware::MiddlewareChain;
use crate::scheduler::FunctionScheduler;
use crate::span::Span;

/// Executes workflows. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    chain: Arc<MiddlewareChain>,
    scheduler: Arc<FunctionScheduler>,
    sink: EventSink,
    prestart: bool,
}

impl Engine {
    pub fn new(chain: Arc<MiddlewareChain>, scheduler: Arc<FunctionScheduler>, sink: EventSink) -> Self {
        Self {
            chain,
            scheduler,
            sink,
            prestart: false,
        }
    }

    /// Warm downstream functions while a flow runs.
    pub fn with_prestart(mut self, prestart: bool) -> Self {
        self.prestart = prestart;
        self
    }

    /// Walk `workflow` from its start flow.
    pub async fn walk(&self, root: &Span, params: Value, workflow: Arc<Workflow>) -> Result<Value> {
        let start = workflow.start_flow()?.name.clone();
        self.walk_flow(root.clone(), start, params, workflow).await
    }

    /// Run only `flow_name`'s function, without walking its successors.
    pub async fn run_flow(
        &self,
        root: &Span,
        flow_name: &str,
        upstream_flow_name: &str,
        params: Value,
        workflow: Arc<Workflow>,
    ) -> Result<Value> {
        let flow = workflow.find_flow(flow_name)?;
        let mut span = root.child(flow_name);
        span.upstream_flow_name = upstream_flow_name.to_string();
        span.function_name = flow.function.clone();
        self.execute(&span, params, &workflow, flow_name).await
    }

    fn walk_flow(
        &self,
        parent: Span,
        flow_name: String,
        params: Value,
        workflow: Arc<Workflow>,
    ) -> BoxFuture<'static, Result<Value>> {
        let engine = self.clone();
        async move {
            let flow = workflow.find_flow(&flow_name)?;
            let mut span = parent.child(&flow.name);
            span.function_name = flow.function.clone();

            let mut result = engine.execute(&span, params, &workflow, &flow_name).await?;

            match flow.statement {
                Statement::Direct => {}
                Statement::Switch => {
                    flow.find_condition(ROOT_CONDITION)?;
                    result = engine
                        .execute_condition(
                            span.clone(),
                            flow_name.clone(),
                            ROOT_CONDITION.to_string(),
                            result,
                            workflow.clone(),
                        )
                        .await?;
                }
                Statement::Unknown => return Err(Error::InvalidStatement(flow.name.clone())),
            }

            if flow.role == Role::End || flow.outputs.is_empty() {
                return Ok(result);
            }
            engine
                .fan_out(&span, flow.outputs.clone(), result, &workflow)
                .await
        }
        .boxed()
    }

    /// Run the middleware chain and the function of `span`.
    async fn execute(&self, span: &Span, params: Value, workflow: &Workflow, flow_name: &str) -> Result<Value> {
        span.start();
        if self.prestart {
            self.prestart(workflow, flow_name);
        }
        let result = self
            .chain
            .run(span, params)
            .instrument(span.tracing_span().clone())
            .await;
        span.finish();
        result
    }

    /// Ask for one instance of every cold downstream function.
    fn prestart(&self, workflow: &Workflow, flow_name: &str) {
        let Ok(flow) = workflow.find_flow(flow_name) else {
            return;
        };
        let mut seen = HashSet::new();
        for next in flow.successors() {
            let Ok(next) = workflow.find_flow(next) else {
                continue;
            };
            let function = next.function.as_str();
            if seen.insert(function) && self.scheduler.function_stats(function) == 0 {
                debug!(function, upstream = %flow_name, "Prestarting downstream function");
                self.sink
                    .to_schedule(ScheduleEvent::increase(function, 1, Source::Prestart));
            }
        }
    }

    /// Walk `nexts` concurrently, each with its own copy of `input`.
    async fn fan_out(
        &self,
        span: &Span,
        nexts: Vec<String>,
        input: Value,
        workflow: &Arc<Workflow>,
    ) -> Result<Value> {
        let mut tasks = JoinSet::new();
        for next in nexts {
            let walk = self.walk_flow(span.clone(), next.clone(), input.clone(), workflow.clone());
            tasks.spawn(async move { (next, walk.await) });
        }

        let mut merged = Map::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(result))) => {
                    merged.insert(name, result);
                }
                Ok((name, Err(e))) => {
                    debug!(flow = %name, error = %e, "Branch failed, aborting siblings");
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => {}
            }
        }
        Ok(Value::Object(merged))
    }

    /// Evaluate a condition of `flow_name` and follow the branch it picks.
    ///
    /// Returns `{"conditions": {name: ..}, "flows": {name: ..}}`.
    fn execute_condition(
        &self,
        span: Span,
        flow_name: String,
        condition_name: String,
        result: Value,
        workflow: Arc<Workflow>,
    ) -> BoxFuture<'static, Result<Value>> {
        let engine = self.clone();
        async move {
            let flow = workflow.find_flow(&flow_name)?;
            let condition = flow.find_condition(&condition_name)?;
            let taken = drizzle_dsl::evaluate(condition, &result)?;
            let next = if taken {
                &condition.destination.is_true
            } else {
                &condition.destination.is_false
            };
            debug!(flow = %flow_name, condition = %condition_name, taken, "Condition evaluated");

            let conditions = try_join_all(next.conditions.iter().map(|name| {
                let sub = engine.execute_condition(
                    span.clone(),
                    flow_name.clone(),
                    name.clone(),
                    result.clone(),
                    workflow.clone(),
                );
                let name = name.clone();
                async move { Ok::<_, Error>((name, sub.await?)) }
            }));
            let flows = engine.fan_out(&span, next.flows.clone(), result.clone(), &workflow);

            let (conditions, flows) = futures::try_join!(conditions, flows)?;
            Ok(json!({
                "conditions": Map::from_iter(conditions),
                "flows": flows,
            }))
        }
        .boxed()
    }
}
