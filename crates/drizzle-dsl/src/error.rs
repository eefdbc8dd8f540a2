// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for drizzle-dsl.

use thiserror::Error;

/// Errors raised while validating or interpreting a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DslError {
    /// The workflow has no flow with role `start`.
    #[error("no start flow found in workflow {0}")]
    NoStartFound(String),

    /// The workflow has more than one flow with role `start`.
    #[error("workflow {workflow} has multiple start flows: {first}, {second}")]
    MultipleStartFlows {
        workflow: String,
        first: String,
        second: String,
    },

    /// The workflow has no flow with role `end`.
    #[error("no end flow found in workflow {0}")]
    NoEndFound(String),

    /// Two flows share a name.
    #[error("duplicate flow name: {0}")]
    DuplicateFlow(String),

    /// A referenced flow does not exist.
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// A referenced condition does not exist in the owning flow.
    #[error("condition not found: {condition} (flow {flow})")]
    ConditionNotFound { flow: String, condition: String },

    /// A flow declares a statement the engine does not know.
    #[error("invalid statement in flow {0}")]
    InvalidStatement(String),

    /// A condition cannot be evaluated against the given value.
    #[error("invalid condition {condition}: {reason}")]
    InvalidCondition { condition: String, reason: String },

    /// A JSON path is malformed.
    #[error("invalid JSON path: {0}")]
    InvalidPath(String),
}

/// Result type for DSL operations.
pub type Result<T> = std::result::Result<T, DslError>;
