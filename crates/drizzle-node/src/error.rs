// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for drizzle-node.

use drizzle_dsl::DslError;
use drizzle_protocol::FrameError;
use thiserror::Error;

/// Node errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The function has no Running instance on this node.
    #[error("no instance for function {0}")]
    NoInstance(String),

    /// The picked instance stopped serving before the request completed.
    #[error("instance not in service")]
    InstanceNotService,

    /// No peer is able to serve the function.
    #[error("no valid peer target for function {0}")]
    NoValidTarget(String),

    /// Workflow has no start flow.
    #[error("no start flow found in workflow {0}")]
    NoStartFound(String),

    /// A referenced flow does not exist.
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    /// A referenced condition does not exist.
    #[error("condition not found: {0}")]
    ConditionNotFound(String),

    /// A flow declares a statement the engine does not know.
    #[error("invalid statement in flow {0}")]
    InvalidStatement(String),

    /// A condition cannot be evaluated.
    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    /// The workflow definition is structurally broken.
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// The control plane does not know the workflow.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Instance creation was refused by the create policy.
    #[error("resource limit reached for function {0}")]
    ResourceLimit(String),

    /// A worker process could not be started.
    #[error("launch failed: {0}")]
    Launch(String),

    /// Pipe framing failed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The worker answered with an error.
    #[error("worker failed: {0}")]
    WorkerFailed(String),

    /// Forwarding to a peer failed.
    #[error("peer request failed: {0}")]
    PeerRequest(String),

    /// Control plane call failed.
    #[error("control plane error: {0}")]
    ControlPlane(String),

    /// Function code could not be fetched or unpacked.
    #[error("code store error: {0}")]
    CodeStore(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error comes from a malformed workflow definition.
    pub fn is_definition_error(&self) -> bool {
        matches!(
            self,
            Error::NoStartFound(_)
                | Error::FlowNotFound(_)
                | Error::ConditionNotFound(_)
                | Error::InvalidStatement(_)
                | Error::InvalidCondition(_)
                | Error::InvalidWorkflow(_)
        )
    }

    /// Whether the error comes from scheduling (no capacity here or on peers).
    pub fn is_scheduling_error(&self) -> bool {
        matches!(
            self,
            Error::NoInstance(_)
                | Error::InstanceNotService
                | Error::NoValidTarget(_)
                | Error::ResourceLimit(_)
                | Error::Launch(_)
        )
    }
}

impl From<DslError> for Error {
    fn from(err: DslError) -> Self {
        match err {
            DslError::NoStartFound(wf) => Error::NoStartFound(wf),
            DslError::FlowNotFound(name) => Error::FlowNotFound(name),
            DslError::ConditionNotFound { condition, .. } => Error::ConditionNotFound(condition),
            DslError::InvalidStatement(flow) => Error::InvalidStatement(flow),
            DslError::InvalidCondition { .. } | DslError::InvalidPath(_) => {
                Error::InvalidCondition(err.to_string())
            }
            other => Error::InvalidWorkflow(other.to_string()),
        }
    }
}

/// Result type using the node Error.
pub type Result<T> = std::result::Result<T, Error>;
