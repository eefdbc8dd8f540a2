// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message types carried by the worker pipes and the node HTTP endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Id reserved for the ready frame a worker sends once it can take requests.
pub const READY_ID: u64 = 0;

/// Request sent from the node to a worker over fd 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlation id, unique per instance. Never [`READY_ID`].
    pub id: u64,
    /// Function parameters.
    #[serde(default)]
    pub params: Value,
}

impl RequestFrame {
    pub fn new(id: u64, params: Value) -> Self {
        Self { id, params }
    }
}

/// Response sent from a worker to the node over fd 4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Id of the request this answers.
    pub id: u64,
    /// Function result (null on error).
    #[serde(default)]
    pub result: Value,
    /// Error message raised by the function, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    /// The first frame a worker emits after loading its code.
    pub fn ready() -> Self {
        Self {
            id: READY_ID,
            result: Value::Null,
            error: None,
        }
    }

    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.id == READY_ID
    }

    /// Convert into the function outcome.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}

/// Body accepted by the node's invoke endpoint.
///
/// An empty `flow_name` walks the whole workflow from its start flow. A
/// non-empty one runs just that flow's function, which is how peers hand
/// work to each other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRequest {
    pub workflow_name: String,
    #[serde(default)]
    pub flow_name: String,
    #[serde(default)]
    pub upstream_flow_name: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Body returned by the node's invoke endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: Value,
    /// Wall time spent serving the request, e.g. `"1.52ms"`.
    #[serde(default)]
    pub time: String,
}

impl WorkflowResponse {
    pub fn success(result: Value, elapsed: std::time::Duration) -> Self {
        Self {
            success: true,
            message: String::new(),
            result,
            time: format!("{:?}", elapsed),
        }
    }

    pub fn failure(message: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self {
            success: false,
            message: message.into(),
            result: Value::Null,
            time: format!("{:?}", elapsed),
        }
    }
}
