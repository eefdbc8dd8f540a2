// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions.
//!
//! A workflow is an ordered list of flows forming a DAG. Each flow names the
//! function it runs, the flows that receive its result (`outputs`) and,
//! for `switch` flows, a tree of conditions rooted at [`ROOT_CONDITION`].
//!
//! ```json
//! {
//!   "name": "orders",
//!   "spec": [
//!     {"name": "start", "function": "A", "outputs": ["next"], "role": "start"},
//!     {"name": "next", "function": "B", "outputs": ["end"], "role": "mid"},
//!     {"name": "end", "function": "C", "role": "end"}
//!   ]
//! }
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DslError, Result};

/// Reserved name of the condition a switch flow starts evaluating from.
pub const ROOT_CONDITION: &str = "root";

/// How a flow chooses what to do with its result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Statement {
    /// Pass the result straight to every output.
    #[default]
    Direct,
    /// Evaluate the condition tree, then pass the outcome to every output.
    Switch,
    /// Anything else found in a definition; rejected by the engine.
    #[serde(other)]
    Unknown,
}

/// Position of a flow in the DAG.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Start,
    #[default]
    Mid,
    End,
}

/// Value type a condition compares in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConditionType {
    Bool,
    Int,
    String,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// What to run when a condition takes one of its branches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Next {
    #[serde(default)]
    pub flows: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl Next {
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty() && self.conditions.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    #[serde(default)]
    pub is_true: Next,
    #[serde(default)]
    pub is_false: Next,
}

/// A node of a switch tree.
///
/// `target` and `comparison` are either literals or JSON paths (`$.a.b`)
/// into the result of the flow's function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub operator: Operator,
    pub target: Value,
    pub comparison: Value,
    #[serde(default)]
    pub destination: Destination,
}

/// A node of the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    pub function: String,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub statement: Statement,
    #[serde(default)]
    pub role: Role,
}

impl Flow {
    /// Find a condition of this flow by name.
    pub fn find_condition(&self, name: &str) -> Result<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DslError::ConditionNotFound {
                flow: self.name.clone(),
                condition: name.to_string(),
            })
    }

    /// Flows that may run after this one, through outputs or any branch.
    pub fn successors(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(String::as_str).chain(
            self.conditions.iter().flat_map(|c| {
                c.destination
                    .is_true
                    .flows
                    .iter()
                    .chain(c.destination.is_false.flows.iter())
                    .map(String::as_str)
            }),
        )
    }
}

/// An ordered set of flows defining one serverless application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub spec: Vec<Flow>,
}

impl Workflow {
    /// Find a flow by name.
    pub fn find_flow(&self, name: &str) -> Result<&Flow> {
        self.spec
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| DslError::FlowNotFound(name.to_string()))
    }

    /// The unique flow with role `start`.
    pub fn start_flow(&self) -> Result<&Flow> {
        self.spec
            .iter()
            .find(|f| f.role == Role::Start)
            .ok_or_else(|| DslError::NoStartFound(self.name.clone()))
    }

    /// Distinct function names used by the workflow, in definition order.
    pub fn functions(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.spec
            .iter()
            .map(|f| f.function.as_str())
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Check the structural invariants of the definition.
    ///
    /// - exactly one start flow and at least one end flow
    /// - flow names are unique
    /// - every statement is known
    /// - every flow and condition reference resolves
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for flow in &self.spec {
            if !names.insert(flow.name.as_str()) {
                return Err(DslError::DuplicateFlow(flow.name.clone()));
            }
        }

        let mut starts = self.spec.iter().filter(|f| f.role == Role::Start);
        let first = starts
            .next()
            .ok_or_else(|| DslError::NoStartFound(self.name.clone()))?;
        if let Some(second) = starts.next() {
            return Err(DslError::MultipleStartFlows {
                workflow: self.name.clone(),
                first: first.name.clone(),
                second: second.name.clone(),
            });
        }
        if !self.spec.iter().any(|f| f.role == Role::End) {
            return Err(DslError::NoEndFound(self.name.clone()));
        }

        for flow in &self.spec {
            if flow.statement == Statement::Unknown {
                return Err(DslError::InvalidStatement(flow.name.clone()));
            }
            for output in flow.successors() {
                if !names.contains(output) {
                    return Err(DslError::FlowNotFound(output.to_string()));
                }
            }
            for condition in &flow.conditions {
                let branches = [&condition.destination.is_true, &condition.destination.is_false];
                for name in branches.iter().flat_map(|n| n.conditions.iter()) {
                    flow.find_condition(name)?;
                }
            }
            if flow.statement == Statement::Switch {
                flow.find_condition(ROOT_CONDITION)?;
            }
        }
        Ok(())
    }
}
