// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drizzle DSL - workflow definitions and switch-condition evaluation
//!
//! - [`workflow`]: flows, conditions, workflows and structural validation
//! - [`condition`]: typed comparison of JSON-path or literal operands
//! - [`path`]: the JSON-path subset used by conditions

pub mod condition;
pub mod error;
pub mod path;
pub mod workflow;

pub use condition::evaluate;
pub use error::{DslError, Result};
pub use workflow::{
    Condition, ConditionType, Destination, Flow, Next, Operator, ROOT_CONDITION, Role, Statement,
    Workflow,
};
