// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Condition evaluation for switch flows.
//!
//! Operands are resolved against the function result first (when they are
//! JSON paths), then coerced to the condition's declared type before the
//! operator is applied.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::{DslError, Result};
use crate::path;
use crate::workflow::{Condition, ConditionType, Operator};

/// An operand after coercion to the declared condition type.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Bool(bool),
    Int(i64),
    String(String),
}

/// Resolve a raw operand: JSON-path strings are looked up in `result`,
/// anything else is taken literally.
pub fn resolve<'a>(condition: &Condition, raw: &'a Value, result: &'a Value) -> Result<&'a Value> {
    match raw {
        Value::String(s) if path::is_path(s) => {
            path::lookup(result, s)?.ok_or_else(|| DslError::InvalidCondition {
                condition: condition.name.clone(),
                reason: format!("path {s} not found in result"),
            })
        }
        other => Ok(other),
    }
}

/// Coerce a resolved value to `kind`.
pub fn coerce(condition: &Condition, kind: ConditionType, value: &Value) -> Result<Operand> {
    let fail = || DslError::InvalidCondition {
        condition: condition.name.clone(),
        reason: format!("cannot convert {value} to {kind}"),
    };

    match kind {
        ConditionType::Bool => match value {
            Value::Bool(b) => Ok(Operand::Bool(*b)),
            Value::String(s) => s.trim().parse::<bool>().map(Operand::Bool).map_err(|_| fail()),
            _ => Err(fail()),
        },
        ConditionType::Int => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Operand::Int)
                .ok_or_else(fail),
            Value::String(s) => s.trim().parse::<i64>().map(Operand::Int).map_err(|_| fail()),
            _ => Err(fail()),
        },
        ConditionType::String => match value {
            Value::String(s) => Ok(Operand::String(s.clone())),
            Value::Number(n) => Ok(Operand::String(n.to_string())),
            Value::Bool(b) => Ok(Operand::String(b.to_string())),
            _ => Err(fail()),
        },
    }
}

fn compare(condition: &Condition, left: &Operand, right: &Operand) -> Result<Ordering> {
    match (left, right) {
        (Operand::Int(a), Operand::Int(b)) => Ok(a.cmp(b)),
        (Operand::String(a), Operand::String(b)) => Ok(a.cmp(b)),
        (Operand::Bool(a), Operand::Bool(b)) => Ok(a.cmp(b)),
        _ => Err(DslError::InvalidCondition {
            condition: condition.name.clone(),
            reason: "operands have different types".to_string(),
        }),
    }
}

/// Evaluate `condition` against the function `result`.
///
/// Bool conditions only support `eq` and `ne`.
pub fn evaluate(condition: &Condition, result: &Value) -> Result<bool> {
    if condition.kind == ConditionType::Bool
        && !matches!(condition.operator, Operator::Eq | Operator::Ne)
    {
        return Err(DslError::InvalidCondition {
            condition: condition.name.clone(),
            reason: format!("operator {} not supported for bool", condition.operator),
        });
    }

    let target = resolve(condition, &condition.target, result)?;
    let comparison = resolve(condition, &condition.comparison, result)?;
    let left = coerce(condition, condition.kind, target)?;
    let right = coerce(condition, condition.kind, comparison)?;
    let ordering = compare(condition, &left, &right)?;

    Ok(match condition.operator {
        Operator::Eq => ordering == Ordering::Equal,
        Operator::Ne => ordering != Ordering::Equal,
        Operator::Lt => ordering == Ordering::Less,
        Operator::Le => ordering != Ordering::Greater,
        Operator::Gt => ordering == Ordering::Greater,
        Operator::Ge => ordering != Ordering::Less,
    })
}
