//! Expression collaborator used for guards, cardinality, completion conditions,
//! conditional events and expression-backed service tasks.
//!
//! The engine never interprets a full expression language itself. It hands
//! every [`Expression`] to an [`ExpressionEvaluator`]; the built-in
//! [`DefaultEvaluator`] covers literals, variable reads and single
//! comparisons, and leaves `Script` expressions to an externally supplied
//! evaluator.

use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    Literal(Value),
    Variable(String),
    Compare {
        variable: String,
        op: CompareOp,
        value: Value,
    },
    Not(Box<Expression>),
    /// Opaque script text for an external evaluator.
    Script(String),
}

impl Expression {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn variable(name: &str) -> Self {
        Expression::Variable(name.to_string())
    }

    pub fn compare(variable: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        Expression::Compare {
            variable: variable.to_string(),
            op,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("cannot compare {left:?} with {right:?}")]
    Incomparable { left: Value, right: Value },
    #[error("'not' needs a boolean operand, got {0:?}")]
    NotBoolean(Value),
    #[error("no evaluator available for script expression '{0}'")]
    UnsupportedScript(String),
}

/// Read access to the variables visible from one execution.
pub trait VariableScope {
    fn variable(&self, name: &str) -> Option<Value>;
}

impl VariableScope for std::collections::BTreeMap<String, Value> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Evaluates expressions against an execution's variable scope.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expr: &Expression, scope: &dyn VariableScope) -> Result<Value, EvalError>;
}

/// Evaluator for everything except `Script`.
///
/// Unset variables read as `Null`; comparing `Null` with anything other than
/// `Null` is simply unequal, which keeps guards on not-yet-written variables
/// false instead of failing the trigger.
#[derive(Debug, Default, Clone)]
pub struct DefaultEvaluator;

impl ExpressionEvaluator for DefaultEvaluator {
    fn evaluate(&self, expr: &Expression, scope: &dyn VariableScope) -> Result<Value, EvalError> {
        match expr {
            Expression::Literal(v) => Ok(v.clone()),
            Expression::Variable(name) => Ok(scope.variable(name).unwrap_or(Value::Null)),
            Expression::Compare {
                variable,
                op,
                value,
            } => {
                let left = scope.variable(variable).unwrap_or(Value::Null);
                compare(&left, *op, value).map(Value::Bool)
            }
            Expression::Not(inner) => match self.evaluate(inner, scope)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(EvalError::NotBoolean(other)),
            },
            Expression::Script(text) => Err(EvalError::UnsupportedScript(text.clone())),
        }
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool, EvalError> {
    match op {
        CompareOp::Eq => return Ok(left == right),
        CompareOp::Neq => return Ok(left != right),
        _ => {}
    }
    let ordering = match (left, right) {
        (Value::I64(a), Value::I64(b)) => a.cmp(b),
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Null, _) | (_, Value::Null) => return Ok(false),
        _ => {
            return Err(EvalError::Incomparable {
                left: left.clone(),
                right: right.clone(),
            })
        }
    };
    Ok(match op {
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Neq => ordering != Ordering::Equal,
    })
}
