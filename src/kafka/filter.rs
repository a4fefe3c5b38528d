//! Filter and break conditions for event search
//!
//! A [`Condition`] pairs an [`Expression`] with an expected value. The
//! expression is evaluated against a message's structured value and the
//! condition holds only when it produces a defined value equal to the
//! expected one. Evaluation errors, undefined results and raw (non-JSON)
//! payloads all count as "no match"; they are never reported as errors.
//!
//! [`FieldPath`] is the built-in expression: a dotted path (`order.items.0.sku`)
//! or a JSON pointer (`/order/items/0/sku`). Any closure
//! `Fn(&Value) -> Result<Option<Value>, HandlerError>` is also an expression,
//! so callers can plug in a richer query language.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use super::error::HandlerError;
use super::messages::MessageValue;

/// Predicate evaluator over a structured document
pub trait Expression: Send + Sync {
    /// Evaluate against a document; `Ok(None)` means undefined
    fn evaluate(&self, document: &Value) -> Result<Option<Value>, HandlerError>;
}

impl<F> Expression for F
where
    F: Fn(&Value) -> Result<Option<Value>, HandlerError> + Send + Sync,
{
    fn evaluate(&self, document: &Value) -> Result<Option<Value>, HandlerError> {
        self(document)
    }
}

/// Path into a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dotted path or, if it starts with `/`, a JSON pointer
    pub fn parse(path: &str) -> Self {
        let segments = if let Some(pointer) = path.strip_prefix('/') {
            pointer
                .split('/')
                .map(|s| s.replace("~1", "/").replace("~0", "~"))
                .collect()
        } else if path.is_empty() {
            Vec::new()
        } else {
            path.split('.').map(str::to_string).collect()
        };
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    fn resolve<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(document, |node, segment| match node {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }
}

impl Expression for FieldPath {
    fn evaluate(&self, document: &Value) -> Result<Option<Value>, HandlerError> {
        Ok(self.resolve(document).cloned())
    }
}

/// An expression and the value it must produce
#[derive(Clone)]
pub struct Condition {
    expression: Arc<dyn Expression>,
    expected: Value,
    label: String,
}

impl Condition {
    /// Condition over an arbitrary expression
    pub fn new(expression: impl Expression + 'static, expected: Value) -> Self {
        Self {
            expression: Arc::new(expression),
            expected,
            label: "<expression>".to_string(),
        }
    }

    /// Condition comparing the value at `path` against `expected`
    pub fn path(path: &str, expected: Value) -> Self {
        Self {
            expression: Arc::new(FieldPath::parse(path)),
            expected,
            label: path.to_string(),
        }
    }

    pub fn expected(&self) -> &Value {
        &self.expected
    }

    /// Whether the condition holds for a message value
    pub fn matches(&self, value: &MessageValue) -> bool {
        let Some(document) = value.as_structured() else {
            return false;
        };
        match self.expression.evaluate(document) {
            Ok(Some(actual)) => actual == self.expected,
            Ok(None) => false,
            Err(e) => {
                trace!(condition = %self.label, "expression failed, treating as no match: {}", e);
                false
            }
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("expression", &self.label)
            .field("expected", &self.expected)
            .finish()
    }
}

/// Whether every condition holds; vacuously true for an empty set
pub fn all_match(conditions: &[Condition], value: &MessageValue) -> bool {
    conditions.iter().all(|c| c.matches(value))
}
