use serde::{Deserialize, Serialize};

use super::{EntityKey, KvValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StringOperation {
    Equal,
    NotEqual,
    StartsWith,
    EndsWith,
    Contains,
    NotContains,
    In,
    NotIn,
}

impl StringOperation {
    /// Operations that hold when the key is absent.
    fn is_negated(self) -> bool {
        matches!(self, StringOperation::NotEqual | StringOperation::NotContains | StringOperation::NotIn)
    }

    /// An empty `expected` matches everything, present or not.
    pub fn apply(self, actual: Option<&str>, expected: &str, ignore_case: bool) -> bool {
        if expected.is_empty() {
            return true;
        }
        let Some(actual) = actual else {
            return self.is_negated();
        };

        let (actual, expected) = if ignore_case {
            (actual.to_lowercase(), expected.to_lowercase())
        } else {
            (actual.to_string(), expected.to_string())
        };
        let in_list = || expected.split(',').map(str::trim).any(|item| item == actual);

        match self {
            StringOperation::Equal => actual == expected,
            StringOperation::NotEqual => actual != expected,
            StringOperation::StartsWith => actual.starts_with(&expected),
            StringOperation::EndsWith => actual.ends_with(&expected),
            StringOperation::Contains => actual.contains(&expected),
            StringOperation::NotContains => !actual.contains(&expected),
            StringOperation::In => in_list(),
            StringOperation::NotIn => !in_list(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NumericOperation {
    Equal,
    NotEqual,
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
}

impl NumericOperation {
    pub fn apply(self, actual: Option<f64>, expected: f64) -> bool {
        let Some(actual) = actual else {
            return self == NumericOperation::NotEqual;
        };
        match self {
            NumericOperation::Equal => actual == expected,
            NumericOperation::NotEqual => actual != expected,
            NumericOperation::Greater => actual > expected,
            NumericOperation::Less => actual < expected,
            NumericOperation::GreaterOrEqual => actual >= expected,
            NumericOperation::LessOrEqual => actual <= expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BooleanOperation {
    Equal,
    NotEqual,
}

impl BooleanOperation {
    pub fn apply(self, actual: Option<bool>, expected: bool) -> bool {
        match (self, actual) {
            (BooleanOperation::Equal, Some(actual)) => actual == expected,
            (BooleanOperation::NotEqual, Some(actual)) => actual != expected,
            (BooleanOperation::Equal, None) => false,
            (BooleanOperation::NotEqual, None) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplexOperation {
    And,
    Or,
}

/// Predicate applied to a resolved key value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyFilterPredicate {
    String {
        operation: StringOperation,
        value: String,
        #[serde(default, rename = "ignoreCase")]
        ignore_case: bool,
    },
    Numeric {
        operation: NumericOperation,
        value: f64,
    },
    Boolean {
        operation: BooleanOperation,
        value: bool,
    },
    /// Nested predicates over the same value. An empty AND holds, an empty OR does not.
    Complex {
        operation: ComplexOperation,
        predicates: Vec<KeyFilterPredicate>,
    },
}

impl KeyFilterPredicate {
    pub fn string(operation: StringOperation, value: impl Into<String>) -> Self {
        KeyFilterPredicate::String {
            operation,
            value: value.into(),
            ignore_case: false,
        }
    }

    pub fn string_ignore_case(operation: StringOperation, value: impl Into<String>) -> Self {
        KeyFilterPredicate::String {
            operation,
            value: value.into(),
            ignore_case: true,
        }
    }

    pub fn numeric(operation: NumericOperation, value: f64) -> Self {
        KeyFilterPredicate::Numeric { operation, value }
    }

    /// Evaluate against a value; `None` means the key is absent.
    pub fn evaluate(&self, value: Option<&KvValue>) -> bool {
        match self {
            KeyFilterPredicate::String {
                operation,
                value: expected,
                ignore_case,
            } => {
                let text = value.map(KvValue::as_text);
                operation.apply(text.as_deref(), expected, *ignore_case)
            }
            KeyFilterPredicate::Numeric {
                operation,
                value: expected,
            } => operation.apply(value.and_then(KvValue::as_number), *expected),
            KeyFilterPredicate::Boolean {
                operation,
                value: expected,
            } => operation.apply(value.and_then(KvValue::as_bool), *expected),
            KeyFilterPredicate::Complex {
                operation,
                predicates,
            } => match operation {
                ComplexOperation::And => predicates.iter().all(|p| p.evaluate(value)),
                ComplexOperation::Or => predicates.iter().any(|p| p.evaluate(value)),
            },
        }
    }
}

/// A key plus the predicate its value must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFilter {
    pub key: EntityKey,
    pub predicate: KeyFilterPredicate,
}

impl KeyFilter {
    pub fn new(key: EntityKey, predicate: KeyFilterPredicate) -> Self {
        Self { key, predicate }
    }
}

/// True when every filter passes for the values `resolve` produces.
pub fn matches_all<F>(filters: &[KeyFilter], mut resolve: F) -> bool
where
    F: FnMut(&EntityKey) -> Option<KvValue>,
{
    filters.iter().all(|filter| {
        let value = resolve(&filter.key);
        filter.predicate.evaluate(value.as_ref())
    })
}
