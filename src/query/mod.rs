//! Key filters: typed predicates over entity fields, attributes,
//! latest time-series values and alarm fields.

mod predicate;

pub use predicate::{
    matches_all, BooleanOperation, ComplexOperation, KeyFilter, KeyFilterPredicate, NumericOperation,
    StringOperation,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the value of a key comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKeyType {
    EntityField,
    /// Attribute of any scope.
    Attribute,
    ClientAttribute,
    SharedAttribute,
    ServerAttribute,
    TimeSeries,
    AlarmField,
}

/// Key to resolve before a predicate runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    #[serde(rename = "type")]
    pub key_type: EntityKeyType,
    pub key: String,
}

impl EntityKey {
    pub fn new(key_type: EntityKeyType, key: impl Into<String>) -> Self {
        Self {
            key_type,
            key: key.into(),
        }
    }

    pub fn attribute(key: impl Into<String>) -> Self {
        Self::new(EntityKeyType::Attribute, key)
    }

    pub fn time_series(key: impl Into<String>) -> Self {
        Self::new(EntityKeyType::TimeSeries, key)
    }

    pub fn alarm_field(key: impl Into<String>) -> Self {
        Self::new(EntityKeyType::AlarmField, key)
    }
}

/// Resolved value of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KvValue {
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
    Json(serde_json::Value),
}

impl KvValue {
    /// Text form used by string predicates.
    pub fn as_text(&self) -> String {
        match self {
            KvValue::String(s) => s.clone(),
            KvValue::Long(v) => v.to_string(),
            KvValue::Double(v) => v.to_string(),
            KvValue::Boolean(v) => v.to_string(),
            KvValue::Json(v) => v.to_string(),
        }
    }

    /// Numeric form used by numeric predicates, if there is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            KvValue::Long(v) => Some(*v as f64),
            KvValue::Double(v) => Some(*v),
            KvValue::String(s) => s.trim().parse().ok(),
            KvValue::Json(v) => v.as_f64(),
            KvValue::Boolean(_) => None,
        }
    }

    /// Boolean form used by boolean predicates, if there is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            KvValue::Boolean(v) => Some(*v),
            KvValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            KvValue::Json(v) => v.as_bool(),
            _ => None,
        }
    }
}

impl fmt::Display for KvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<&str> for KvValue {
    fn from(v: &str) -> Self {
        KvValue::String(v.to_string())
    }
}

impl From<String> for KvValue {
    fn from(v: String) -> Self {
        KvValue::String(v)
    }
}

impl From<i64> for KvValue {
    fn from(v: i64) -> Self {
        KvValue::Long(v)
    }
}

impl From<f64> for KvValue {
    fn from(v: f64) -> Self {
        KvValue::Double(v)
    }
}

impl From<bool> for KvValue {
    fn from(v: bool) -> Self {
        KvValue::Boolean(v)
    }
}
