// Structured query keys.
// A key is a scope tag followed by identifiers and filters, compared structurally.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Entity family a key belongs to. Every key starts with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Opportunities,
    Contacts,
    Companies,
    Emails,
    Meetings,
    Billing,
    Evaluations,
    /// Derived aggregates (pipeline totals, activity counts).
    Dashboard,
}

impl Scope {
    pub const ALL: [Scope; 8] = [
        Scope::Opportunities,
        Scope::Contacts,
        Scope::Companies,
        Scope::Emails,
        Scope::Meetings,
        Scope::Billing,
        Scope::Evaluations,
        Scope::Dashboard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Opportunities => "opportunities",
            Scope::Contacts => "contacts",
            Scope::Companies => "companies",
            Scope::Emails => "emails",
            Scope::Meetings => "meetings",
            Scope::Billing => "billing",
            Scope::Evaluations => "evaluations",
            Scope::Dashboard => "dashboard",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of a key after the scope.
///
/// Maps are ordered by key, so two filters with the same content compare equal
/// no matter how they were built. Numbers outside `i64` (floats, large unsigned)
/// keep their canonical JSON text in `Number`, so they never equal a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Number(String),
    Text(String),
    List(Vec<KeyPart>),
    Map(BTreeMap<String, KeyPart>),
}

impl KeyPart {
    pub fn to_value(&self) -> Value {
        match self {
            KeyPart::Null => Value::Null,
            KeyPart::Bool(b) => Value::Bool(*b),
            KeyPart::Int(n) => Value::from(*n),
            KeyPart::Number(text) => text
                .parse::<serde_json::Number>()
                .map_or_else(|_| Value::String(text.clone()), Value::Number),
            KeyPart::Text(s) => Value::String(s.clone()),
            KeyPart::List(items) => Value::Array(items.iter().map(KeyPart::to_value).collect()),
            KeyPart::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Text(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Text(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        KeyPart::Text(value.clone())
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        KeyPart::Int(value)
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        KeyPart::Int(i64::from(value))
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        KeyPart::Bool(value)
    }
}

impl From<Value> for KeyPart {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => KeyPart::Int(i),
                None => KeyPart::Number(n.to_string()),
            },
            Value::String(s) => KeyPart::Text(s),
            Value::Array(items) => KeyPart::List(items.into_iter().map(KeyPart::from).collect()),
            Value::Object(map) => {
                KeyPart::Map(map.into_iter().map(|(k, v)| (k, KeyPart::from(v))).collect())
            }
        }
    }
}

/// Identifier for a cached result: `[scope, part, part, ...]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    scope: Scope,
    parts: Vec<KeyPart>,
}

impl QueryKey {
    /// Key covering an entire entity family.
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            parts: Vec::new(),
        }
    }

    /// Append an identifier or tag.
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// Append a filter object built from any serializable value.
    pub fn with_filters<T: Serialize + ?Sized>(self, filters: &T) -> Result<Self> {
        let value = serde_json::to_value(filters)?;
        Ok(self.with(KeyPart::from(value)))
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// Whether `prefix` names this key or a scope containing it.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.scope == prefix.scope
            && prefix.parts.len() <= self.parts.len()
            && self.parts[..prefix.parts.len()] == prefix.parts[..]
    }

    pub fn to_value(&self) -> Value {
        let mut items = vec![Value::String(self.scope.as_str().to_string())];
        items.extend(self.parts.iter().map(KeyPart::to_value));
        Value::Array(items)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}
