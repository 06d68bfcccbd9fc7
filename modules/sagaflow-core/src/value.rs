//! Values that flow through effects: actions, JSON, task handles, and the
//! composite results of `all` and `race`.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::task::Task;

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// An event travelling through the host's dispatch path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<serde_json::Value>) -> Self {
        self.payload = payload.into();
        self
    }
}

impl From<&str> for Action {
    fn from(kind: &str) -> Self {
        Action::new(kind)
    }
}

impl From<String> for Action {
    fn from(kind: String) -> Self {
        Action::new(kind)
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Unit,
    Json(serde_json::Value),
    Action(Action),
    Task(Task),
    /// Positional results: `all`, positional `race`.
    List(Vec<Value>),
    /// Keyed results: keyed `race`.
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }

    /// The type tag used by [`Pattern`] matching.
    ///
    /// Actions match on their `type`; JSON objects on their `"type"` field;
    /// bare JSON strings on the string itself.
    pub fn kind(&self) -> Option<&str> {
        match self {
            Value::Action(action) => Some(action.kind.as_str()),
            Value::Json(serde_json::Value::String(s)) => Some(s.as_str()),
            Value::Json(serde_json::Value::Object(map)) => map.get("type")?.as_str(),
            _ => None,
        }
    }

    pub fn as_action(&self) -> Option<&Action> {
        match self {
            Value::Action(action) => Some(action),
            _ => None,
        }
    }

    pub fn into_action(self) -> Option<Action> {
        match self {
            Value::Action(action) => Some(action),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&Task> {
        match self {
            Value::Task(task) => Some(task),
            _ => None,
        }
    }

    pub fn into_task(self) -> Option<Task> {
        match self {
            Value::Task(task) => Some(task),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(json) => Some(json),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key of a keyed race result.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.get(key)
    }

    /// Render as JSON for logs and monitors. Task handles become `{"task": id}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Unit => serde_json::Value::Null,
            Value::Json(json) => json.clone(),
            Value::Action(action) => serde_json::to_value(action).unwrap_or_default(),
            Value::Task(task) => json!({ "task": task.id().get() }),
            Value::List(items) => items.iter().map(Value::to_json).collect(),
            Value::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect::<serde_json::Map<_, _>>()
                .into(),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<Action> for Value {
    fn from(action: Action) -> Self {
        Value::Action(action)
    }
}

impl From<Task> for Value {
    fn from(task: Task) -> Self {
        Value::Task(task)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::Json(json)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Json(serde_json::Value::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Json(serde_json::Value::String(s))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Json(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Json(n.into())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Json(b.into())
    }
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// Matcher used by takers on the bus and on channels.
#[derive(Clone)]
pub enum Pattern {
    /// `"*"`: matches everything.
    Any,
    Type(String),
    OneOf(Vec<String>),
    Predicate(Rc<dyn Fn(&Value) -> bool>),
}

impl Pattern {
    pub fn predicate(f: impl Fn(&Value) -> bool + 'static) -> Self {
        Pattern::Predicate(Rc::new(f))
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Type(kind) => value.kind() == Some(kind.as_str()),
            Pattern::OneOf(kinds) => value
                .kind()
                .is_some_and(|k| kinds.iter().any(|kind| kind == k)),
            Pattern::Predicate(f) => f(value),
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Type(kind) => write!(f, "{kind:?}"),
            Pattern::OneOf(kinds) => write!(f, "{kinds:?}"),
            Pattern::Predicate(_) => f.write_str("<predicate>"),
        }
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        if s == "*" {
            Pattern::Any
        } else {
            Pattern::Type(s.to_string())
        }
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        Pattern::from(s.as_str())
    }
}

impl<const N: usize> From<[&str; N]> for Pattern {
    fn from(kinds: [&str; N]) -> Self {
        Pattern::OneOf(kinds.iter().map(|k| k.to_string()).collect())
    }
}

impl From<Vec<String>> for Pattern {
    fn from(kinds: Vec<String>) -> Self {
        Pattern::OneOf(kinds)
    }
}
