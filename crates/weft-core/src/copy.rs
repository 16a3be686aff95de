#![forbid(unsafe_code)]

//! Copy strategies used when a child's one-way prop takes a new value from
//! its parent.
//!
//! # Invariants
//!
//! 1. Primitives are returned as-is under both strategies.
//! 2. A copied object never shares identity with its source.
//! 3. Copies keep the source's kind, class tag, and observed flag.
//! 4. [`deep_copy`] maps every source object to exactly one copy, so shared
//!    references and cycles in the source are shared references and cycles
//!    in the copy.

use core::fmt;
use core::str::FromStr;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::ReactiveError;
use crate::id::ObjectId;
use crate::value::{ObjectKind, ObjectRef, Value};

/// How a one-way prop copies values arriving from its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    /// Clone the top-level object; nested values stay shared.
    Shallow,
    /// Clone the whole reachable graph.
    #[default]
    Deep,
}

impl CopyMode {
    /// Copy `value` with this strategy.
    #[must_use]
    pub fn copy(self, value: &Value) -> Value {
        match self {
            Self::Shallow => shallow_copy(value),
            Self::Deep => deep_copy(value),
        }
    }
}

impl fmt::Display for CopyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Shallow => "shallow",
            Self::Deep => "deep",
        })
    }
}

impl FromStr for CopyMode {
    type Err = ReactiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shallow" => Ok(Self::Shallow),
            "deep" => Ok(Self::Deep),
            other => Err(ReactiveError::Config(format!(
                "unknown copy mode '{other}' (expected 'shallow' or 'deep')"
            ))),
        }
    }
}

/// Clone the top-level object. Children keep their identity.
#[must_use]
pub fn shallow_copy(value: &Value) -> Value {
    match value {
        Value::Object(obj) => Value::Object(ObjectRef::from_data(obj.borrow().clone())),
        other => other.clone(),
    }
}

/// Clone the reachable object graph, preserving sharing and cycles.
#[must_use]
pub fn deep_copy(value: &Value) -> Value {
    let mut copies = AHashMap::new();
    deep_copy_inner(value, &mut copies)
}

fn deep_copy_inner(value: &Value, copies: &mut AHashMap<ObjectId, ObjectRef>) -> Value {
    let Value::Object(src) = value else {
        return value.clone();
    };
    if let Some(done) = copies.get(&src.id()) {
        return Value::Object(done.clone());
    }

    // Register the empty copy before recursing so back-edges find it.
    let (shell, kind, props) = {
        let data = src.borrow();
        (data.empty_like(), data.kind.clone(), data.props.clone())
    };
    let copy = ObjectRef::from_data(shell);
    copies.insert(src.id(), copy.clone());

    let kind = match kind {
        ObjectKind::Plain => ObjectKind::Plain,
        ObjectKind::Date(ms) => ObjectKind::Date(ms),
        ObjectKind::Array(items) => {
            ObjectKind::Array(items.iter().map(|v| deep_copy_inner(v, copies)).collect())
        }
        ObjectKind::Set(items) => {
            ObjectKind::Set(items.iter().map(|v| deep_copy_inner(v, copies)).collect())
        }
        ObjectKind::Map(entries) => ObjectKind::Map(
            entries
                .iter()
                .map(|(k, v)| (deep_copy_inner(k, copies), deep_copy_inner(v, copies)))
                .collect(),
        ),
    };
    let props = props
        .iter()
        .map(|(k, v)| (k.clone(), deep_copy_inner(v, copies)))
        .collect();

    {
        let mut data = copy.borrow_mut();
        data.kind = kind;
        data.props = props;
    }
    Value::Object(copy)
}
