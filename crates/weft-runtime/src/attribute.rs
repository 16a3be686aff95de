#![forbid(unsafe_code)]

//! Attribute collaborator.
//!
//! The native rendering engine is reached through an [`AttributeSink`]: per
//! attribute, a `set` call with the new value or a `reset` call returning it
//! to the engine default. An [`AttributeModifier`] sits between update
//! closures and the sink. Closures stage what they want; [`apply`] issues at
//! most one call per attribute and only when the value differs from the one
//! last applied.
//!
//! Attributes the sink does not support are skipped.
//!
//! [`apply`]: AttributeModifier::apply

use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;
use indexmap::IndexMap;
use tracing::trace;
use weft_core::{Value, deep_copy};

/// Opaque handle to a native node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub u64);

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// The native attribute module.
pub trait AttributeSink {
    /// Whether the engine implements `attribute`.
    fn supports(&self, attribute: &str) -> bool {
        let _ = attribute;
        true
    }

    fn set_attribute(&mut self, node: NodeHandle, attribute: &str, value: &Value);

    fn reset_attribute(&mut self, node: NodeHandle, attribute: &str);
}

#[derive(Debug, Clone)]
enum Staged {
    Set(Value),
    Reset,
}

/// Diffing front end for one node's attributes.
#[derive(Debug)]
pub struct AttributeModifier {
    node: NodeHandle,
    staged: IndexMap<Rc<str>, Staged>,
    applied: AHashMap<Rc<str>, Value>,
}

impl AttributeModifier {
    #[must_use]
    pub fn new(node: NodeHandle) -> Self {
        Self {
            node,
            staged: IndexMap::new(),
            applied: AHashMap::new(),
        }
    }

    #[must_use]
    pub fn node(&self) -> NodeHandle {
        self.node
    }

    /// Stage a value. The last staging of an attribute in a pass wins.
    pub fn set(&mut self, attribute: &str, value: impl Into<Value>) -> &mut Self {
        self.staged.insert(Rc::from(attribute), Staged::Set(value.into()));
        self
    }

    /// Stage a reset to the engine default.
    pub fn reset(&mut self, attribute: &str) -> &mut Self {
        self.staged.insert(Rc::from(attribute), Staged::Reset);
        self
    }

    /// Value last handed to the sink for `attribute`.
    #[must_use]
    pub fn applied(&self, attribute: &str) -> Option<&Value> {
        self.applied.get(attribute)
    }

    /// Issue the staged changes. Returns the number of sink calls made.
    pub fn apply(&mut self, sink: &mut dyn AttributeSink) -> usize {
        let mut calls = 0;
        for (attribute, staged) in self.staged.drain(..) {
            if !sink.supports(&attribute) {
                trace!(node = %self.node, attribute = %attribute, "attribute not supported, skipped");
                continue;
            }
            match staged {
                Staged::Set(value) => {
                    let unchanged = self
                        .applied
                        .get(&attribute)
                        .is_some_and(|old| old.deep_eq(&value));
                    if unchanged {
                        continue;
                    }
                    sink.set_attribute(self.node, &attribute, &value);
                    // Snapshot so in-place mutation of the caller's object is still seen as a change.
                    self.applied.insert(attribute, deep_copy(&value));
                    calls += 1;
                }
                Staged::Reset => {
                    if self.applied.remove(&attribute).is_some() {
                        sink.reset_attribute(self.node, &attribute);
                        calls += 1;
                    }
                }
            }
        }
        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::ObjectRef;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl AttributeSink for Recorder {
        fn supports(&self, attribute: &str) -> bool {
            attribute != "blur"
        }

        fn set_attribute(&mut self, node: NodeHandle, attribute: &str, value: &Value) {
            self.calls.push(format!("set {node} {attribute}={value:?}"));
        }

        fn reset_attribute(&mut self, node: NodeHandle, attribute: &str) {
            self.calls.push(format!("reset {node} {attribute}"));
        }
    }

    #[test]
    fn only_changed_attributes_reach_the_sink() {
        let mut sink = Recorder::default();
        let mut modifier = AttributeModifier::new(NodeHandle(1));
        modifier.set("width", 10).set("color", "red");
        assert_eq!(modifier.apply(&mut sink), 2);

        modifier.set("width", 10).set("color", "blue");
        assert_eq!(modifier.apply(&mut sink), 1);
        assert_eq!(sink.calls.last().map(String::as_str), Some("set node:1 color=\"blue\""));
    }

    #[test]
    fn one_call_per_attribute_per_pass() {
        let mut sink = Recorder::default();
        let mut modifier = AttributeModifier::new(NodeHandle(2));
        modifier.set("width", 1).reset("width").set("width", 3);
        assert_eq!(modifier.apply(&mut sink), 1);
        assert_eq!(modifier.applied("width"), Some(&Value::from(3)));
    }

    #[test]
    fn reset_only_after_a_set() {
        let mut sink = Recorder::default();
        let mut modifier = AttributeModifier::new(NodeHandle(3));
        modifier.reset("opacity");
        assert_eq!(modifier.apply(&mut sink), 0);
        modifier.set("opacity", 0.5);
        modifier.apply(&mut sink);
        modifier.reset("opacity");
        assert_eq!(modifier.apply(&mut sink), 1);
        assert_eq!(sink.calls.last().map(String::as_str), Some("reset node:3 opacity"));
    }

    #[test]
    fn objects_compare_structurally() {
        let mut sink = Recorder::default();
        let mut modifier = AttributeModifier::new(NodeHandle(4));
        let border = ObjectRef::plain().with("width", 1);
        modifier.set("border", border.clone());
        modifier.apply(&mut sink);

        modifier.set("border", ObjectRef::plain().with("width", 1));
        assert_eq!(modifier.apply(&mut sink), 0);

        border.insert("width", Value::from(2));
        modifier.set("border", border);
        assert_eq!(modifier.apply(&mut sink), 1);
    }

    #[test]
    fn unsupported_attributes_are_skipped() {
        let mut sink = Recorder::default();
        let mut modifier = AttributeModifier::new(NodeHandle(5));
        modifier.set("blur", 3);
        assert_eq!(modifier.apply(&mut sink), 0);
        assert!(sink.calls.is_empty());
    }
}
