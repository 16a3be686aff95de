#![forbid(unsafe_code)]

//! Path monitors.
//!
//! A [`Monitor`] watches one or more dotted property paths (`"a.b.c"`)
//! rooted at an object. The initial run walks each path under a bind,
//! recording a dependency on every property it traverses, and remembers the
//! terminal values. When any of those properties changes the monitor walks
//! again, re-registering dependencies (intermediate objects may have been
//! replaced), and calls its callback once per path whose terminal value is no
//! longer the [`same`](Value::same) as before.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Segment missing | union-typed value lacks the property | path evaluates to `undefined`; debug log on the initial walk only |
//! | Callback error | user callback returns `Err` | propagates out of the flush |

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};
use weft_core::{ObjectRef, Result, SubscriberId, Value};

use crate::observe::Dependent;
use crate::runtime::{Reaction, Runtime};

/// One detected change, passed to the monitor callback.
#[derive(Debug, Clone)]
pub struct MonitorChange {
    pub path: Rc<str>,
    pub new_value: Value,
    pub old_value: Value,
}

type MonitorCallback = dyn Fn(&MonitorChange) -> Result<()>;

struct WatchedPath {
    path: Rc<str>,
    segments: Vec<Rc<str>>,
    value: Value,
}

struct MonitorInner {
    rt: Runtime,
    id: SubscriberId,
    target: ObjectRef,
    paths: RefCell<Vec<WatchedPath>>,
    callback: Box<MonitorCallback>,
}

impl MonitorInner {
    fn dependent(&self) -> Dependent {
        Dependent::Monitor(self.id)
    }

    /// Walk one path from the target. Missing segments give `undefined`.
    fn walk(&self, path: &WatchedPath, initial: bool) -> Value {
        let mut current = Value::Object(self.target.clone());
        for segment in &path.segments {
            let Value::Object(obj) = &current else {
                self.log_missing(path, segment, initial);
                return Value::Undefined;
            };
            // Read even when absent so the monitor wakes up once the property appears.
            let present = obj.has(segment);
            let next = self.rt.read_prop(obj, segment);
            if !present {
                self.log_missing(path, segment, initial);
                return Value::Undefined;
            }
            current = next;
        }
        current
    }

    fn log_missing(&self, path: &WatchedPath, segment: &str, initial: bool) {
        if initial {
            debug!(
                monitor = %self.id,
                path = %path.path,
                segment,
                "monitored path does not resolve, treating as undefined"
            );
        }
    }

    /// Re-walk every path under a fresh bind and return the changed ones.
    fn rewalk(&self, initial: bool) -> Vec<MonitorChange> {
        let mut changes = Vec::new();
        let _bind = self.rt.engine().start_bind(Some(self.dependent()));
        let mut paths = self.paths.borrow_mut();
        for path in paths.iter_mut() {
            let value = self.walk(path, initial);
            if initial {
                path.value = value;
                continue;
            }
            if !value.same(&path.value) {
                let old_value = std::mem::replace(&mut path.value, value.clone());
                changes.push(MonitorChange {
                    path: Rc::clone(&path.path),
                    new_value: value,
                    old_value,
                });
            }
        }
        changes
    }
}

impl Reaction for MonitorInner {
    fn react(&self) -> Result<()> {
        let changes = self.rewalk(false);
        trace!(monitor = %self.id, changed = changes.len(), "monitor re-walked");
        let _unbind = self.rt.engine().start_bind(None);
        for change in &changes {
            (self.callback)(change)?;
        }
        Ok(())
    }
}

impl Drop for MonitorInner {
    fn drop(&mut self) {
        self.rt.unregister_reaction(self.dependent());
    }
}

/// Watches dotted paths under an object and reports terminal value changes.
pub struct Monitor {
    inner: Rc<MonitorInner>,
}

impl Monitor {
    /// Create a monitor and run its initial walk.
    pub fn new<I, S>(
        rt: &Runtime,
        target: &ObjectRef,
        paths: I,
        callback: impl Fn(&MonitorChange) -> Result<()> + 'static,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = paths
            .into_iter()
            .map(|p| {
                let path: Rc<str> = Rc::from(p.as_ref());
                let segments = path
                    .split('.')
                    .filter(|s| !s.is_empty())
                    .map(Rc::from)
                    .collect();
                WatchedPath {
                    path,
                    segments,
                    value: Value::Undefined,
                }
            })
            .collect();
        let inner = Rc::new(MonitorInner {
            rt: rt.clone(),
            id: rt.allocate_subscriber_id(),
            target: target.clone(),
            paths: RefCell::new(paths),
            callback: Box::new(callback),
        });
        let reaction: Rc<dyn Reaction> = inner.clone();
        let weak: Weak<dyn Reaction> = Rc::downgrade(&reaction);
        rt.register_reaction(inner.id, weak);
        inner.rewalk(true);
        debug!(monitor = %inner.id, target = %target.id(), "monitor started");
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    /// Last observed terminal value of `path`.
    #[must_use]
    pub fn value(&self, path: &str) -> Option<Value> {
        self.inner
            .paths
            .borrow()
            .iter()
            .find(|p| &*p.path == path)
            .map(|p| p.value.clone())
    }

    /// Stop watching. Dropping the monitor does the same.
    pub fn dispose(self) {}
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let paths: Vec<Rc<str>> = self.inner.paths.borrow().iter().map(|p| Rc::clone(&p.path)).collect();
        f.debug_struct("Monitor")
            .field("id", &self.inner.id)
            .field("paths", &paths)
            .finish()
    }
}
