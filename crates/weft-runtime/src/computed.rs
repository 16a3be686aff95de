#![forbid(unsafe_code)]

//! Derived values.
//!
//! A [`Computed`] evaluates its closure under a bind, so every cell, observed
//! object property, or other computed value it reads becomes a dependency.
//! When one of them changes the runtime re-evaluates it during the next flush
//! (computed values run before monitors and element updates). If the result
//! is not the [`same`](Value::same) as the previous one, the computed value
//! fires its own change so readers downstream re-run.
//!
//! # Invariants
//!
//! 1. `get()` never returns a value older than the last completed flush.
//! 2. Re-evaluation that yields the same value notifies nobody.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::trace;
use weft_core::{Result, SubscriberId, Value};

use crate::observe::{Dependent, Target, VALUE_PROP};
use crate::runtime::{Reaction, Runtime};

type Compute = dyn Fn() -> Result<Value>;

struct ComputedInner {
    rt: Runtime,
    id: SubscriberId,
    compute: Box<Compute>,
    value: RefCell<Value>,
    version: Cell<u64>,
}

impl ComputedInner {
    fn evaluate(&self) -> Result<Value> {
        let _bind = self.rt.engine().start_bind(Some(Dependent::Computed(self.id)));
        (self.compute)()
    }
}

impl Reaction for ComputedInner {
    fn react(&self) -> Result<()> {
        let next = self.evaluate()?;
        if next.same(&self.value.borrow()) {
            return Ok(());
        }
        trace!(computed = %self.id, value = ?next, "computed value changed");
        *self.value.borrow_mut() = next;
        self.version.set(self.version.get() + 1);
        self.rt.fire_change(Target::Source(self.id), VALUE_PROP);
        Ok(())
    }
}

impl Drop for ComputedInner {
    fn drop(&mut self) {
        self.rt.unregister_reaction(Dependent::Computed(self.id));
        self.rt.engine().forget_target(Target::Source(self.id));
    }
}

/// A value derived from other reactive state.
#[derive(Clone)]
pub struct Computed {
    inner: Rc<ComputedInner>,
}

impl Computed {
    /// Create and evaluate a derived value.
    ///
    /// # Errors
    ///
    /// Whatever the first evaluation returns.
    pub fn new(rt: &Runtime, compute: impl Fn() -> Result<Value> + 'static) -> Result<Self> {
        let inner = Rc::new(ComputedInner {
            rt: rt.clone(),
            id: rt.allocate_subscriber_id(),
            compute: Box::new(compute),
            value: RefCell::new(Value::Undefined),
            version: Cell::new(0),
        });
        let initial = inner.evaluate()?;
        *inner.value.borrow_mut() = initial;
        let reaction: Rc<dyn Reaction> = inner.clone();
        let weak: Weak<dyn Reaction> = Rc::downgrade(&reaction);
        rt.register_reaction(inner.id, weak);
        Ok(Self { inner })
    }

    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    /// Current value; registers a read with whatever is bound.
    #[must_use]
    pub fn get(&self) -> Value {
        self.inner
            .rt
            .engine()
            .add_ref(Target::Source(self.inner.id), VALUE_PROP);
        self.inner.value.borrow().clone()
    }

    /// Number of times the value changed after creation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }
}

impl std::fmt::Debug for Computed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.borrow())
            .field("version", &self.inner.version.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::ObservedProperty;
    use weft_core::ObjectRef;

    #[test]
    fn recomputes_from_cells() {
        let rt = Runtime::default();
        let a = ObservedProperty::new(&rt, 2, None, "a");
        let b = ObservedProperty::new(&rt, 3, None, "b");
        let (ca, cb) = (a.clone(), b.clone());
        let sum = Computed::new(&rt, move || {
            let x = ca.get().as_number().unwrap_or(0.0);
            let y = cb.get().as_number().unwrap_or(0.0);
            Ok(Value::from(x + y))
        })
        .unwrap();
        assert_eq!(sum.get(), Value::from(5));

        a.set(10).unwrap();
        assert_eq!(sum.get(), Value::from(13));
        assert_eq!(sum.version(), 1);
    }

    #[test]
    fn chained_computed_cascades() {
        let rt = Runtime::default();
        let obj = ObjectRef::plain().with("n", 1).observed();
        let rt1 = rt.clone();
        let o = obj.clone();
        let double = Computed::new(&rt, move || {
            Ok(Value::from(rt1.read_prop(&o, "n").as_number().unwrap_or(0.0) * 2.0))
        })
        .unwrap();
        let d = double.clone();
        let plus_one = Computed::new(&rt, move || {
            Ok(Value::from(d.get().as_number().unwrap_or(0.0) + 1.0))
        })
        .unwrap();
        assert_eq!(plus_one.get(), Value::from(3));

        rt.write_prop(&obj, "n", 4).unwrap();
        assert_eq!(double.get(), Value::from(8));
        assert_eq!(plus_one.get(), Value::from(9));
    }

    #[test]
    fn same_result_does_not_bump_version() {
        let rt = Runtime::default();
        let cell = ObservedProperty::new(&rt, 1, None, "n");
        let c = cell.clone();
        let sign = Computed::new(&rt, move || {
            Ok(Value::from(c.get().as_number().unwrap_or(0.0) > 0.0))
        })
        .unwrap();
        cell.set(5).unwrap();
        assert_eq!(sign.version(), 0);
        cell.set(-1).unwrap();
        assert_eq!(sign.version(), 1);
    }
}
