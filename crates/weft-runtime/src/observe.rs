#![forbid(unsafe_code)]

//! Dependency tracker.
//!
//! The [`ObserveEngine`] maps observed targets (an object property, a cell,
//! a computed value) to the set of [`Dependent`]s that read them during their
//! latest run. It is pure bookkeeping: resolving a change to work (marking
//! elements dirty, re-running monitors) is the runtime's job.
//!
//! # Binding
//!
//! [`start_bind`](ObserveEngine::start_bind) makes a dependent the ambient
//! reader until the returned [`BindGuard`] drops. Binds nest; the guard
//! restores the previous reader. Starting a bind drops every entry the
//! dependent registered on its previous run, so a run records exactly what it
//! read and nothing older.
//!
//! # Invariants
//!
//! 1. `by_target` and `by_dependent` are mirror images of each other.
//! 2. `add_ref` with no bound dependent (or inside an unbind) records nothing.
//! 3. `fire_change` returns dependents in ascending [`Dependent`] order:
//!    computed values, then monitors, then elements.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use tracing::trace;
use weft_core::{ElementId, ObjectId, SubscriberId};

/// Property name under which cells and computed values register reads.
pub const VALUE_PROP: &str = "value";

/// Something that re-runs when what it read changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dependent {
    Computed(SubscriberId),
    Monitor(SubscriberId),
    Element(ElementId),
}

/// Something that can be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// A property of an observed object.
    Object(ObjectId),
    /// A cell or computed value, identified by its subscriber id.
    Source(SubscriberId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DepKey {
    target: Target,
    prop: Rc<str>,
}

/// Target → dependents registry with an ambient bind stack.
#[derive(Debug, Default)]
pub struct ObserveEngine {
    bound: RefCell<Vec<Option<Dependent>>>,
    by_target: RefCell<AHashMap<DepKey, BTreeSet<Dependent>>>,
    by_dependent: RefCell<AHashMap<Dependent, AHashSet<DepKey>>>,
}

impl ObserveEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `dependent` the ambient reader. `None` suspends recording.
    #[must_use = "dropping the guard ends the bind"]
    pub fn start_bind(&self, dependent: Option<Dependent>) -> BindGuard<'_> {
        if let Some(dep) = dependent {
            self.clear_dependent(dep);
        }
        self.bound.borrow_mut().push(dependent);
        BindGuard { engine: self }
    }

    /// The dependent currently recording reads, if any.
    #[must_use]
    pub fn current(&self) -> Option<Dependent> {
        self.bound.borrow().last().copied().flatten()
    }

    /// Record that the bound dependent read `prop` of `target`.
    pub fn add_ref(&self, target: Target, prop: &str) {
        let Some(dep) = self.current() else {
            return;
        };
        let key = DepKey {
            target,
            prop: Rc::from(prop),
        };
        trace!(?dep, ?target, prop, "add_ref");
        self.by_target
            .borrow_mut()
            .entry(key.clone())
            .or_default()
            .insert(dep);
        self.by_dependent
            .borrow_mut()
            .entry(dep)
            .or_default()
            .insert(key);
    }

    /// Dependents registered against `prop` of `target`.
    #[must_use]
    pub fn fire_change(&self, target: Target, prop: &str) -> Vec<Dependent> {
        let key = DepKey {
            target,
            prop: Rc::from(prop),
        };
        let deps: Vec<Dependent> = self
            .by_target
            .borrow()
            .get(&key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        if !deps.is_empty() {
            trace!(?target, prop, count = deps.len(), "fire_change");
        }
        deps
    }

    /// Drop every registration of `dependent`.
    pub fn clear_dependent(&self, dependent: Dependent) {
        let Some(keys) = self.by_dependent.borrow_mut().remove(&dependent) else {
            return;
        };
        let mut by_target = self.by_target.borrow_mut();
        for key in keys {
            if let Some(set) = by_target.get_mut(&key) {
                set.remove(&dependent);
                if set.is_empty() {
                    by_target.remove(&key);
                }
            }
        }
    }

    /// Drop every registration against `target` (the target is gone).
    pub fn forget_target(&self, target: Target) {
        let mut by_target = self.by_target.borrow_mut();
        let keys: Vec<DepKey> = by_target
            .keys()
            .filter(|k| k.target == target)
            .cloned()
            .collect();
        let mut by_dependent = self.by_dependent.borrow_mut();
        for key in keys {
            if let Some(deps) = by_target.remove(&key) {
                for dep in deps {
                    if let Some(set) = by_dependent.get_mut(&dep) {
                        set.remove(&key);
                        if set.is_empty() {
                            by_dependent.remove(&dep);
                        }
                    }
                }
            }
        }
    }

    /// Number of distinct (target, prop) pairs `dependent` is registered on.
    #[must_use]
    pub fn dependency_count(&self, dependent: Dependent) -> usize {
        self.by_dependent
            .borrow()
            .get(&dependent)
            .map_or(0, |set| set.len())
    }

    /// Whether `dependent` is registered against `prop` of `target`.
    #[must_use]
    pub fn depends_on(&self, dependent: Dependent, target: Target, prop: &str) -> bool {
        let key = DepKey {
            target,
            prop: Rc::from(prop),
        };
        self.by_target
            .borrow()
            .get(&key)
            .is_some_and(|set| set.contains(&dependent))
    }
}

/// RAII guard for an active bind. Dropping it restores the previous reader.
#[must_use = "dropping the guard ends the bind"]
pub struct BindGuard<'a> {
    engine: &'a ObserveEngine,
}

impl Drop for BindGuard<'_> {
    fn drop(&mut self) {
        self.engine.bound.borrow_mut().pop();
    }
}

impl std::fmt::Debug for BindGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindGuard")
            .field("current", &self.engine.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(raw: u64) -> Target {
        Target::Source(SubscriberId::new(raw))
    }

    fn elmt(raw: u64) -> Dependent {
        Dependent::Element(ElementId::new(raw))
    }

    #[test]
    fn add_ref_without_bind_records_nothing() {
        let engine = ObserveEngine::new();
        engine.add_ref(obj(1), "a");
        assert!(engine.fire_change(obj(1), "a").is_empty());
    }

    #[test]
    fn bound_reads_are_recorded() {
        let engine = ObserveEngine::new();
        {
            let _bind = engine.start_bind(Some(elmt(7)));
            engine.add_ref(obj(1), "a");
            engine.add_ref(obj(1), "b");
        }
        assert_eq!(engine.fire_change(obj(1), "a"), vec![elmt(7)]);
        assert_eq!(engine.fire_change(obj(1), "b"), vec![elmt(7)]);
        assert!(engine.fire_change(obj(1), "c").is_empty());
        assert_eq!(engine.current(), None);
    }

    #[test]
    fn rebind_drops_stale_dependencies() {
        let engine = ObserveEngine::new();
        {
            let _bind = engine.start_bind(Some(elmt(1)));
            engine.add_ref(obj(1), "old");
        }
        {
            let _bind = engine.start_bind(Some(elmt(1)));
            engine.add_ref(obj(1), "new");
        }
        assert!(engine.fire_change(obj(1), "old").is_empty());
        assert_eq!(engine.fire_change(obj(1), "new"), vec![elmt(1)]);
        assert_eq!(engine.dependency_count(elmt(1)), 1);
    }

    #[test]
    fn nested_binds_restore_outer_reader() {
        let engine = ObserveEngine::new();
        let outer = elmt(1);
        let inner = Dependent::Computed(SubscriberId::new(9));
        let _o = engine.start_bind(Some(outer));
        {
            let _i = engine.start_bind(Some(inner));
            engine.add_ref(obj(1), "x");
            {
                let _none = engine.start_bind(None);
                engine.add_ref(obj(1), "ignored");
            }
            assert_eq!(engine.current(), Some(inner));
        }
        engine.add_ref(obj(2), "y");
        assert_eq!(engine.current(), Some(outer));
        assert_eq!(engine.fire_change(obj(1), "x"), vec![inner]);
        assert!(engine.fire_change(obj(1), "ignored").is_empty());
        assert_eq!(engine.fire_change(obj(2), "y"), vec![outer]);
    }

    #[test]
    fn fire_change_orders_computed_monitor_element() {
        let engine = ObserveEngine::new();
        let deps = [
            elmt(1),
            Dependent::Monitor(SubscriberId::new(5)),
            Dependent::Computed(SubscriberId::new(6)),
        ];
        for dep in deps {
            let _bind = engine.start_bind(Some(dep));
            engine.add_ref(obj(1), "v");
        }
        let fired = engine.fire_change(obj(1), "v");
        assert!(matches!(fired[0], Dependent::Computed(_)));
        assert!(matches!(fired[1], Dependent::Monitor(_)));
        assert!(matches!(fired[2], Dependent::Element(_)));
    }

    #[test]
    fn clear_and_forget() {
        let engine = ObserveEngine::new();
        {
            let _bind = engine.start_bind(Some(elmt(1)));
            engine.add_ref(obj(1), "v");
            engine.add_ref(obj(2), "v");
        }
        engine.forget_target(obj(1));
        assert!(!engine.depends_on(elmt(1), obj(1), "v"));
        assert!(engine.depends_on(elmt(1), obj(2), "v"));

        engine.clear_dependent(elmt(1));
        assert_eq!(engine.dependency_count(elmt(1)), 0);
        assert!(engine.fire_change(obj(2), "v").is_empty());
    }
}
