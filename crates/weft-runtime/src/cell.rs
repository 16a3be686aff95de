#![forbid(unsafe_code)]

//! Observable property cells.
//!
//! An [`ObservedProperty`] boxes one [`Value`] together with the bookkeeping
//! that makes partial updates possible:
//!
//! - the element ids that read it during their latest update pass,
//! - the peer subscribers (one-way props) that copy from it,
//! - closure subscribers registered through [`subscribe`](ObservedProperty::subscribe).
//!
//! # Invariants
//!
//! 1. `set` with a value that is [`same`](Value::same) as the current one is a
//!    no-op: no version bump, no notifications.
//! 2. The version increments exactly once per effective change.
//! 3. The dependent element set only holds ids that read the cell during
//!    their most recent pass. Each run of an element's closure starts from
//!    an empty read set; purging an element removes it.
//! 4. A deleted cell never notifies again.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Owning view gone | cell outlived its view | [`ReactiveError::ViewDisposed`] |
//! | Legacy notification | `notify_has_changed` called | [`ReactiveError::LegacyNotification`] |
//! | Write after delete | `set` on a deleted cell | [`ReactiveError::InconsistentSubscriber`] |
//! | Stale subscriber id | subscriber dropped without unsubscribing | id pruned, logged at debug |

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use tracing::{debug, error};
use weft_core::{ElementId, ReactiveError, Result, SubscriberId, Value, ViewId};

use crate::observe::{Dependent, Target, VALUE_PROP};
use crate::runtime::Runtime;

type Callback = dyn Fn(&Value);

pub(crate) struct CellInner {
    rt: Runtime,
    id: SubscriberId,
    name: Rc<str>,
    value: RefCell<Value>,
    owning_view: Option<ViewId>,
    subscribers: RefCell<BTreeSet<SubscriberId>>,
    dependent_elmt_ids: RefCell<BTreeSet<ElementId>>,
    callbacks: RefCell<Vec<Weak<Callback>>>,
    version: Cell<u64>,
    deleted: Cell<bool>,
}

/// Shared handle to an observable cell.
#[derive(Clone)]
pub struct ObservedProperty {
    inner: Rc<CellInner>,
}

impl ObservedProperty {
    /// Create a cell. `owning_view` is the view whose elements are marked
    /// dirty when the value changes.
    pub fn new(rt: &Runtime, value: impl Into<Value>, owning_view: Option<ViewId>, name: &str) -> Self {
        let id = rt.allocate_subscriber_id();
        let inner = Rc::new(CellInner {
            rt: rt.clone(),
            id,
            name: Rc::from(name),
            value: RefCell::new(value.into()),
            owning_view,
            subscribers: RefCell::new(BTreeSet::new()),
            dependent_elmt_ids: RefCell::new(BTreeSet::new()),
            callbacks: RefCell::new(Vec::new()),
            version: Cell::new(0),
            deleted: Cell::new(false),
        });
        rt.register_cell(id, Rc::downgrade(&inner));
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Rc<CellInner>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn owning_view(&self) -> Option<ViewId> {
        self.inner.owning_view
    }

    /// Number of effective changes so far.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.get()
    }

    /// Whether two handles refer to the same cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &ObservedProperty) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current value. Records the rendering element (if any) as a dependent
    /// and registers the read with a bound computed value or monitor.
    #[must_use]
    pub fn get(&self) -> Value {
        let rt = &self.inner.rt;
        if let Some(frame) = rt.current_render() {
            self.record_dependent_update(frame.elmt_id);
        }
        match rt.engine().current() {
            Some(Dependent::Computed(_) | Dependent::Monitor(_)) => {
                rt.engine().add_ref(Target::Source(self.inner.id), VALUE_PROP);
            }
            Some(Dependent::Element(_)) | None => {}
        }
        self.get_untracked()
    }

    /// Current value without recording any dependency.
    #[must_use]
    pub fn get_untracked(&self) -> Value {
        self.inner.value.borrow().clone()
    }

    fn record_dependent_update(&self, elmt_id: ElementId) {
        if self.inner.deleted.get() {
            return;
        }
        if self.inner.dependent_elmt_ids.borrow_mut().insert(elmt_id) {
            self.inner.rt.note_element_read(elmt_id, self.inner.id);
        }
    }

    /// Replace the value and notify, unless it is the same value.
    ///
    /// # Errors
    ///
    /// Anything a dependent raises while being notified, plus
    /// [`ReactiveError::InconsistentSubscriber`] if the cell was deleted.
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        if self.inner.deleted.get() {
            error!(cell = %self.inner.id, name = %self.inner.name, "write to deleted property");
            return Err(ReactiveError::InconsistentSubscriber {
                subscriber: self.inner.id,
                reason: format!("property '{}' was written after deletion", self.inner.name),
            });
        }
        let value = value.into();
        if self.inner.value.borrow().same(&value) {
            return Ok(());
        }
        *self.inner.value.borrow_mut() = value;
        self.inner.version.set(self.inner.version.get() + 1);
        self.notify_changed()
    }

    /// Tell every dependent that the value changed.
    ///
    /// Peers and closure subscribers are called right away. Dependent
    /// elements, computed values, and monitors are queued and run once the
    /// outermost batch completes.
    pub fn notify_changed(&self) -> Result<()> {
        if self.inner.deleted.get() {
            return Ok(());
        }
        let rt = self.inner.rt.clone();
        rt.batch(|| {
            if let Some(view) = self.inner.owning_view {
                rt.require_view(view)?;
            }
            let elmt_ids: Vec<ElementId> =
                self.inner.dependent_elmt_ids.borrow().iter().copied().collect();
            for elmt_id in elmt_ids {
                rt.mark_element_dirty(elmt_id);
            }

            let peers: Vec<SubscriberId> = self.inner.subscribers.borrow().iter().copied().collect();
            for peer_id in peers {
                match rt.subscriber(peer_id) {
                    Some(peer) => peer.sync_peer_has_changed(self)?,
                    None => {
                        debug!(cell = %self.inner.id, subscriber = %peer_id, "pruning stale subscriber");
                        self.inner.subscribers.borrow_mut().remove(&peer_id);
                    }
                }
            }

            self.notify_callbacks();
            rt.fire_change(Target::Source(self.inner.id), VALUE_PROP);
            Ok(())
        })
    }

    fn notify_callbacks(&self) {
        let live: Vec<Rc<Callback>> = {
            let mut callbacks = self.inner.callbacks.borrow_mut();
            callbacks.retain(|w| w.strong_count() > 0);
            callbacks.iter().filter_map(Weak::upgrade).collect()
        };
        if live.is_empty() {
            return;
        }
        let value = self.get_untracked();
        for callback in live {
            callback(&value);
        }
    }

    /// Single-value notification is not supported on partial-update cells.
    ///
    /// # Errors
    ///
    /// Always [`ReactiveError::LegacyNotification`].
    pub fn notify_has_changed(&self, _value: &Value) -> Result<()> {
        error!(
            cell = %self.inner.id,
            name = %self.inner.name,
            "notify_has_changed is not supported on partial-update properties"
        );
        Err(ReactiveError::LegacyNotification {
            name: self.inner.name.to_string(),
        })
    }

    /// Register a closure called with the new value after every change.
    /// The callback lives as long as the returned [`Subscription`].
    #[must_use = "dropping the subscription unsubscribes"]
    pub fn subscribe(&self, callback: impl Fn(&Value) + 'static) -> Subscription {
        let callback: Rc<Callback> = Rc::new(callback);
        self.inner.callbacks.borrow_mut().push(Rc::downgrade(&callback));
        Subscription { _callback: callback }
    }

    pub fn add_subscriber(&self, subscriber: SubscriberId) {
        self.inner.subscribers.borrow_mut().insert(subscriber);
    }

    /// Remove a peer subscriber. Returns `true` when no subscribers remain,
    /// in which case an owner may tear the cell down.
    pub fn remove_subscriber(&self, subscriber: SubscriberId) -> bool {
        let mut subscribers = self.inner.subscribers.borrow_mut();
        subscribers.remove(&subscriber);
        subscribers.is_empty()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.borrow().len()
    }

    /// Element ids that read the cell during their latest pass, ascending.
    #[must_use]
    pub fn dependent_element_ids(&self) -> Vec<ElementId> {
        self.inner.dependent_elmt_ids.borrow().iter().copied().collect()
    }

    /// Drop `elmt_id` from the dependent set (the element was deleted).
    pub fn purge_dependency_on_elmt_id(&self, elmt_id: ElementId) {
        self.inner.dependent_elmt_ids.borrow_mut().remove(&elmt_id);
    }

    /// Tear the cell down: forget every subscriber and dependent and leave
    /// the runtime registry. Idempotent.
    pub fn about_to_be_deleted(&self) {
        if self.inner.deleted.replace(true) {
            return;
        }
        debug!(cell = %self.inner.id, name = %self.inner.name, "property deleted");
        self.inner.subscribers.borrow_mut().clear();
        self.inner.dependent_elmt_ids.borrow_mut().clear();
        self.inner.callbacks.borrow_mut().clear();
        self.inner.rt.unregister_cell(self.inner.id);
    }
}

impl std::fmt::Debug for ObservedProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservedProperty")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("value", &*self.inner.value.borrow())
            .field("version", &self.inner.version.get())
            .finish()
    }
}

/// RAII guard for a closure subscription. Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes"]
pub struct Subscription {
    _callback: Rc<Callback>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PeerSubscriber;
    use weft_core::ObjectRef;

    struct CountingPeer {
        id: SubscriberId,
        calls: Cell<u32>,
    }

    impl PeerSubscriber for CountingPeer {
        fn subscriber_id(&self) -> SubscriberId {
            self.id
        }

        fn sync_peer_has_changed(&self, _source: &ObservedProperty) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            Ok(())
        }
    }

    fn peer(rt: &Runtime, cell: &ObservedProperty) -> Rc<CountingPeer> {
        let peer = Rc::new(CountingPeer {
            id: SubscriberId::new(10_000),
            calls: Cell::new(0),
        });
        let dyn_peer: Rc<dyn PeerSubscriber> = peer.clone();
        rt.register_subscriber(&dyn_peer);
        cell.add_subscriber(peer.id);
        peer
    }

    #[test]
    fn set_same_value_is_noop() {
        let rt = Runtime::default();
        let cell = ObservedProperty::new(&rt, 5, None, "count");
        let peer = peer(&rt, &cell);
        cell.set(5).unwrap();
        assert_eq!(peer.calls.get(), 0);
        assert_eq!(cell.version(), 0);

        cell.set(6).unwrap();
        assert_eq!(peer.calls.get(), 1);
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn same_object_is_noop_even_after_mutation() {
        let rt = Runtime::default();
        let obj = ObjectRef::plain().with("a", 1);
        let cell = ObservedProperty::new(&rt, obj.clone(), None, "obj");
        let peer = peer(&rt, &cell);
        obj.insert("a", Value::from(2));
        cell.set(obj).unwrap();
        assert_eq!(peer.calls.get(), 0);
    }

    #[test]
    fn subscription_drop_unsubscribes() {
        let rt = Runtime::default();
        let cell = ObservedProperty::new(&rt, 0, None, "n");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let sub = cell.subscribe(move |v| sink.borrow_mut().push(v.as_number()));
        cell.set(1).unwrap();
        drop(sub);
        cell.set(2).unwrap();
        assert_eq!(*seen.borrow(), vec![Some(1.0)]);
    }

    #[test]
    fn stale_subscriber_is_pruned() {
        let rt = Runtime::default();
        let cell = ObservedProperty::new(&rt, 0, None, "n");
        let gone = peer(&rt, &cell);
        drop(gone);
        cell.set(1).unwrap();
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[test]
    fn legacy_notification_is_an_error() {
        let rt = Runtime::default();
        let cell = ObservedProperty::new(&rt, 0, None, "legacy");
        let err = cell.notify_has_changed(&Value::from(1)).unwrap_err();
        assert_eq!(
            err,
            ReactiveError::LegacyNotification {
                name: "legacy".into()
            }
        );
    }

    #[test]
    fn write_after_delete_is_an_error() {
        let rt = Runtime::default();
        let cell = ObservedProperty::new(&rt, 0, None, "n");
        cell.about_to_be_deleted();
        assert!(matches!(
            cell.set(1),
            Err(ReactiveError::InconsistentSubscriber { .. })
        ));
    }

    #[test]
    fn remove_subscriber_reports_empty() {
        let rt = Runtime::default();
        let cell = ObservedProperty::new(&rt, 0, None, "n");
        cell.add_subscriber(SubscriberId::new(1));
        cell.add_subscriber(SubscriberId::new(2));
        assert!(!cell.remove_subscriber(SubscriberId::new(1)));
        assert!(cell.remove_subscriber(SubscriberId::new(2)));
    }
}
