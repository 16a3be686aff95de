#![forbid(unsafe_code)]

//! One-way prop synchronization.
//!
//! A [`OneWayProp`] is the child side of a parent → child prop. It keeps a
//! local copy of the parent's value in a cell owned by the child view and
//! refreshes that copy whenever the source cell notifies it. Local writes
//! never travel back to the source.
//!
//! The source is either the parent's own cell ([`OneWayProp::from_cell`]) or
//! a cell the binding creates around a plain value
//! ([`OneWayProp::from_value`]). In the second case the binding owns the
//! source and deletes it on teardown.
//!
//! # Invariants
//!
//! 1. Writes to the local value never reach the source.
//! 2. A source change always replaces the local value with a copy made in
//!    the binding's [`CopyMode`], resolved once at construction.
//! 3. The local cell notifies its dependents only when the copy differs in
//!    identity from the current local value.

use std::rc::Rc;

use tracing::{debug, warn};
use weft_core::{CopyMode, Result, SubscriberId, Value, ViewId};

use crate::cell::{ObservedProperty, Subscription};
use crate::runtime::{PeerSubscriber, Runtime};

/// Where a prop takes its value from.
#[derive(Debug, Clone)]
pub enum PropSource {
    /// Subscribe to an existing cell (typically a parent's state).
    Cell(ObservedProperty),
    /// Wrap a plain value in a cell the prop owns.
    Value(Value),
}

struct PropInner {
    rt: Runtime,
    id: SubscriberId,
    name: Rc<str>,
    source: ObservedProperty,
    source_is_own_object: bool,
    local: ObservedProperty,
    mode: CopyMode,
}

impl PeerSubscriber for PropInner {
    fn subscriber_id(&self) -> SubscriberId {
        self.id
    }

    fn sync_peer_has_changed(&self, source: &ObservedProperty) -> Result<()> {
        if !source.ptr_eq(&self.source) {
            warn!(
                prop = %self.id,
                name = %self.name,
                notifier = %source.id(),
                expected = %self.source.id(),
                "change notification from a cell that is not this prop's source"
            );
            return Ok(());
        }
        let copy = self.mode.copy(&self.source.get_untracked());
        if copy.same(&self.local.get_untracked()) {
            return Ok(());
        }
        debug!(prop = %self.id, name = %self.name, mode = %self.mode, "prop synced from source");
        self.local.set(copy)
    }
}

/// Child-local copy of a parent value.
#[derive(Clone)]
pub struct OneWayProp {
    inner: Rc<PropInner>,
}

impl OneWayProp {
    /// Bind to `parent`'s cell, copying in the runtime's configured mode.
    pub fn from_cell(
        rt: &Runtime,
        parent: &ObservedProperty,
        owning_view: Option<ViewId>,
        name: &str,
    ) -> Self {
        Self::with_copy_mode(
            rt,
            PropSource::Cell(parent.clone()),
            rt.config().prop_copy,
            owning_view,
            name,
        )
    }

    /// Wrap `value` in a source cell this prop owns.
    pub fn from_value(
        rt: &Runtime,
        value: impl Into<Value>,
        owning_view: Option<ViewId>,
        name: &str,
    ) -> Self {
        Self::with_copy_mode(
            rt,
            PropSource::Value(value.into()),
            rt.config().prop_copy,
            owning_view,
            name,
        )
    }

    /// Build a prop with an explicit copy mode.
    pub fn with_copy_mode(
        rt: &Runtime,
        source: PropSource,
        mode: CopyMode,
        owning_view: Option<ViewId>,
        name: &str,
    ) -> Self {
        let (source, source_is_own_object) = match source {
            PropSource::Cell(cell) => (cell, false),
            PropSource::Value(value) => (
                ObservedProperty::new(rt, value, None, &format!("{name}.source")),
                true,
            ),
        };
        let local = ObservedProperty::new(
            rt,
            mode.copy(&source.get_untracked()),
            owning_view,
            name,
        );
        let inner = Rc::new(PropInner {
            rt: rt.clone(),
            id: rt.allocate_subscriber_id(),
            name: Rc::from(name),
            source,
            source_is_own_object,
            local,
            mode,
        });
        let peer: Rc<dyn PeerSubscriber> = inner.clone();
        rt.register_subscriber(&peer);
        inner.source.add_subscriber(inner.id);
        debug!(prop = %inner.id, name, %mode, own_source = source_is_own_object, "prop created");
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
    pub fn copy_mode(&self) -> CopyMode {
        self.inner.mode
    }

    #[must_use]
    pub fn source_is_own_object(&self) -> bool {
        self.inner.source_is_own_object
    }

    /// The source cell.
    #[must_use]
    pub fn source(&self) -> &ObservedProperty {
        &self.inner.source
    }

    /// The cell holding the local copy.
    #[must_use]
    pub fn cell(&self) -> &ObservedProperty {
        &self.inner.local
    }

    /// Local value, tracked like any cell read.
    #[must_use]
    pub fn get(&self) -> Value {
        self.inner.local.get()
    }

    /// Assign locally. The value is stored as is; the source is untouched.
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        self.inner.local.set(value)
    }

    /// New value from the parent's re-render: forwarded to the source cell,
    /// which calls back into this prop if it changed.
    pub fn reset(&self, value: impl Into<Value>) -> Result<()> {
        self.inner.source.set(value)
    }

    /// Closure subscription on the local value.
    pub fn subscribe(&self, callback: impl Fn(&Value) + 'static) -> Subscription {
        self.inner.local.subscribe(callback)
    }

    /// Unsubscribe from the source, delete an owned source, and delete the
    /// local cell.
    pub fn about_to_be_deleted(&self) {
        let inner = &self.inner;
        let now_empty = inner.source.remove_subscriber(inner.id);
        if inner.source_is_own_object && now_empty {
            inner.source.about_to_be_deleted();
        }
        inner.rt.unregister_subscriber(inner.id);
        inner.local.about_to_be_deleted();
    }
}

impl std::fmt::Debug for OneWayProp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneWayProp")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("mode", &self.inner.mode)
            .field("source", &self.inner.source.id())
            .field("own_source", &self.inner.source_is_own_object)
            .finish()
    }
}
