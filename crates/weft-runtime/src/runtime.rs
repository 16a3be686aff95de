#![forbid(unsafe_code)]

//! The runtime context.
//!
//! A [`Runtime`] owns everything that would otherwise be process-wide: the
//! element id allocator, the view arena, the subscriber and reaction
//! registries, the render stack, and the [`ObserveEngine`]. Each application
//! instance (and each test) creates its own, so nothing leaks between them.
//!
//! # Back-links
//!
//! Views are stored in an arena keyed by [`ViewId`]. Anything that needs to
//! reach a view holds its id and looks it up; an absent entry means the view
//! was torn down. Where a view is required, absence is a
//! [`ReactiveError::ViewDisposed`]. Subscribers and reactions are indexed
//! weakly: their handles own them, and an entry whose handle is gone is
//! pruned the next time it is looked up.
//!
//! # Delivery
//!
//! State changes mark element ids dirty immediately and queue computed values
//! and monitors. Work runs in [`flush`](Runtime::flush): reactions first, then
//! every dirty view re-renders its dirty elements in ascending id order,
//! repeated until nothing is pending. With `sync_flush` enabled a flush
//! starts as soon as the outermost [`batch`](Runtime::batch) completes.
//!
//! # Invariants
//!
//! 1. Only one flush runs at a time; changes made during a flush are drained
//!    by that same flush.
//! 2. A flush that has not settled after `max_flush_rounds` rounds stops with
//!    [`ReactiveError::FlushLimit`].
//! 3. Element ids and view ids come from one allocator, in creation order.
//! 4. A flush stopped by an error keeps the work it did not reach queued:
//!    unrun reactions stay pending and a view with dirty elements left stays
//!    scheduled, so the next flush picks them up.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use ahash::{AHashMap, AHashSet};
use tracing::{debug, debug_span, error, trace};
use weft_core::{
    ElementId, IdAllocator, ObjectRef, ReactiveError, Result, RuntimeConfig, SubscriberId, Value,
    ViewId,
};

use crate::cell::{CellInner, ObservedProperty};
use crate::observe::{Dependent, ObserveEngine, Target};
use crate::view::View;

/// Receives change notifications from an [`ObservedProperty`] it subscribed to.
pub trait PeerSubscriber {
    /// The id this subscriber registered under.
    fn subscriber_id(&self) -> SubscriberId;

    /// `source` changed. Implementations must check that `source` is the cell
    /// they subscribed to.
    fn sync_peer_has_changed(&self, source: &ObservedProperty) -> Result<()>;
}

/// A computation the runtime re-runs when its dependencies change.
pub(crate) trait Reaction {
    fn react(&self) -> Result<()>;
}

/// The element whose update closure is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderFrame {
    pub view: ViewId,
    pub elmt_id: ElementId,
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    ids: IdAllocator,
    subscriber_ids: IdAllocator,
    engine: ObserveEngine,
    views: RefCell<AHashMap<ViewId, View>>,
    element_owner: RefCell<AHashMap<ElementId, ViewId>>,
    element_reads: RefCell<AHashMap<ElementId, AHashSet<SubscriberId>>>,
    cells: RefCell<AHashMap<SubscriberId, Weak<CellInner>>>,
    subscribers: RefCell<AHashMap<SubscriberId, Weak<dyn PeerSubscriber>>>,
    reactions: RefCell<AHashMap<SubscriberId, Weak<dyn Reaction>>>,
    pending_reactions: RefCell<BTreeSet<Dependent>>,
    dirty_views: RefCell<BTreeSet<ViewId>>,
    render_stack: RefCell<Vec<RenderFrame>>,
    batch_depth: Cell<u32>,
    flushing: Cell<bool>,
}

/// Shared handle to a runtime context. Cloning is cheap.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with the given configuration.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        debug!(prop_copy = %config.prop_copy, sync_flush = config.sync_flush, "runtime created");
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                ids: IdAllocator::new(),
                subscriber_ids: IdAllocator::new(),
                engine: ObserveEngine::new(),
                views: RefCell::new(AHashMap::new()),
                element_owner: RefCell::new(AHashMap::new()),
                element_reads: RefCell::new(AHashMap::new()),
                cells: RefCell::new(AHashMap::new()),
                subscribers: RefCell::new(AHashMap::new()),
                reactions: RefCell::new(AHashMap::new()),
                pending_reactions: RefCell::new(BTreeSet::new()),
                dirty_views: RefCell::new(BTreeSet::new()),
                render_stack: RefCell::new(Vec::new()),
                batch_depth: Cell::new(0),
                flushing: Cell::new(false),
            }),
        }
    }

    /// Create a runtime configured from the environment.
    ///
    /// # Errors
    ///
    /// [`ReactiveError::Config`] for malformed environment values.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(RuntimeConfig::from_env()?))
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn engine(&self) -> &ObserveEngine {
        &self.inner.engine
    }

    /// Whether two handles refer to the same runtime.
    #[must_use]
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // -- ids -----------------------------------------------------------------

    /// Allocate the next element id.
    pub fn allocate_element_id(&self) -> ElementId {
        ElementId::new(self.inner.ids.allocate())
    }

    /// The id the next element allocation will return.
    #[must_use]
    pub fn peek_element_id(&self) -> ElementId {
        ElementId::new(self.inner.ids.peek())
    }

    pub(crate) fn allocate_view_id(&self) -> ViewId {
        ViewId::new(self.inner.ids.allocate())
    }

    pub(crate) fn allocate_subscriber_id(&self) -> SubscriberId {
        SubscriberId::new(self.inner.subscriber_ids.allocate())
    }

    // -- view arena ----------------------------------------------------------

    /// Create a view, optionally as a child of `parent`.
    pub fn create_view(&self, name: &str, parent: Option<&View>) -> View {
        let id = self.allocate_view_id();
        let view = View::new(self.clone(), id, name, parent.map(View::id));
        if let Some(parent) = parent {
            parent.add_child_view(id);
        }
        self.inner.views.borrow_mut().insert(id, view.clone());
        debug!(%id, name, "view created");
        view
    }

    /// Look up a live view.
    #[must_use]
    pub fn view(&self, id: ViewId) -> Option<View> {
        self.inner.views.borrow().get(&id).cloned()
    }

    /// Look up a view that must still be alive.
    ///
    /// # Errors
    ///
    /// [`ReactiveError::ViewDisposed`] if the view has been removed.
    pub fn require_view(&self, id: ViewId) -> Result<View> {
        self.view(id).ok_or(ReactiveError::ViewDisposed { view: id })
    }

    pub(crate) fn remove_view(&self, id: ViewId) {
        self.inner.views.borrow_mut().remove(&id);
        self.inner.dirty_views.borrow_mut().remove(&id);
    }

    /// Number of live views.
    #[must_use]
    pub fn view_count(&self) -> usize {
        self.inner.views.borrow().len()
    }

    /// Tear down every live view, root views first.
    pub fn shutdown(&self) -> Result<()> {
        let mut roots: Vec<View> = self
            .inner
            .views
            .borrow()
            .values()
            .filter(|v| v.parent_id().is_none())
            .cloned()
            .collect();
        roots.sort_by_key(View::id);
        for view in roots {
            view.about_to_be_deleted()?;
        }
        // Orphans whose parent went away without deleting them.
        let rest: Vec<View> = self.inner.views.borrow().values().cloned().collect();
        for view in rest {
            view.about_to_be_deleted()?;
        }
        Ok(())
    }

    // -- element ownership ---------------------------------------------------

    pub(crate) fn register_element_owner(&self, elmt_id: ElementId, view: ViewId) {
        self.inner.element_owner.borrow_mut().insert(elmt_id, view);
    }

    /// The view an element id belongs to.
    #[must_use]
    pub fn element_owner(&self, elmt_id: ElementId) -> Option<ViewId> {
        self.inner.element_owner.borrow().get(&elmt_id).copied()
    }

    /// Drop all runtime-side knowledge of a purged element.
    pub(crate) fn forget_element(&self, elmt_id: ElementId) {
        self.inner.element_owner.borrow_mut().remove(&elmt_id);
        self.inner.engine.clear_dependent(Dependent::Element(elmt_id));
        self.clear_element_reads(elmt_id);
    }

    /// Remove `elmt_id` from the dependent set of every cell it read. Called
    /// before each run of its update closure so the run records afresh.
    pub(crate) fn clear_element_reads(&self, elmt_id: ElementId) {
        let readers = self.inner.element_reads.borrow_mut().remove(&elmt_id);
        for cell_id in readers.into_iter().flatten() {
            if let Some(cell) = self.cell(cell_id) {
                cell.purge_dependency_on_elmt_id(elmt_id);
            }
        }
    }

    /// Mark an element dirty in whichever view owns it. Unknown ids are
    /// stale (already purged) and are ignored.
    pub fn mark_element_dirty(&self, elmt_id: ElementId) {
        let Some(view_id) = self.element_owner(elmt_id) else {
            trace!(%elmt_id, "dirty mark for purged element ignored");
            return;
        };
        match self.view(view_id) {
            Some(view) => {
                if view.mark_dirty(elmt_id) {
                    self.inner.dirty_views.borrow_mut().insert(view_id);
                }
            }
            None => {
                trace!(%elmt_id, %view_id, "dirty mark for removed view ignored");
                self.inner.element_owner.borrow_mut().remove(&elmt_id);
            }
        }
    }

    // -- render stack --------------------------------------------------------

    pub(crate) fn push_render(&self, frame: RenderFrame) -> RenderGuard<'_> {
        self.inner.render_stack.borrow_mut().push(frame);
        RenderGuard { rt: self }
    }

    /// The element whose update closure is executing right now.
    #[must_use]
    pub fn current_render(&self) -> Option<RenderFrame> {
        self.inner.render_stack.borrow().last().copied()
    }

    // -- cells and subscribers -----------------------------------------------

    pub(crate) fn register_cell(&self, id: SubscriberId, cell: Weak<CellInner>) {
        self.inner.cells.borrow_mut().insert(id, cell);
    }

    pub(crate) fn unregister_cell(&self, id: SubscriberId) {
        self.inner.cells.borrow_mut().remove(&id);
        self.inner.engine.forget_target(Target::Source(id));
    }

    pub(crate) fn cell(&self, id: SubscriberId) -> Option<ObservedProperty> {
        let weak = self.inner.cells.borrow().get(&id).cloned()?;
        match weak.upgrade() {
            Some(inner) => Some(ObservedProperty::from_inner(inner)),
            None => {
                self.inner.cells.borrow_mut().remove(&id);
                None
            }
        }
    }

    pub(crate) fn note_element_read(&self, elmt_id: ElementId, cell: SubscriberId) {
        self.inner
            .element_reads
            .borrow_mut()
            .entry(elmt_id)
            .or_default()
            .insert(cell);
    }

    /// Register a peer subscriber. The runtime keeps only a weak index; the
    /// caller owns the subscriber.
    pub fn register_subscriber(&self, subscriber: &Rc<dyn PeerSubscriber>) {
        let id = subscriber.subscriber_id();
        self.inner
            .subscribers
            .borrow_mut()
            .insert(id, Rc::downgrade(subscriber));
    }

    pub fn unregister_subscriber(&self, id: SubscriberId) {
        self.inner.subscribers.borrow_mut().remove(&id);
    }

    /// Look up a subscriber. Entries whose owner is gone are pruned.
    #[must_use]
    pub fn subscriber(&self, id: SubscriberId) -> Option<Rc<dyn PeerSubscriber>> {
        let weak = self.inner.subscribers.borrow().get(&id).cloned()?;
        let found = weak.upgrade();
        if found.is_none() {
            self.inner.subscribers.borrow_mut().remove(&id);
        }
        found
    }

    // -- reactions -----------------------------------------------------------

    pub(crate) fn register_reaction(&self, id: SubscriberId, reaction: Weak<dyn Reaction>) {
        self.inner.reactions.borrow_mut().insert(id, reaction);
    }

    pub(crate) fn unregister_reaction(&self, dependent: Dependent) {
        if let Dependent::Computed(id) | Dependent::Monitor(id) = dependent {
            self.inner.reactions.borrow_mut().remove(&id);
            self.inner.pending_reactions.borrow_mut().remove(&dependent);
        }
        self.inner.engine.clear_dependent(dependent);
    }

    fn reaction(&self, id: SubscriberId) -> Option<Rc<dyn Reaction>> {
        let weak = self.inner.reactions.borrow().get(&id).cloned()?;
        weak.upgrade()
    }

    // -- observed objects ----------------------------------------------------

    /// Read a property. Reads of observed objects register a dependency for
    /// the bound dependent. Missing properties read as `undefined`.
    pub fn read_prop(&self, obj: &ObjectRef, key: &str) -> Value {
        if obj.is_observed() {
            self.inner.engine.add_ref(Target::Object(obj.id()), key);
        }
        obj.get(key).unwrap_or_default()
    }

    /// Write a property. Writing the same value is a no-op; otherwise
    /// dependents of an observed object's property are notified.
    pub fn write_prop(&self, obj: &ObjectRef, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let old = obj.get(key).unwrap_or_default();
        if old.same(&value) {
            return Ok(());
        }
        obj.insert(key, value);
        if obj.is_observed() {
            self.batch(|| {
                self.fire_change(Target::Object(obj.id()), key);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Route a change of `prop` of `target` to its dependents.
    pub fn fire_change(&self, target: Target, prop: &str) {
        for dep in self.inner.engine.fire_change(target, prop) {
            match dep {
                Dependent::Element(elmt_id) => self.mark_element_dirty(elmt_id),
                reaction => {
                    self.inner.pending_reactions.borrow_mut().insert(reaction);
                }
            }
        }
    }

    // -- batching and flushing -----------------------------------------------

    /// Run `f` with delivery deferred until the outermost batch completes.
    pub fn batch<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.inner.batch_depth.set(self.inner.batch_depth.get() + 1);
        let result = f();
        let depth = self.inner.batch_depth.get() - 1;
        self.inner.batch_depth.set(depth);
        let value = result?;
        if depth == 0 {
            self.schedule()?;
        }
        Ok(value)
    }

    pub(crate) fn enter_batch(&self) {
        self.inner.batch_depth.set(self.inner.batch_depth.get() + 1);
    }

    /// Leave a batch; returns `true` if this was the outermost one.
    pub(crate) fn leave_batch(&self) -> bool {
        let depth = self.inner.batch_depth.get().saturating_sub(1);
        self.inner.batch_depth.set(depth);
        depth == 0
    }

    /// Whether a batch scope is active.
    #[must_use]
    pub fn in_batch(&self) -> bool {
        self.inner.batch_depth.get() > 0
    }

    /// Flush now if the configuration asks for synchronous delivery.
    pub(crate) fn schedule(&self) -> Result<()> {
        if self.inner.config.sync_flush && !self.in_batch() && !self.inner.flushing.get() {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Whether anything is waiting to be delivered.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.inner.pending_reactions.borrow().is_empty()
            || !self.inner.dirty_views.borrow().is_empty()
    }

    /// Deliver pending work until nothing is left.
    ///
    /// # Errors
    ///
    /// Errors from reactions and update closures propagate unchanged;
    /// [`ReactiveError::FlushLimit`] if the cascade does not settle.
    pub fn flush(&self) -> Result<()> {
        if self.inner.flushing.replace(true) {
            return Ok(());
        }
        let _reset = FlushReset { rt: self };
        let _span = debug_span!("flush").entered();

        let max_rounds = self.inner.config.max_flush_rounds;
        for round in 0..max_rounds {
            let reactions = std::mem::take(&mut *self.inner.pending_reactions.borrow_mut());
            if !reactions.is_empty() {
                trace!(round, count = reactions.len(), "running reactions");
                let mut queue = reactions.into_iter();
                while let Some(dep) = queue.next() {
                    let (Dependent::Computed(id) | Dependent::Monitor(id)) = dep else {
                        continue;
                    };
                    let Some(reaction) = self.reaction(id) else {
                        trace!(?dep, "reaction dropped before delivery");
                        self.inner.reactions.borrow_mut().remove(&id);
                        continue;
                    };
                    if let Err(err) = reaction.react() {
                        // Unrun reactions stay queued for the next flush.
                        self.inner.pending_reactions.borrow_mut().extend(queue);
                        return Err(err);
                    }
                }
                continue;
            }

            let views = std::mem::take(&mut *self.inner.dirty_views.borrow_mut());
            if views.is_empty() {
                return Ok(());
            }
            trace!(round, count = views.len(), "re-rendering dirty views");
            let mut queue = views.into_iter();
            while let Some(view_id) = queue.next() {
                let Some(view) = self.view(view_id) else {
                    continue;
                };
                if let Err(err) = view.rerender() {
                    let mut dirty = self.inner.dirty_views.borrow_mut();
                    if view.has_dirty_elements() {
                        dirty.insert(view_id);
                    }
                    dirty.extend(queue);
                    debug!(view = %view_id, pending = dirty.len(), "rerender failed, dirty views kept");
                    return Err(err);
                }
            }
        }

        if self.has_pending() {
            error!(rounds = max_rounds, "change propagation did not settle");
            return Err(ReactiveError::FlushLimit { rounds: max_rounds });
        }
        Ok(())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("views", &self.inner.views.borrow().len())
            .field("batch_depth", &self.inner.batch_depth.get())
            .field("flushing", &self.inner.flushing.get())
            .finish()
    }
}

/// Pops the render frame pushed by [`Runtime::push_render`].
pub(crate) struct RenderGuard<'a> {
    rt: &'a Runtime,
}

impl Drop for RenderGuard<'_> {
    fn drop(&mut self) {
        self.rt.inner.render_stack.borrow_mut().pop();
    }
}

struct FlushReset<'a> {
    rt: &'a Runtime,
}

impl Drop for FlushReset<'_> {
    fn drop(&mut self) {
        self.rt.inner.flushing.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_and_view_ids_share_one_sequence() {
        let rt = Runtime::default();
        let a = rt.allocate_element_id();
        let view = rt.create_view("Root", None);
        let b = rt.allocate_element_id();
        assert!(a.get() < view.id().get());
        assert!(view.id().get() < b.get());
        assert_eq!(rt.peek_element_id().get(), b.get() + 1);
    }

    #[test]
    fn require_view_reports_disposed() {
        let rt = Runtime::default();
        let view = rt.create_view("Gone", None);
        let id = view.id();
        view.about_to_be_deleted().unwrap();
        assert_eq!(
            rt.require_view(id).unwrap_err(),
            ReactiveError::ViewDisposed { view: id }
        );
    }

    #[test]
    fn write_prop_identity_is_noop() {
        let rt = Runtime::default();
        let obj = ObjectRef::plain().with("n", 1).observed();
        let engine = rt.engine();
        let dep = Dependent::Element(ElementId::new(99));
        {
            let _bind = engine.start_bind(Some(dep));
            assert_eq!(rt.read_prop(&obj, "n"), Value::from(1));
        }
        assert!(engine.depends_on(dep, Target::Object(obj.id()), "n"));

        rt.write_prop(&obj, "n", 1).unwrap();
        assert!(!rt.has_pending());
        rt.write_prop(&obj, "n", 2).unwrap();
        assert_eq!(obj.get("n"), Some(Value::from(2)));
    }

    #[test]
    fn unobserved_objects_are_not_tracked() {
        let rt = Runtime::default();
        let obj = ObjectRef::plain().with("n", 1);
        let dep = Dependent::Element(ElementId::new(1));
        {
            let _bind = rt.engine().start_bind(Some(dep));
            let _ = rt.read_prop(&obj, "n");
        }
        assert_eq!(rt.engine().dependency_count(dep), 0);
    }

    #[test]
    fn batch_defers_flush_until_outermost_scope() {
        let rt = Runtime::default();
        let inner_flag = rt.batch(|| {
            assert!(rt.in_batch());
            rt.batch(|| Ok(rt.in_batch()))
        });
        assert!(inner_flag.unwrap());
        assert!(!rt.in_batch());
    }

    #[test]
    fn missing_property_reads_undefined() {
        let rt = Runtime::default();
        let obj = ObjectRef::plain().observed();
        assert!(rt.read_prop(&obj, "nope").is_undefined());
    }
}
