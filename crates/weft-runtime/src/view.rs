#![forbid(unsafe_code)]

//! View update scheduler.
//!
//! A [`View`] is one component instance. It owns the update closures of the
//! elements it created, the state cells and props declared on it, and the
//! bookkeeping needed for partial updates:
//!
//! - `elements`: element id → update closure record, ordered by id.
//! - `element_children`: element id → ids created while its closure ran.
//!   This is what lets an `If` or `ForEach` find a whole subtree.
//! - `dirty`: ids whose closures must run in the next pass.
//!
//! Element ids are allocated in document order, so running closures in
//! ascending id order runs parents before children.
//!
//! # Passes
//!
//! - [`update`](View::update): full pass. Purges ids the host marked for
//!   deletion, applies new parameters, then runs every registered closure.
//! - [`rerender`](View::rerender): partial pass. Runs only dirty closures.
//!
//! # Invariants
//!
//! 1. Closures run in ascending element id order within a pass.
//! 2. A closure that fails on first render leaves no registration behind.
//! 3. Purging an id removes it from every map here and from the runtime,
//!    including the dependent sets of the cells it read.
//! 4. After [`about_to_be_deleted`](View::about_to_be_deleted) the view owns
//!    no element ids and is gone from the runtime's arena.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Closure error on first render | user code | registration rolled back, error returned |
//! | Closure error on re-render | user code | error returned, pass stops |
//! | Unknown element id | stale id passed to `ForEach`/`If` helpers | [`ReactiveError::UnknownElement`] |
//! | Parent disposed during provide lookup | broken view tree | [`ReactiveError::ViewDisposed`] |

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use ahash::AHashMap;
use indexmap::IndexMap;
use tracing::{debug, debug_span, trace};
use weft_core::{ElementId, ReactiveError, Result, Value, ViewId};

use crate::accessor::FieldAccessor;
use crate::attribute::NodeHandle;
use crate::branch::BranchState;
use crate::cell::ObservedProperty;
use crate::foreach::ForEachState;
use crate::observe::Dependent;
use crate::prop::OneWayProp;
use crate::runtime::{RenderFrame, Runtime};

/// An element's update closure: `(view, element id, is_first_render)`.
pub type UpdateFn = Rc<dyn Fn(&View, ElementId, bool) -> Result<()>>;

struct ElementRecord {
    update: UpdateFn,
    component: Rc<str>,
    parent: Option<ElementId>,
    node: Option<NodeHandle>,
}

pub(crate) struct ViewInner {
    rt: Runtime,
    id: ViewId,
    name: Rc<str>,
    parent: Option<ViewId>,
    children: RefCell<BTreeSet<ViewId>>,
    elements: RefCell<BTreeMap<ElementId, ElementRecord>>,
    element_children: RefCell<AHashMap<ElementId, BTreeSet<ElementId>>>,
    dirty: RefCell<BTreeSet<ElementId>>,
    marked_for_deletion: RefCell<BTreeSet<ElementId>>,
    slots: RefCell<Vec<Vec<ElementId>>>,
    states: RefCell<IndexMap<Rc<str>, ObservedProperty>>,
    props: RefCell<IndexMap<Rc<str>, OneWayProp>>,
    accessors: RefCell<IndexMap<Rc<str>, FieldAccessor>>,
    provided: RefCell<AHashMap<Rc<str>, ObservedProperty>>,
    params: RefCell<IndexMap<Rc<str>, Value>>,
    pub(crate) foreach: RefCell<AHashMap<ElementId, ForEachState>>,
    pub(crate) branches: RefCell<AHashMap<ElementId, BranchState>>,
    deleted: Cell<bool>,
}

/// Shared handle to a component instance.
#[derive(Clone)]
pub struct View {
    pub(crate) inner: Rc<ViewInner>,
}

impl View {
    pub(crate) fn new(rt: Runtime, id: ViewId, name: &str, parent: Option<ViewId>) -> Self {
        Self {
            inner: Rc::new(ViewInner {
                rt,
                id,
                name: Rc::from(name),
                parent,
                children: RefCell::new(BTreeSet::new()),
                elements: RefCell::new(BTreeMap::new()),
                element_children: RefCell::new(AHashMap::new()),
                dirty: RefCell::new(BTreeSet::new()),
                marked_for_deletion: RefCell::new(BTreeSet::new()),
                slots: RefCell::new(Vec::new()),
                states: RefCell::new(IndexMap::new()),
                props: RefCell::new(IndexMap::new()),
                accessors: RefCell::new(IndexMap::new()),
                provided: RefCell::new(AHashMap::new()),
                params: RefCell::new(IndexMap::new()),
                foreach: RefCell::new(AHashMap::new()),
                branches: RefCell::new(AHashMap::new()),
                deleted: Cell::new(false),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> ViewId {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.inner.rt
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<ViewId> {
        self.inner.parent
    }

    /// The parent view. A parent id whose view is gone is an error.
    pub fn parent(&self) -> Result<Option<View>> {
        self.inner
            .parent
            .map(|id| self.inner.rt.require_view(id))
            .transpose()
    }

    #[must_use]
    pub fn child_view_ids(&self) -> Vec<ViewId> {
        self.inner.children.borrow().iter().copied().collect()
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.get()
    }

    /// Create a component instance nested under this one.
    pub fn create_child(&self, name: &str) -> View {
        self.inner.rt.create_view(name, Some(self))
    }

    pub(crate) fn add_child_view(&self, child: ViewId) {
        self.inner.children.borrow_mut().insert(child);
    }

    fn remove_child_view(&self, child: ViewId) {
        self.inner.children.borrow_mut().remove(&child);
    }

    // -- element registration ------------------------------------------------

    /// Register a new element and run its closure for the first time.
    ///
    /// The element's parent is whichever element of this view is rendering
    /// right now. If the closure fails, the element and everything it
    /// created are purged before the error is returned.
    pub fn observe_component_creation2(
        &self,
        update: impl Fn(&View, ElementId, bool) -> Result<()> + 'static,
        component: &str,
    ) -> Result<ElementId> {
        let rt = &self.inner.rt;
        let elmt_id = rt.allocate_element_id();
        let parent = rt
            .current_render()
            .filter(|frame| frame.view == self.inner.id)
            .map(|frame| frame.elmt_id);

        self.inner.elements.borrow_mut().insert(
            elmt_id,
            ElementRecord {
                update: Rc::new(update),
                component: Rc::from(component),
                parent,
                node: None,
            },
        );
        rt.register_element_owner(elmt_id, self.inner.id);
        if let Some(parent) = parent {
            self.inner
                .element_children
                .borrow_mut()
                .entry(parent)
                .or_default()
                .insert(elmt_id);
        }
        if let Some(slot) = self.inner.slots.borrow_mut().last_mut() {
            slot.push(elmt_id);
        }
        trace!(view = %self.inner.id, %elmt_id, component, ?parent, "element created");

        if let Err(err) = self.run_element(elmt_id, true) {
            let subtree = self.collect_subtree(elmt_id, true);
            debug!(
                view = %self.inner.id,
                %elmt_id,
                component,
                purged = subtree.len(),
                error = %err,
                "first render failed, rolling back"
            );
            self.purge_element_ids(&subtree);
            return Err(err);
        }
        Ok(elmt_id)
    }

    fn run_element(&self, elmt_id: ElementId, is_first_render: bool) -> Result<()> {
        let update = match self.inner.elements.borrow().get(&elmt_id) {
            Some(record) => Rc::clone(&record.update),
            None => {
                return Err(ReactiveError::UnknownElement {
                    view: self.inner.id,
                    elmt_id,
                });
            }
        };
        let rt = &self.inner.rt;
        rt.clear_element_reads(elmt_id);
        let _frame = rt.push_render(RenderFrame {
            view: self.inner.id,
            elmt_id,
        });
        let _bind = rt.engine().start_bind(Some(Dependent::Element(elmt_id)));
        update(self, elmt_id, is_first_render)
    }

    #[must_use]
    pub fn has_element(&self, elmt_id: ElementId) -> bool {
        self.inner.elements.borrow().contains_key(&elmt_id)
    }

    /// Registered element ids, ascending.
    #[must_use]
    pub fn element_ids(&self) -> Vec<ElementId> {
        self.inner.elements.borrow().keys().copied().collect()
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.inner.elements.borrow().len()
    }

    /// Component name an element was created with.
    #[must_use]
    pub fn component_name(&self, elmt_id: ElementId) -> Option<Rc<str>> {
        self.inner
            .elements
            .borrow()
            .get(&elmt_id)
            .map(|r| Rc::clone(&r.component))
    }

    #[must_use]
    pub fn element_parent(&self, elmt_id: ElementId) -> Option<ElementId> {
        self.inner.elements.borrow().get(&elmt_id).and_then(|r| r.parent)
    }

    /// Attach the native node built for an element.
    pub fn set_node_handle(&self, elmt_id: ElementId, node: NodeHandle) -> Result<()> {
        match self.inner.elements.borrow_mut().get_mut(&elmt_id) {
            Some(record) => {
                record.node = Some(node);
                Ok(())
            }
            None => Err(ReactiveError::UnknownElement {
                view: self.inner.id,
                elmt_id,
            }),
        }
    }

    #[must_use]
    pub fn node_handle(&self, elmt_id: ElementId) -> Option<NodeHandle> {
        self.inner.elements.borrow().get(&elmt_id).and_then(|r| r.node)
    }

    pub(crate) fn require_element(&self, elmt_id: ElementId) -> Result<()> {
        if self.has_element(elmt_id) {
            Ok(())
        } else {
            Err(ReactiveError::UnknownElement {
                view: self.inner.id,
                elmt_id,
            })
        }
    }

    // -- slots ---------------------------------------------------------------

    /// Begin attributing newly created element ids to a list slot.
    pub fn start_new_child(&self) {
        self.inner.slots.borrow_mut().push(Vec::new());
    }

    /// Finish the innermost slot and return the ids created in it.
    pub fn finish_new_child(&self) -> Vec<ElementId> {
        self.inner.slots.borrow_mut().pop().unwrap_or_default()
    }

    // -- dirty tracking and passes -------------------------------------------

    /// Mark an element dirty. Returns `true` if it was registered and not
    /// already dirty.
    pub fn mark_dirty(&self, elmt_id: ElementId) -> bool {
        if !self.has_element(elmt_id) {
            return false;
        }
        self.inner.dirty.borrow_mut().insert(elmt_id)
    }

    pub(crate) fn has_dirty_elements(&self) -> bool {
        !self.inner.dirty.borrow().is_empty()
    }

    /// Dirty element ids, ascending.
    #[must_use]
    pub fn dirty_element_ids(&self) -> Vec<ElementId> {
        self.inner.dirty.borrow().iter().copied().collect()
    }

    /// Run the closures of dirty elements, lowest id first, until none are
    /// left. Ids dirtied during the pass are picked up by the same pass.
    pub fn rerender(&self) -> Result<()> {
        let _span = debug_span!("rerender", view = %self.inner.id, name = %self.inner.name).entered();
        loop {
            let next = self.inner.dirty.borrow_mut().pop_first();
            let Some(elmt_id) = next else {
                return Ok(());
            };
            if !self.has_element(elmt_id) {
                trace!(%elmt_id, "skipping purged dirty element");
                continue;
            }
            self.run_element(elmt_id, false)?;
        }
    }

    /// Full update pass.
    ///
    /// 1. Purge ids marked for deletion since the previous pass.
    /// 2. Store `params`, resetting the prop or field of the same name.
    /// 3. Run every registered closure in ascending id order.
    pub fn update<K, V>(&self, params: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: AsRef<str>,
        V: Into<Value>,
    {
        let _span = debug_span!("update", view = %self.inner.id, name = %self.inner.name).entered();
        let rt = self.inner.rt.clone();
        rt.batch(|| {
            self.purge_deleted_elmt_ids();
            for (key, value) in params {
                self.apply_param(key.as_ref(), value.into())?;
            }

            let ids = self.element_ids();
            debug!(view = %self.inner.id, elements = ids.len(), "update pass");
            for elmt_id in ids {
                // An earlier closure may have purged this one (branch switch).
                if !self.has_element(elmt_id) {
                    continue;
                }
                self.inner.dirty.borrow_mut().remove(&elmt_id);
                self.run_element(elmt_id, false)?;
            }
            Ok(())
        })
    }

    fn apply_param(&self, key: &str, value: Value) -> Result<()> {
        self.inner.params.borrow_mut().insert(Rc::from(key), value.clone());
        let prop = self.inner.props.borrow().get(key).cloned();
        if let Some(prop) = prop {
            return prop.reset(value);
        }
        let accessor = self.inner.accessors.borrow().get(key).cloned();
        if let Some(accessor) = accessor {
            return accessor.set(value);
        }
        Ok(())
    }

    /// Last value passed for `key` through [`update`](View::update).
    #[must_use]
    pub fn param(&self, key: &str) -> Option<Value> {
        self.inner.params.borrow().get(key).cloned()
    }

    // -- deletion ------------------------------------------------------------

    /// The host removed these elements; they are purged at the start of the
    /// next [`update`](View::update).
    pub fn mark_elements_for_deletion(&self, ids: impl IntoIterator<Item = ElementId>) {
        self.inner.marked_for_deletion.borrow_mut().extend(ids);
    }

    /// Purge everything marked for deletion. Returns the purged ids.
    pub fn purge_deleted_elmt_ids(&self) -> Vec<ElementId> {
        let marked = std::mem::take(&mut *self.inner.marked_for_deletion.borrow_mut());
        if marked.is_empty() {
            return Vec::new();
        }
        let mut ids = BTreeSet::new();
        for elmt_id in marked {
            ids.extend(self.collect_subtree(elmt_id, true));
        }
        let ids: Vec<ElementId> = ids.into_iter().collect();
        self.purge_element_ids(&ids);
        ids
    }

    /// `elmt_id`'s descendants in creation order, optionally with itself.
    pub(crate) fn collect_subtree(&self, elmt_id: ElementId, include_self: bool) -> Vec<ElementId> {
        let children = self.inner.element_children.borrow();
        let mut out = Vec::new();
        let mut stack = vec![elmt_id];
        while let Some(id) = stack.pop() {
            if id != elmt_id || include_self {
                out.push(id);
            }
            if let Some(kids) = children.get(&id) {
                stack.extend(kids.iter().rev());
            }
        }
        out.sort_unstable();
        out
    }

    /// Remove `ids` from every map of this view and from the runtime.
    pub(crate) fn purge_element_ids(&self, ids: &[ElementId]) {
        if ids.is_empty() {
            return;
        }
        for &elmt_id in ids {
            let record = self.inner.elements.borrow_mut().remove(&elmt_id);
            if let Some(parent) = record.and_then(|r| r.parent) {
                if let Some(kids) = self.inner.element_children.borrow_mut().get_mut(&parent) {
                    kids.remove(&elmt_id);
                }
            }
            self.inner.element_children.borrow_mut().remove(&elmt_id);
            self.inner.dirty.borrow_mut().remove(&elmt_id);
            self.inner.foreach.borrow_mut().remove(&elmt_id);
            self.inner.branches.borrow_mut().remove(&elmt_id);
            self.inner.rt.forget_element(elmt_id);
        }
        debug!(view = %self.inner.id, count = ids.len(), "purged element ids");
    }

    /// Tear the view down: child views first, then every element id, props,
    /// and state. Idempotent.
    pub fn about_to_be_deleted(&self) -> Result<()> {
        if self.inner.deleted.replace(true) {
            return Ok(());
        }
        let rt = self.inner.rt.clone();
        for child in self.child_view_ids() {
            if let Some(child) = rt.view(child) {
                child.about_to_be_deleted()?;
            }
        }

        let ids = self.element_ids();
        self.purge_element_ids(&ids);
        self.inner.marked_for_deletion.borrow_mut().clear();

        let props: Vec<OneWayProp> = self.inner.props.borrow_mut().drain(..).map(|(_, p)| p).collect();
        for prop in props {
            prop.about_to_be_deleted();
        }
        let states: Vec<ObservedProperty> =
            self.inner.states.borrow_mut().drain(..).map(|(_, c)| c).collect();
        for state in states {
            state.about_to_be_deleted();
        }
        self.inner.accessors.borrow_mut().clear();
        self.inner.provided.borrow_mut().clear();

        if let Some(parent) = self.inner.parent.and_then(|id| rt.view(id)) {
            parent.remove_child_view(self.inner.id);
        }
        rt.remove_view(self.inner.id);
        debug!(view = %self.inner.id, name = %self.inner.name, "view deleted");
        Ok(())
    }

    // -- state ---------------------------------------------------------------

    /// Declare a state cell owned by this view.
    pub fn declare_state(&self, name: &str, initial: impl Into<Value>) -> ObservedProperty {
        let cell = ObservedProperty::new(&self.inner.rt, initial, Some(self.inner.id), name);
        self.inner.states.borrow_mut().insert(Rc::from(name), cell.clone());
        self.install_accessor(name, FieldAccessor::for_cell(&cell));
        cell
    }

    /// Declare a one-way prop initialized from a plain value. The parent
    /// refreshes it through [`update`](View::update) params.
    pub fn declare_prop(&self, name: &str, initial: impl Into<Value>) -> OneWayProp {
        let prop = OneWayProp::from_value(&self.inner.rt, initial, Some(self.inner.id), name);
        self.register_prop(name, prop)
    }

    /// Declare a one-way prop bound directly to a parent's cell.
    pub fn declare_prop_from(&self, name: &str, source: &ObservedProperty) -> OneWayProp {
        let prop = OneWayProp::from_cell(&self.inner.rt, source, Some(self.inner.id), name);
        self.register_prop(name, prop)
    }

    fn register_prop(&self, name: &str, prop: OneWayProp) -> OneWayProp {
        self.inner.props.borrow_mut().insert(Rc::from(name), prop.clone());
        self.install_accessor(name, FieldAccessor::for_prop(&prop));
        prop
    }

    #[must_use]
    pub fn state(&self, name: &str) -> Option<ObservedProperty> {
        self.inner.states.borrow().get(name).cloned()
    }

    #[must_use]
    pub fn prop(&self, name: &str) -> Option<OneWayProp> {
        self.inner.props.borrow().get(name).cloned()
    }

    // -- field accessors -----------------------------------------------------

    /// Install (or replace) the accessor for a bound field.
    pub fn install_accessor(&self, name: &str, accessor: FieldAccessor) {
        self.inner.accessors.borrow_mut().insert(Rc::from(name), accessor);
    }

    fn accessor(&self, name: &str) -> Result<FieldAccessor> {
        self.inner
            .accessors
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| ReactiveError::UnknownField {
                view: self.inner.id,
                field: name.to_string(),
            })
    }

    /// Read a bound field through its accessor.
    pub fn get_field(&self, name: &str) -> Result<Value> {
        Ok(self.accessor(name)?.get())
    }

    /// Write a bound field through its accessor.
    pub fn set_field(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.accessor(name)?.set(value.into())
    }

    // -- provide / consume ---------------------------------------------------

    /// Make `cell` available to this view and its descendants under `key`.
    pub fn provide(&self, key: &str, cell: &ObservedProperty) {
        self.inner.provided.borrow_mut().insert(Rc::from(key), cell.clone());
    }

    /// Find the nearest view (this one, then ancestors) providing `key`.
    ///
    /// # Errors
    ///
    /// [`ReactiveError::ViewDisposed`] if an ancestor link is dangling,
    /// [`ReactiveError::MissingProvider`] if nobody provides `key`.
    pub fn consume(&self, key: &str) -> Result<ObservedProperty> {
        if let Some(cell) = self.inner.provided.borrow().get(key) {
            return Ok(cell.clone());
        }
        let mut next = self.inner.parent;
        while let Some(id) = next {
            let view = self.inner.rt.require_view(id)?;
            if let Some(cell) = view.inner.provided.borrow().get(key) {
                return Ok(cell.clone());
            }
            next = view.inner.parent;
        }
        Err(ReactiveError::MissingProvider {
            view: self.inner.id,
            key: key.to_string(),
        })
    }

    /// Consume `key` and install it as a two-way field named `name`.
    pub fn declare_consume(&self, name: &str, key: &str) -> Result<ObservedProperty> {
        let cell = self.consume(key)?;
        self.install_accessor(name, FieldAccessor::for_cell(&cell));
        Ok(cell)
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("parent", &self.inner.parent)
            .field("elements", &self.inner.elements.borrow().len())
            .field("dirty", &self.inner.dirty.borrow().len())
            .finish()
    }
}
