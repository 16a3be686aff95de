#![forbid(unsafe_code)]

//! Reactive runtime for weft.
//!
//! - [`Runtime`]: per-application context owning ids, the view arena, and the
//!   dependency tracker.
//! - [`ObservedProperty`]: observable cell with per-element dependency
//!   tracking.
//! - [`OneWayProp`]: parent → child copy-in binding.
//! - [`ObserveEngine`]: target/property → dependent registry.
//! - [`Monitor`] and [`Computed`]: path watchers and derived values.
//! - [`View`]: element registration, ordered update passes, `ForEach`
//!   diffing, and `If` branch switching.
//! - [`AttributeModifier`]: diffing front end for the native attribute sink.
//!
//! # Architecture
//!
//! Everything is single-threaded (`Rc`/`RefCell`). Handles are cheap clones
//! of shared state. Views live in the runtime's arena and are referred to by
//! [`ViewId`](weft_core::ViewId) everywhere else; subscribers and reactions
//! are indexed weakly and owned by their handles.
//!
//! A state change marks the element ids that read it dirty and queues any
//! computed values and monitors. The runtime flushes once the outermost batch
//! ends: reactions first, then each dirty view re-runs its dirty closures in
//! ascending element id order.

pub mod accessor;
pub mod attribute;
pub mod batch;
pub mod branch;
pub mod cell;
pub mod computed;
pub mod foreach;
pub mod monitor;
pub mod observe;
pub mod prop;
pub mod runtime;
pub mod view;

pub use accessor::FieldAccessor;
pub use attribute::{AttributeModifier, AttributeSink, NodeHandle};
pub use batch::BatchScope;
pub use cell::{ObservedProperty, Subscription};
pub use computed::Computed;
pub use foreach::{default_item_key, new_item_indices};
pub use monitor::{Monitor, MonitorChange};
pub use observe::{BindGuard, Dependent, ObserveEngine, Target, VALUE_PROP};
pub use prop::{OneWayProp, PropSource};
pub use runtime::{PeerSubscriber, RenderFrame, Runtime};
pub use view::{UpdateFn, View};
