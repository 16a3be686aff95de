#![forbid(unsafe_code)]

//! weft public facade.
//!
//! Re-exports the core value model and, with the default `runtime` feature,
//! the reactive runtime. Most applications only need the [`prelude`].

#[cfg(feature = "runtime")]
pub use weft_runtime as runtime;

pub use weft_core::{
    CopyMode, ElementId, ObjectRef, ReactiveError, Result, RuntimeConfig, Value, ViewId,
};

#[cfg(feature = "runtime")]
pub use weft_runtime::{
    AttributeModifier, AttributeSink, BatchScope, Computed, Monitor, MonitorChange, NodeHandle,
    ObservedProperty, OneWayProp, Runtime, View,
};

/// Common imports for application code.
pub mod prelude {
    pub use weft_core::{CopyMode, ElementId, ObjectRef, ReactiveError, Result, RuntimeConfig, Value};

    #[cfg(feature = "runtime")]
    pub use weft_runtime::{
        AttributeModifier, AttributeSink, BatchScope, Computed, FieldAccessor, Monitor,
        MonitorChange, NodeHandle, ObservedProperty, OneWayProp, Runtime, View,
    };
}
