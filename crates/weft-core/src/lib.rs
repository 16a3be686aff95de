#![forbid(unsafe_code)]

//! Core types for the weft reactive UI core.
//!
//! - [`Value`] / [`ObjectRef`]: dynamically typed application state with
//!   object identity.
//! - [`CopyMode`]: shallow or deep copy used by one-way props.
//! - [`ReactiveError`]: the error type shared by all weft crates.
//! - [`RuntimeConfig`]: options resolved once per runtime.
//! - Typed ids ([`ElementId`], [`ViewId`], [`SubscriberId`]).

pub mod config;
pub mod copy;
pub mod error;
pub mod id;
pub mod value;

pub use config::RuntimeConfig;
pub use copy::{CopyMode, deep_copy, shallow_copy};
pub use error::{ReactiveError, Result};
pub use id::{ElementId, IdAllocator, ObjectId, SubscriberId, ViewId};
pub use value::{ObjectData, ObjectKind, ObjectRef, Value};
