#![forbid(unsafe_code)]

//! Error type for the reactive core.
//!
//! Every variant is either a framework invariant violation or a failure the
//! caller must decide about. Expected states (a monitored path that does not
//! currently resolve) are values, not errors.

use thiserror::Error;

use crate::id::{ElementId, SubscriberId, ViewId};

/// Errors surfaced by the reactive core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReactiveError {
    /// A single-value notification API was called on a cell that only
    /// supports the batched per-element path.
    #[error("legacy notification called on partial-update property '{name}'")]
    LegacyNotification { name: String },

    /// A back-link points at a view that has already been torn down.
    #[error("{view} has been disposed but is still referenced")]
    ViewDisposed { view: ViewId },

    /// An element id was looked up that is not registered with the view.
    #[error("{elmt_id} is not registered with {view}")]
    UnknownElement { view: ViewId, elmt_id: ElementId },

    /// A field name has no accessor installed on the view.
    #[error("{view} has no field '{field}'")]
    UnknownField { view: ViewId, field: String },

    /// No view up the parent chain provides the requested key.
    #[error("no ancestor of {view} provides '{key}'")]
    MissingProvider { view: ViewId, key: String },

    /// Synthesizing a list key for a `ForEach` item failed.
    #[error("ForEach {elmt_id}: cannot generate item id: {reason}")]
    IdGeneration { elmt_id: ElementId, reason: String },

    /// A subscriber link is in a state the runtime cannot continue from.
    #[error("{subscriber} is inconsistent: {reason}")]
    InconsistentSubscriber {
        subscriber: SubscriberId,
        reason: String,
    },

    /// An update closure reported a failure.
    #[error("update of {elmt_id} failed: {message}")]
    Render { elmt_id: ElementId, message: String },

    /// A change cascade did not settle.
    #[error("change propagation did not settle after {rounds} rounds")]
    FlushLimit { rounds: u32 },

    /// Invalid runtime configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ReactiveError {
    /// Convenience constructor for failures raised inside update closures.
    pub fn render(elmt_id: ElementId, message: impl Into<String>) -> Self {
        Self::Render {
            elmt_id,
            message: message.into(),
        }
    }
}

/// Result alias used across the weft crates.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;
