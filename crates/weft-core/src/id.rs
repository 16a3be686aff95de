#![forbid(unsafe_code)]

//! Typed identifiers shared by the reactive core.
//!
//! Element and view ids come from one [`IdAllocator`] owned by the runtime so
//! that ids are allocated in document order. Object ids are process-wide
//! because values can move between runtimes.

use core::fmt;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Global counter for object identities.
static OBJECT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of an object value. Two [`ObjectRef`](crate::ObjectRef) handles are
/// the same object exactly when their ids are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    pub(crate) fn next() -> Self {
        Self(OBJECT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

macro_rules! runtime_id {
    ($(#[$attr:meta])* $name:ident, $prefix:literal) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw id.
            #[inline]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Get the raw ID value.
            #[inline]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

runtime_id!(
    /// Stable id of one declaratively created element's update closure.
    ElementId,
    "elmt:"
);
runtime_id!(
    /// Id of a component instance in the runtime's view arena.
    ViewId,
    "view:"
);
runtime_id!(
    /// Id of anything that can subscribe to an observable cell.
    SubscriberId,
    "sub:"
);

/// Monotonic id source. Never hands out zero.
#[derive(Debug)]
pub struct IdAllocator {
    next: Cell<u64>,
}

impl IdAllocator {
    /// Create an allocator whose first id is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self { next: Cell::new(1) }
    }

    /// Allocate the next raw id.
    pub fn allocate(&self) -> u64 {
        let id = self.next.get();
        self.next.set(id + 1);
        id
    }

    /// The id the next call to [`allocate`](Self::allocate) will return.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.next.get()
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
