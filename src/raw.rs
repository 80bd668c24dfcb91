//! Bridge between safe wrappers and the raw handles of the request engine

use std::fmt;

/// Rust C bridge traits
pub mod traits {
    pub use super::AsRaw;
}

/// A rust type that can identify as a raw value understood by the request engine.
pub trait AsRaw {
    /// The raw handle type
    type Raw;
    /// The raw value
    fn as_raw(&self) -> Self::Raw;
}

impl<'a, T: 'a + AsRaw> AsRaw for &'a T {
    type Raw = <T as AsRaw>::Raw;
    fn as_raw(&self) -> Self::Raw {
        (*self).as_raw()
    }
}

/// A handle naming an entry of the request table of a [`Context`](crate::Context)
///
/// Handles are small, comparable values. A handle whose entry has been destroyed is stale: its
/// generation no longer matches the entry and the engine rejects it with `InvalidRequest`, even
/// after the slot has been reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl RequestHandle {
    /// The null request handle
    pub const NULL: RequestHandle = RequestHandle {
        index: u32::MAX,
        generation: 0,
    };

    /// Whether this is the null request handle
    pub fn is_null(&self) -> bool {
        *self == RequestHandle::NULL
    }
}

impl Default for RequestHandle {
    fn default() -> Self {
        RequestHandle::NULL
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "RequestHandle(NULL)")
        } else {
            write!(f, "RequestHandle({}#{})", self.index, self.generation)
        }
    }
}

impl AsRaw for RequestHandle {
    type Raw = RequestHandle;
    fn as_raw(&self) -> Self::Raw {
        *self
    }
}
