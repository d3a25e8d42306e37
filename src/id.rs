//! Identifiers for functions, code blocks, and code block bodies.

use serde::{Deserialize, Serialize};
use crate::error::*;

/// An opaque identifier for some entity in a [`Cfg`](crate::Cfg).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Id(u64);
impl Id {
    pub fn new(id: u64) -> Self { Self(id) }
    pub fn raw(&self) -> u64 { self.0 }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues strictly increasing identifiers.
///
/// Allocation takes `&mut self`, so an allocator is only ever used by one
/// generation pass at a time. Each [`CfgBuilder`](crate::CfgBuilder) owns
/// its own allocators; two documents built in the same process never share
/// counter state.
#[derive(Clone, Debug)]
pub struct IdAllocator {
    next: u64,
    step: u64,
}
impl IdAllocator {
    /// The first identifier issued by [`IdAllocator::new`].
    ///
    /// Zero is never handed out, so it can't be mistaken for a missing
    /// target in documents written by older tools.
    pub const BASE: u64 = 1;

    pub fn new() -> Self {
        Self::with_base(Self::BASE)
    }

    /// Create an allocator whose first identifier is `base`.
    pub fn with_base(base: u64) -> Self {
        Self { next: base, step: 1 }
    }

    /// Allocate a fresh identifier.
    pub fn next(&mut self) -> Result<Id> {
        let res = Id::new(self.next);
        self.next = self.next.checked_add(self.step)
            .ok_or(Error::AllocationExhausted)?;
        Ok(res)
    }

    /// Return the identifier that the next call to [`IdAllocator::next`]
    /// would produce.
    pub fn peek(&self) -> Id { Id::new(self.next) }
}

impl Default for IdAllocator {
    fn default() -> Self { Self::new() }
}
