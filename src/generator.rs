//! Generators which build a [`Cfg`] with a particular topology.

pub mod dfs;

pub use dfs::*;

use crate::cfg::Cfg;
use crate::error::Result;

/// Interface to something that produces a complete CFG document.
///
/// A generator is used once: it owns the builder (and therefore the id
/// allocators) for a single generation run.
pub trait CfgGenerator {
    fn name(&self) -> &'static str;

    /// Build the document.
    fn generate_cfg(self) -> Result<Cfg>;
}
