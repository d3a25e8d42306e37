//! Synthesis of instruction pointer chasing benchmarks.
//!
//! A generator (see [`generator`]) builds a [`Cfg`] describing functions,
//! code blocks, and their terminator branches. The [`codegen`] module lowers
//! a finished document into C source whose compiled branches match the
//! types recorded in the CFG.

pub mod error;
pub mod id;
pub mod branch;
pub mod cfg;
pub mod builder;
pub mod generator;
pub mod interchange;
pub mod codegen;
pub mod log;

pub use error::*;
pub use id::*;
pub use branch::*;
pub use cfg::*;
pub use builder::*;
pub use generator::*;
pub use interchange::*;
pub use codegen::{SourceConfig, SourceFile, SourceGenerator};
