//! Test infrastructure for the merge engine.
//!
//! Resource fixtures with builder methods, engine constructors, and store
//! wrappers that inject faults or races.

#![allow(dead_code)]

pub mod fixtures;
pub mod harness;

pub use fixtures::*;
pub use harness::*;
