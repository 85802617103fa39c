//! Pluggable key/value persistence for taskflow.
//!
//! Used by the workflow driver to persist results and task state. Two
//! backends ship here: [`FileStorage`] (pretty JSON files on disk) and
//! [`MemoryStorage`] (in-process map, handy in tests).

/// Storage trait and the file and memory backends.
pub mod store;

pub use store::{FileStorage, MemoryStorage, Storage};
