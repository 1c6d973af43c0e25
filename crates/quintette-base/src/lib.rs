//! Shared leaf types for the quintette proxy.
//!
//! Everything here is dependency-light and used by every other crate in
//! the workspace: the textual result model (`Value`, `Field`,
//! `QueryResult`), named counters for introspection, and the atomic
//! meta-file helpers backing every on-disk catalog.

pub mod file;
pub mod result;
pub mod stats;

pub use result::{Field, QueryResult, Value};
pub use stats::Counters;
