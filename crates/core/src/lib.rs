//! Domain types shared by every imagegen crate.
//!
//! Nothing in here performs I/O: option sets, resolution handling,
//! job status bookkeeping, per-model heuristic defaults and the small
//! hashing helper used to fingerprint pipeline specs.

pub mod error;
pub mod generation;
pub mod hashing;
pub mod model_defaults;
pub mod resolution;
pub mod types;
