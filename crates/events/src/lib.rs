//! Typed event stream for generation collaborators.
//!
//! The executor publishes [`GenerationEvent`]s on an [`EventBus`];
//! subscribers only observe and never feed state back to the executor.

pub mod bus;

pub use bus::{EventBus, EventStream, GenerationEvent};
