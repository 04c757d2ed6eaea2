//! Pipeline construction and execution.
//!
//! [`builder`] turns user options into an immutable [`PipelineSpec`],
//! [`graph`] compiles a spec into the backend's node graph, and
//! [`executor`] runs one spec at a time against the active session.

pub mod builder;
pub mod executor;
pub mod graph;

pub use builder::{build, Attachment, BaseParams, BuilderVariant, ExtendedSpec, MinimalSpec, PipelineSpec};
pub use executor::{
    Artifact, Executor, ExecutorConfig, GenerationError, GenerationResult, ResultHistory,
};
pub use graph::{WorkflowGraph, WorkflowNode};
