//! Pipeline services

pub mod assembler;
pub mod dispatcher;
pub mod pipeline;
pub mod reconciler;
pub mod stats;

pub use assembler::{AssemblyResult, ConversationAssembler, SkipReason};
pub use dispatcher::Dispatcher;
pub use pipeline::PipelineService;
pub use reconciler::Reconciler;
pub use stats::PipelineStats;
