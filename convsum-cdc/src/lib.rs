//! convsum-cdc library interface
//!
//! The pipeline service: polls the source transcript table, assembles
//! conversations, dispatches them to the ML service over the outbound
//! queue and reconciles successful results from the inbound queue into
//! the summary store. Exposed as a library for integration testing.

pub mod db;
pub mod error;
pub mod queue;
pub mod services;

pub use crate::error::{PipelineError, PipelineResult};
