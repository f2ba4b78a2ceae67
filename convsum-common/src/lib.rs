//! convsum-common - Shared types for the conversation summary pipeline
//!
//! Holds the pieces both pipeline loops agree on: the error type,
//! configuration loading, the wire/data model, sentiment mapping and
//! text normalization helpers.

pub mod config;
pub mod error;
pub mod models;
pub mod sentiment;
pub mod text;

pub use error::{Error, Result};
