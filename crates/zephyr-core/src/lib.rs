//! Core domain types for Zephyr CI.
//!
//! Everything that is shared across the scheduler, store, VM layer and API
//! lives here: typed identifiers, the error taxonomy, pipeline definition
//! types, run/job/step models and the interpolation context.

pub mod error;
pub mod events;
pub mod ids;
pub mod interpolation;
pub mod pipeline;
pub mod run;

pub use error::{Error, Result};
