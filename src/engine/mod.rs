//! Engine module - the concurrent evolution pipeline.
//!
//! This module contains:
//! - Fitness aggregation and ranking
//! - Genome, factory and problem contracts
//! - The deduplicating genome producer
//! - Pool/batch processing and pipeline stages
//! - The environment orchestrator

mod completion;
mod environment;
mod error;
mod fitness;
mod genome;
mod pipeline;
mod pool;
mod problem;
mod producer;

pub use completion::*;
pub use environment::*;
pub use error::*;
pub use fitness::*;
pub use genome::*;
pub use pipeline::*;
pub use pool::*;
pub use problem::*;
pub use producer::*;
