//! Schema module - Configuration types for the evolution pipeline.

mod config;

pub use config::*;
