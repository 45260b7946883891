//! Sample module - A reference problem for the pipeline: evolve a string
//! until it matches a target phrase.

mod genome;
mod problem;

pub use genome::*;
pub use problem::*;
