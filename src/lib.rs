//! Genepool - Asynchronous tournament pipeline for evolving genomes.
//!
//! Candidate genomes flow from a deduplicating producer through a cascade of
//! batch-scoring stages into a self-recycling distributor. Batch leaders are
//! bred back into the producer, and a convergence check halts the whole
//! pipeline exactly once.
//!
//! # Architecture
//!
//! The crate is split into three modules:
//!
//! - `schema`: Configuration types
//! - `engine`: Fitness, contracts, producer, pools, pipeline and environment
//! - `sample`: A reference phrase matching problem
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use genepool::{
//!     engine::Environment,
//!     sample::{PhraseFactory, PhraseProblem, DEFAULT_ALPHABET},
//!     schema::EnvironmentConfig,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let target = "hello world";
//! let factory = Arc::new(PhraseFactory::new(DEFAULT_ALPHABET, target.len(), None));
//! let problem = Arc::new(PhraseProblem::new(target, 4)?);
//!
//! let env = Environment::start(factory, problem, EnvironmentConfig::default())?;
//! if let Some(winner) = env.outcome().await.winner() {
//!     println!("Converged on {:?}", winner.genome.genes());
//! }
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod sample;
pub mod schema;

// Re-export commonly used types
pub use engine::{
    Environment, Fitness, Genome, GenomeFactory, GenomeFitness, GenomeProducer, Outcome,
    PipelineError, PoolProcessor, Problem, ProblemError, SingleBatch,
};
pub use schema::{ConfigError, EnvironmentConfig};
