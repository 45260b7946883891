//! Configuration types for the evolution pipeline.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Smallest pool size that still allows ranking.
pub const MIN_POOL_SIZE: usize = 2;

/// Top-level environment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Number of genomes scored together in one batch.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Number of cascaded stages between the producer and the distributor.
    #[serde(default = "default_network_depth")]
    pub network_depth: usize,
    /// Genomes forwarded (or recycled) from each sealed batch.
    #[serde(default = "default_node_size")]
    pub node_size: usize,
    /// Capacity of the bounded channel feeding each stage.
    #[serde(default = "default_stage_buffer")]
    pub stage_buffer: usize,
    /// Capacity of the "Top Genome" broadcast channel.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Genome producer settings.
    #[serde(default)]
    pub producer: ProducerConfig,
    /// Scoring fan-out settings.
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Convergence criteria.
    #[serde(default)]
    pub convergence: ConvergenceConfig,
    /// Random seed for reproducible sample factories.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            network_depth: default_network_depth(),
            node_size: default_node_size(),
            stage_buffer: default_stage_buffer(),
            broadcast_capacity: default_broadcast_capacity(),
            producer: ProducerConfig::default(),
            scoring: ScoringConfig::default(),
            convergence: ConvergenceConfig::default(),
            random_seed: None,
        }
    }
}

fn default_pool_size() -> usize {
    8
}
fn default_network_depth() -> usize {
    3
}
fn default_node_size() -> usize {
    2
}
fn default_stage_buffer() -> usize {
    64
}
fn default_broadcast_capacity() -> usize {
    16
}

/// Genome producer buffering and scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Capacity of the merged output stream.
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,
    /// Capacity of the freshly generated lane.
    #[serde(default = "default_production_capacity")]
    pub production_capacity: usize,
    /// Capacity of the priority lane fed by `try_enqueue`.
    #[serde(default = "default_priority_capacity")]
    pub priority_capacity: usize,
    /// Consecutive unproductive generator pulls before yielding.
    #[serde(default = "default_attempts_per_quantum")]
    pub attempts_per_quantum: usize,
    /// Consecutive failed factory generations that end the generator.
    #[serde(default = "default_generation_misses")]
    pub generation_misses: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            output_capacity: default_output_capacity(),
            production_capacity: default_production_capacity(),
            priority_capacity: default_priority_capacity(),
            attempts_per_quantum: default_attempts_per_quantum(),
            generation_misses: default_generation_misses(),
        }
    }
}

fn default_output_capacity() -> usize {
    100
}
fn default_production_capacity() -> usize {
    100
}
fn default_priority_capacity() -> usize {
    1000
}
fn default_attempts_per_quantum() -> usize {
    20
}
fn default_generation_misses() -> usize {
    100
}

/// Scoring fan-out per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Maximum concurrent in-flight evaluations per stage.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
        }
    }
}

fn default_max_parallelism() -> usize {
    32
}

/// When a genome counts as converged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Samples every objective needs before convergence is trusted.
    #[serde(default = "default_threshold_samples")]
    pub threshold_samples: usize,
    /// Theoretical best average score. Exceeding it is a contract violation.
    #[serde(default = "default_target")]
    pub target: f64,
    /// Accepted distance below `target`.
    #[serde(default)]
    pub tolerance: f64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            threshold_samples: default_threshold_samples(),
            target: default_target(),
            tolerance: 0.0,
        }
    }
}

fn default_threshold_samples() -> usize {
    20
}
fn default_target() -> f64 {
    1.0
}

impl EnvironmentConfig {
    /// Load configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read(e.to_string()))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size < MIN_POOL_SIZE {
            return Err(ConfigError::PoolTooSmall(self.pool_size));
        }
        if self.network_depth == 0 {
            return Err(ConfigError::InvalidNetworkDepth);
        }
        if self.node_size == 0 || self.node_size > self.pool_size {
            return Err(ConfigError::InvalidNodeSize {
                node_size: self.node_size,
                pool_size: self.pool_size,
            });
        }

        let capacities = [
            ("stage_buffer", self.stage_buffer),
            ("broadcast_capacity", self.broadcast_capacity),
            ("producer.output_capacity", self.producer.output_capacity),
            ("producer.production_capacity", self.producer.production_capacity),
            ("producer.priority_capacity", self.producer.priority_capacity),
        ];
        for (name, capacity) in capacities {
            if capacity == 0 {
                return Err(ConfigError::ZeroCapacity(name));
            }
        }

        if self.producer.attempts_per_quantum == 0 || self.producer.generation_misses == 0 {
            return Err(ConfigError::InvalidProducerBudget);
        }
        if self.scoring.max_parallelism == 0 {
            return Err(ConfigError::InvalidParallelism);
        }
        if self.convergence.tolerance.is_nan() || self.convergence.tolerance < 0.0 {
            return Err(ConfigError::InvalidTolerance(self.convergence.tolerance));
        }
        if !self.convergence.target.is_finite() {
            return Err(ConfigError::InvalidTarget(self.convergence.target));
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Pool size {0} is below the minimum of 2")]
    PoolTooSmall(usize),
    #[error("Network depth must be non-zero")]
    InvalidNetworkDepth,
    #[error("Node size {node_size} must be between 1 and the pool size {pool_size}")]
    InvalidNodeSize { node_size: usize, pool_size: usize },
    #[error("Capacity `{0}` must be non-zero")]
    ZeroCapacity(&'static str),
    #[error("Producer attempt and miss budgets must be non-zero")]
    InvalidProducerBudget,
    #[error("Scoring parallelism must be non-zero")]
    InvalidParallelism,
    #[error("Convergence tolerance {0} must be non-negative")]
    InvalidTolerance(f64),
    #[error("Convergence target {0} must be finite")]
    InvalidTarget(f64),
    #[error("Failed to read config: {0}")]
    Read(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
}
