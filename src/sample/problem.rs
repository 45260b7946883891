//! Phrase matching problem.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;

use crate::engine::{BatchId, Fitness, FitnessIndex, Genome, Problem, ProblemError};

use super::genome::PhraseGenome;

/// Scores a phrase by how many genes match a target.
///
/// Two objectives: accuracy over a sample of positions drawn from the batch
/// id (every genome in a batch sees the same positions), and accuracy over
/// the whole phrase.
#[derive(Debug)]
pub struct PhraseProblem {
    target: Vec<u8>,
    sample_size: usize,
    index: FitnessIndex,
    evaluations: AtomicU64,
}

impl PhraseProblem {
    pub fn new(target: &str, sample_size: usize) -> Result<Self, ProblemError> {
        if target.is_empty() {
            return Err(ProblemError::new("target phrase must not be empty"));
        }
        Ok(Self {
            target: target.as_bytes().to_vec(),
            sample_size: sample_size.clamp(1, target.len()),
            index: FitnessIndex::new(),
            evaluations: AtomicU64::new(0),
        })
    }

    pub fn target(&self) -> &[u8] {
        &self.target
    }

    /// Number of `score` calls so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// Genomes with a recorded fitness.
    pub fn tracked(&self) -> usize {
        self.index.len()
    }
}

#[async_trait]
impl Problem<PhraseGenome> for PhraseProblem {
    async fn score(
        &self,
        genome: &Arc<PhraseGenome>,
        batch_id: BatchId,
    ) -> Result<Fitness, ProblemError> {
        let genes = genome.genes();
        if genes.len() != self.target.len() {
            return Err(ProblemError::new(format!(
                "genome length {} does not match target length {}",
                genes.len(),
                self.target.len()
            )));
        }
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let mut rng = StdRng::seed_from_u64(batch_id);
        let positions = index::sample(&mut rng, self.target.len(), self.sample_size);
        let sampled = positions
            .iter()
            .filter(|&i| genes[i] == self.target[i])
            .count();
        let matched = genes
            .iter()
            .zip(&self.target)
            .filter(|(a, b)| a == b)
            .count();

        Ok(Fitness::from_scores(&[
            sampled as f64 / self.sample_size as f64,
            matched as f64 / self.target.len() as f64,
        ]))
    }

    fn fitness_for(&self, genome: &PhraseGenome) -> Arc<Fitness> {
        self.index.get_or_create(genome.hash())
    }
}
