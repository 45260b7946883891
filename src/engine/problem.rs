//! Problem contract, global fitness index and ranking.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::schema::ConvergenceConfig;

use super::error::ProblemError;
use super::fitness::{Fitness, FitnessError};
use super::genome::Genome;

/// Identifier of a batch: every genome scored under the same id is
/// evaluated against the same sample set.
pub type BatchId = u64;

/// Scores genomes for one concrete problem.
#[async_trait]
pub trait Problem<G: Genome>: Send + Sync + 'static {
    /// Score `genome` against the sample set identified by `batch_id`.
    /// Returns this sample's fitness only; see [`Problem::record`].
    async fn score(&self, genome: &Arc<G>, batch_id: BatchId) -> Result<Fitness, ProblemError>;

    /// Global fitness of `genome`, created on first access.
    fn fitness_for(&self, genome: &G) -> Arc<Fitness>;

    /// Merge a sample into the global fitness and return a snapshot of it.
    fn record(&self, genome: &G, sample: &Fitness) -> Fitness {
        let global = self.fitness_for(genome);
        global.merge(sample);
        global.snapshot()
    }

    /// Check the global fitness of `genome` against the convergence target.
    fn has_converged(
        &self,
        genome: &G,
        min_samples: usize,
        convergence: &ConvergenceConfig,
    ) -> Result<bool, FitnessError> {
        self.fitness_for(genome).has_converged(
            min_samples,
            convergence.target,
            convergence.tolerance,
        )
    }
}

/// Concurrent map from genome hash to its global fitness.
#[derive(Debug, Default)]
pub struct FitnessIndex {
    entries: RwLock<HashMap<String, Arc<Fitness>>>,
}

impl FitnessIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fitness for `hash`, inserting an empty one if missing.
    pub fn get_or_create(&self, hash: &str) -> Arc<Fitness> {
        if let Some(fitness) = self.entries.read().get(hash) {
            return Arc::clone(fitness);
        }
        Arc::clone(
            self.entries
                .write()
                .entry(hash.to_owned())
                .or_insert_with(|| Arc::new(Fitness::new())),
        )
    }

    /// Fitness for `hash` without creating it.
    pub fn get(&self, hash: &str) -> Option<Arc<Fitness>> {
        self.entries.read().get(hash).cloned()
    }

    /// Number of tracked genomes.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// A genome paired with a fitness snapshot.
#[derive(Debug)]
pub struct GenomeFitness<G> {
    pub genome: Arc<G>,
    pub fitness: Fitness,
}

impl<G> GenomeFitness<G> {
    /// Pair a genome with a fitness.
    pub fn new(genome: Arc<G>, fitness: Fitness) -> Self {
        Self { genome, fitness }
    }
}

impl<G> Clone for GenomeFitness<G> {
    fn clone(&self) -> Self {
        Self {
            genome: Arc::clone(&self.genome),
            fitness: self.fitness.clone(),
        }
    }
}

/// Ranking order, best first: higher fitness, then shorter hash, then lower
/// fitness id.
pub fn rank_cmp<G: Genome>(a: &GenomeFitness<G>, b: &GenomeFitness<G>) -> Ordering {
    if Arc::ptr_eq(&a.genome, &b.genome) && a.fitness.id() == b.fitness.id() {
        return Ordering::Equal;
    }
    b.fitness
        .compare(&a.fitness)
        .then_with(|| a.genome.hash().len().cmp(&b.genome.hash().len()))
        .then_with(|| a.fitness.id().cmp(&b.fitness.id()))
}

/// Rank a population by global fitness, best first.
///
/// Genomes that were never scored, or that have a `NaN` average, are dropped.
pub fn rank_population<G, P>(problem: &P, population: &[Arc<G>]) -> Vec<GenomeFitness<G>>
where
    G: Genome,
    P: Problem<G> + ?Sized,
{
    let mut ranked: Vec<GenomeFitness<G>> = population
        .par_iter()
        .map(|genome| {
            GenomeFitness::new(Arc::clone(genome), problem.fitness_for(genome).snapshot())
        })
        .filter(|entry| {
            let averages = entry.fitness.averages();
            !averages.is_empty() && averages.iter().all(|score| !score.is_nan())
        })
        .collect();
    ranked.par_sort_by(rank_cmp);
    ranked
}

/// Non-dominated subset of a ranked population.
///
/// An entry is dominated when another entry scores at least as well on every
/// objective and strictly better on one. Duplicate hashes are collapsed.
pub fn pareto_front<G: Genome>(ranked: &[GenomeFitness<G>]) -> Vec<GenomeFitness<G>> {
    let mut seen = HashSet::new();
    let candidates: Vec<(&GenomeFitness<G>, Vec<f64>)> = ranked
        .iter()
        .filter(|entry| seen.insert(entry.genome.hash()))
        .map(|entry| (entry, entry.fitness.averages()))
        .collect();

    candidates
        .iter()
        .filter(|(_, scores)| {
            !candidates
                .iter()
                .any(|(_, other)| dominates(other, scores))
        })
        .map(|(entry, _)| (*entry).clone())
        .collect()
}

fn dominates(a: &[f64], b: &[f64]) -> bool {
    if a.len() != b.len() || a.iter().any(|s| s.is_nan()) {
        return false;
    }
    let mut strictly_better = false;
    for (&x, &y) in a.iter().zip(b) {
        if y.is_nan() || x > y {
            strictly_better = true;
        } else if x < y {
            return false;
        }
    }
    strictly_better
}
