//! Phrase genomes and their factory.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Poisson};

use crate::engine::{Genome, GenomeCache, GenomeFactory, HashCell};

/// Default alphabet: lowercase ASCII letters and space.
pub const DEFAULT_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz ";

/// A fixed-length string of genes.
#[derive(Debug, Clone)]
pub struct PhraseGenome {
    genes: Vec<u8>,
    hash: HashCell,
}

impl PhraseGenome {
    pub fn new(genes: impl Into<Vec<u8>>) -> Self {
        Self {
            genes: genes.into(),
            hash: HashCell::new(),
        }
    }

    pub fn genes(&self) -> &[u8] {
        &self.genes
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    /// Replace one gene.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set_gene(&mut self, index: usize, gene: u8) {
        self.genes[index] = gene;
        self.hash.invalidate();
    }
}

impl Genome for PhraseGenome {
    fn hash(&self) -> &str {
        self.hash
            .get_or_compute(|| String::from_utf8_lossy(&self.genes).into_owned())
    }
}

/// Random generation, point mutation and uniform crossover over an alphabet.
pub struct PhraseFactory {
    alphabet: Vec<u8>,
    length: usize,
    mutation_rate: f64,
    rng: Mutex<StdRng>,
    cache: Arc<GenomeCache<PhraseGenome>>,
}

impl PhraseFactory {
    /// Create a factory for genomes of `length` genes drawn from `alphabet`.
    /// A `seed` makes generation reproducible.
    pub fn new(alphabet: &str, length: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut alphabet: Vec<u8> = alphabet.bytes().collect();
        alphabet.sort_unstable();
        alphabet.dedup();

        Self {
            alphabet,
            length,
            mutation_rate: 0.5,
            rng: Mutex::new(rng),
            cache: Arc::new(GenomeCache::default()),
        }
    }

    /// Mean number of extra point mutations when breeding from one parent.
    pub fn with_mutation_rate(mut self, mutation_rate: f64) -> Self {
        self.mutation_rate = mutation_rate.max(0.0);
        self
    }

    pub fn alphabet(&self) -> &[u8] {
        &self.alphabet
    }

    pub fn length(&self) -> usize {
        self.length
    }

    fn random(&self, rng: &mut StdRng) -> Option<PhraseGenome> {
        if self.alphabet.is_empty() || self.length == 0 {
            return None;
        }
        let genes = (0..self.length)
            .map(|_| self.alphabet[rng.gen_range(0..self.alphabet.len())])
            .collect::<Vec<u8>>();
        Some(PhraseGenome::new(genes))
    }

    fn point_mutations(
        &self,
        rng: &mut StdRng,
        source: &PhraseGenome,
        mutations: u32,
    ) -> Option<PhraseGenome> {
        if source.is_empty() || self.alphabet.len() < 2 {
            return None;
        }
        let mut genome = source.clone();
        for _ in 0..mutations {
            let index = rng.gen_range(0..genome.len());
            let current = genome.genes[index];
            let replacement = self
                .alphabet
                .iter()
                .copied()
                .filter(|&gene| gene != current)
                .collect::<Vec<u8>>()
                .choose(rng)
                .copied()?;
            genome.set_gene(index, replacement);
        }
        Some(genome)
    }

    fn crossover(
        &self,
        rng: &mut StdRng,
        a: &PhraseGenome,
        b: &PhraseGenome,
    ) -> Option<PhraseGenome> {
        if a.len() != b.len() || a.is_empty() {
            return None;
        }
        let genes = a
            .genes
            .iter()
            .zip(&b.genes)
            .map(|(&x, &y)| if rng.gen_bool(0.5) { x } else { y })
            .collect::<Vec<u8>>();
        Some(PhraseGenome::new(genes))
    }
}

impl GenomeFactory<PhraseGenome> for PhraseFactory {
    fn generate(&self, parents: &[Arc<PhraseGenome>]) -> Option<PhraseGenome> {
        let genome = {
            let mut rng = self.rng.lock();
            match parents {
                [] => self.random(&mut rng)?,
                [parent] => {
                    let extra = match Poisson::new(self.mutation_rate) {
                        Ok(poisson) => poisson.sample(&mut *rng) as u32,
                        Err(_) => 0,
                    };
                    self.point_mutations(&mut rng, parent, 1 + extra)?
                }
                [a, b, ..] => self.crossover(&mut rng, a, b)?,
            }
        };
        self.cache.add(Arc::new(genome.clone()));
        Some(genome)
    }

    fn mutate(&self, source: &PhraseGenome, mutations: u32) -> Option<PhraseGenome> {
        let genome = self.point_mutations(&mut self.rng.lock(), source, mutations)?;
        self.cache.add(Arc::new(genome.clone()));
        Some(genome)
    }

    fn cache(&self) -> &Arc<GenomeCache<PhraseGenome>> {
        &self.cache
    }
}
