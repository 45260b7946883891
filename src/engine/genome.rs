//! Genome and factory contracts consumed by the pipeline.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// A candidate solution.
///
/// Identity is the structural hash. Once a genome is shared (wrapped in an
/// `Arc` and handed to the pipeline) it is never mutated again.
pub trait Genome: Clone + Send + Sync + 'static {
    /// Deterministic serialization of the genome's structure.
    fn hash(&self) -> &str;
}

/// Lazily computed hash, invalidated by structural mutation.
#[derive(Debug, Clone, Default)]
pub struct HashCell {
    value: OnceLock<String>,
}

impl HashCell {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached hash, computing it with `serialize` on first access.
    pub fn get_or_compute(&self, serialize: impl FnOnce() -> String) -> &str {
        self.value.get_or_init(serialize)
    }

    /// Drop the cached hash. Call from every mutating operation.
    pub fn invalidate(&mut self) {
        self.value.take();
    }

    /// Check if the hash is currently cached.
    pub fn is_computed(&self) -> bool {
        self.value.get().is_some()
    }
}

/// Creates new genomes and offspring.
pub trait GenomeFactory<G: Genome>: Send + Sync + 'static {
    /// Generate a genome. With no parents a fresh random genome is expected;
    /// with parents, an offspring. `None` means nothing could be produced.
    fn generate(&self, parents: &[Arc<G>]) -> Option<G>;

    /// Produce a variant of `source` with `mutations` structural changes.
    fn mutate(&self, source: &G, mutations: u32) -> Option<G>;

    /// Recency cache of produced genomes.
    fn cache(&self) -> &Arc<GenomeCache<G>>;

    /// Offspring bred from a batch leader: one generated child and one
    /// single-mutation variant.
    fn breed(&self, parent: &Arc<G>) -> Vec<G> {
        let mut offspring = Vec::with_capacity(2);
        if let Some(child) = self.generate(std::slice::from_ref(parent)) {
            offspring.push(child);
        }
        if let Some(variant) = self.mutate(parent, 1) {
            offspring.push(variant);
        }
        offspring
    }
}

/// Default cap for [`GenomeCache`].
pub const DEFAULT_MAX_GENOME_TRACKING: usize = 10_000;

/// Bounded recency cache of previously produced genomes, keyed by hash.
#[derive(Debug)]
pub struct GenomeCache<G> {
    max_tracking: AtomicUsize,
    entries: Mutex<CacheEntries<G>>,
    trimming: AtomicBool,
}

#[derive(Debug)]
struct CacheEntries<G> {
    by_hash: HashMap<String, Arc<G>>,
    order: VecDeque<String>,
}

impl<G: Genome> GenomeCache<G> {
    /// Create a cache keeping at most `max_tracking` genomes after a trim.
    pub fn new(max_tracking: usize) -> Self {
        Self {
            max_tracking: AtomicUsize::new(max_tracking),
            entries: Mutex::new(CacheEntries {
                by_hash: HashMap::new(),
                order: VecDeque::new(),
            }),
            trimming: AtomicBool::new(false),
        }
    }

    /// Record a genome. Returns `false` if its hash is already cached.
    pub fn add(&self, genome: Arc<G>) -> bool {
        let hash = genome.hash().to_owned();
        let mut entries = self.entries.lock();
        if entries.by_hash.contains_key(&hash) {
            return false;
        }
        entries.order.push_back(hash.clone());
        entries.by_hash.insert(hash, genome);
        true
    }

    /// Previously produced genome with the given hash.
    pub fn get(&self, hash: &str) -> Option<Arc<G>> {
        self.entries.lock().by_hash.get(hash).cloned()
    }

    /// Cached hashes, oldest first.
    pub fn previous_hashes(&self) -> Vec<String> {
        self.entries.lock().order.iter().cloned().collect()
    }

    /// Number of cached genomes.
    pub fn len(&self) -> usize {
        self.entries.lock().order.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current tracking cap.
    pub fn max_tracking(&self) -> usize {
        self.max_tracking.load(Ordering::Relaxed)
    }

    /// Change the tracking cap. Takes effect on the next trim.
    pub fn set_max_tracking(&self, max_tracking: usize) {
        self.max_tracking.store(max_tracking, Ordering::Relaxed);
    }

    /// Evict the oldest entries beyond the cap. Returns how many were evicted.
    pub fn trim(&self) -> usize {
        let max = self.max_tracking();
        let mut evicted = 0;
        let mut entries = self.entries.lock();
        while entries.order.len() > max {
            let Some(hash) = entries.order.pop_front() else {
                break;
            };
            entries.by_hash.remove(&hash);
            evicted += 1;
        }
        evicted
    }

    /// Trim on the blocking pool. At most one trim runs at a time; returns
    /// `None` if one is already in progress.
    pub fn trim_in_background(self: &Arc<Self>) -> Option<JoinHandle<usize>> {
        if self
            .trimming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let cache = Arc::clone(self);
        Some(tokio::task::spawn_blocking(move || {
            let evicted = cache.trim();
            cache.trimming.store(false, Ordering::Release);
            if evicted > 0 {
                log::debug!("Trimmed {} genomes from factory cache", evicted);
            }
            evicted
        }))
    }
}

impl<G: Genome> Default for GenomeCache<G> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_GENOME_TRACKING)
    }
}

/// Lazy, potentially endless sequence of freshly generated genomes.
///
/// Ends once the factory fails to generate `max_misses` times in a row.
pub struct Generator<G, F> {
    factory: Arc<F>,
    max_misses: usize,
    exhausted: bool,
    _genome: PhantomData<fn() -> G>,
}

impl<G: Genome, F: GenomeFactory<G>> Generator<G, F> {
    /// Create a generator over `factory`.
    pub fn new(factory: Arc<F>, max_misses: usize) -> Self {
        Self {
            factory,
            max_misses: max_misses.max(1),
            exhausted: false,
            _genome: PhantomData,
        }
    }
}

impl<G: Genome, F: GenomeFactory<G>> Iterator for Generator<G, F> {
    type Item = G;

    fn next(&mut self) -> Option<G> {
        if self.exhausted {
            return None;
        }
        for _ in 0..self.max_misses {
            if let Some(genome) = self.factory.generate(&[]) {
                return Some(genome);
            }
        }
        self.exhausted = true;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Label(String);

    impl Genome for Label {
        fn hash(&self) -> &str {
            &self.0
        }
    }

    struct Countdown {
        remaining: Mutex<usize>,
        cache: Arc<GenomeCache<Label>>,
    }

    impl GenomeFactory<Label> for Countdown {
        fn generate(&self, parents: &[Arc<Label>]) -> Option<Label> {
            if let Some(parent) = parents.first() {
                return Some(Label(format!("{}+", parent.0)));
            }
            let mut remaining = self.remaining.lock();
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
            Some(Label(format!("g{}", *remaining)))
        }

        fn mutate(&self, source: &Label, mutations: u32) -> Option<Label> {
            Some(Label(format!("{}~{}", source.0, mutations)))
        }

        fn cache(&self) -> &Arc<GenomeCache<Label>> {
            &self.cache
        }
    }

    fn countdown(n: usize) -> Arc<Countdown> {
        Arc::new(Countdown {
            remaining: Mutex::new(n),
            cache: Arc::new(GenomeCache::default()),
        })
    }

    #[test]
    fn test_hash_cell_invalidate() {
        let mut cell = HashCell::new();
        assert!(!cell.is_computed());
        assert_eq!(cell.get_or_compute(|| "ab".to_string()), "ab");
        assert_eq!(cell.get_or_compute(|| "zz".to_string()), "ab");

        cell.invalidate();
        assert!(!cell.is_computed());
        assert_eq!(cell.get_or_compute(|| "zz".to_string()), "zz");
    }

    #[test]
    fn test_breed_yields_child_and_variant() {
        let factory = countdown(0);
        let parent = Arc::new(Label("p".to_string()));
        let offspring = factory.breed(&parent);
        let hashes: Vec<&str> = offspring.iter().map(Genome::hash).collect();
        assert_eq!(hashes, vec!["p+", "p~1"]);
    }

    #[test]
    fn test_generator_ends_after_misses() {
        let factory = countdown(3);
        let generated: Vec<String> = Generator::new(factory, 5).map(|g| g.0).collect();
        assert_eq!(generated, vec!["g2", "g1", "g0"]);
    }

    #[test]
    fn test_cache_add_and_trim() {
        let cache = GenomeCache::new(2);
        assert!(cache.add(Arc::new(Label("a".into()))));
        assert!(!cache.add(Arc::new(Label("a".into()))));
        cache.add(Arc::new(Label("b".into())));
        cache.add(Arc::new(Label("c".into())));
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.trim(), 1);
        assert_eq!(cache.previous_hashes(), vec!["b", "c"]);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }

    #[tokio::test]
    async fn test_trim_in_background_single_flight() {
        let cache: Arc<GenomeCache<Label>> = Arc::new(GenomeCache::new(1));
        for i in 0..5 {
            cache.add(Arc::new(Label(format!("g{i}"))));
        }
        let first = cache.trim_in_background().expect("first trim starts");
        let second = cache.trim_in_background();
        let evicted = first.await.unwrap() + match second {
            Some(handle) => handle.await.unwrap(),
            None => 0,
        };
        assert_eq!(evicted, 4);
        assert_eq!(cache.len(), 1);
    }
}
