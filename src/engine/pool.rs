//! Pool/batch processor.
//!
//! Genomes are grouped into fixed-size batches, each scored against the
//! batch's shared sample set, and every completed batch is emitted as a
//! ranked array. Two modes:
//!
//! - [`PoolProcessor`] streams: batches roll over as they fill and are emitted
//!   in whatever order their scoring finishes.
//! - [`SingleBatch`] scores everything submitted under one id and resolves
//!   once, when submission closes.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt};
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use super::completion::{Completion, WriteOnce};
use super::error::PipelineError;
use super::fitness::Fitness;
use super::genome::Genome;
use super::problem::{BatchId, GenomeFitness, rank_cmp};

/// Asynchronous scoring delegate: score a genome under a batch id.
pub type ScoreFn<G> = Arc<
    dyn Fn(Arc<G>, BatchId) -> BoxFuture<'static, Result<Fitness, PipelineError>> + Send + Sync,
>;

/// Shared monotonic batch id source. Ids start at 1 and are never reused.
#[derive(Debug, Clone, Default)]
pub struct BatchIds {
    last: Arc<AtomicU64>,
}

impl BatchIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh id.
    pub fn next(&self) -> BatchId {
        self.last.fetch_add(1, AtomicOrdering::Relaxed) + 1
    }

    /// Most recently minted id, 0 if none.
    pub fn last(&self) -> BatchId {
        self.last.load(AtomicOrdering::Relaxed)
    }
}

/// A sealed batch, best member first.
#[derive(Debug)]
pub struct RankedBatch<G> {
    pub id: BatchId,
    pub members: Vec<GenomeFitness<G>>,
}

impl<G> RankedBatch<G> {
    /// Best member of the batch.
    pub fn leader(&self) -> Option<&GenomeFitness<G>> {
        self.members.first()
    }

    /// The best `n` members (fewer if the batch is smaller).
    pub fn top(&self, n: usize) -> &[GenomeFitness<G>] {
        &self.members[..n.min(self.members.len())]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl<G> Clone for RankedBatch<G> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            members: self.members.clone(),
        }
    }
}

/// Hashes admitted to one batch plus its members, kept sorted as scores land.
#[derive(Debug)]
struct BatchTracker<G> {
    hashes: HashSet<String>,
    ranked: Vec<GenomeFitness<G>>,
}

impl<G: Genome> BatchTracker<G> {
    fn with_capacity(pool_size: usize) -> Self {
        Self {
            hashes: HashSet::with_capacity(pool_size),
            ranked: Vec::with_capacity(pool_size),
        }
    }

    fn is_empty(&self) -> bool {
        self.hashes.is_empty() && self.ranked.is_empty()
    }

    fn insert(&mut self, entry: GenomeFitness<G>) {
        let at = self
            .ranked
            .partition_point(|existing| rank_cmp(existing, &entry) != Ordering::Greater);
        self.ranked.insert(at, entry);
    }
}

type SharedTracker<G> = Arc<Mutex<BatchTracker<G>>>;

/// Admission state. Lock order: registry first, then a batch tracker.
#[derive(Debug)]
struct BatchRegistry<G> {
    current: BatchId,
    live: HashMap<BatchId, SharedTracker<G>>,
    in_flight: HashSet<String>,
    free: Vec<SharedTracker<G>>,
}

/// State shared between the run loop, scoring tasks and the handle.
struct PoolState<G> {
    pool_size: usize,
    ids: BatchIds,
    registry: Mutex<BatchRegistry<G>>,
}

impl<G: Genome> PoolState<G> {
    /// Assign `genome` to the current batch, rolling over to a fresh id once
    /// the batch is full. `None` if the genome is invalid or already queued.
    fn admit(&self, genome: &Arc<G>) -> Option<(BatchId, SharedTracker<G>)> {
        let hash = genome.hash();
        if hash.is_empty() {
            warn!("Dropping genome with empty hash at pool admission");
            return None;
        }

        let mut registry = self.registry.lock();
        if registry.in_flight.contains(hash) {
            debug!("Genome {} already assigned to a live batch", hash);
            return None;
        }

        let id = registry.current;
        let tracker = match registry.live.get(&id) {
            Some(tracker) => Arc::clone(tracker),
            None => {
                let tracker = registry.free.pop().unwrap_or_else(|| {
                    Arc::new(Mutex::new(BatchTracker::with_capacity(self.pool_size)))
                });
                assert!(
                    tracker.lock().is_empty(),
                    "batch tracker reused while non-empty"
                );
                registry.live.insert(id, Arc::clone(&tracker));
                tracker
            }
        };

        let admitted = {
            let mut batch = tracker.lock();
            batch.hashes.insert(hash.to_owned());
            batch.hashes.len()
        };
        registry.in_flight.insert(hash.to_owned());
        if admitted >= self.pool_size {
            registry.current = self.ids.next();
        }
        Some((id, tracker))
    }

    /// Insert a scored member. Returns the ranked batch if this sealed it.
    fn record(
        &self,
        id: BatchId,
        tracker: &SharedTracker<G>,
        entry: GenomeFitness<G>,
    ) -> Option<RankedBatch<G>> {
        let members = {
            let mut batch = tracker.lock();
            batch.insert(entry);
            if batch.ranked.len() < self.pool_size {
                return None;
            }
            // The tracker keeps its buffer for the next batch.
            batch.ranked.drain(..).collect::<Vec<_>>()
        };

        let mut registry = self.registry.lock();
        if let Some(tracker) = registry.live.remove(&id) {
            let hashes: Vec<String> = tracker.lock().hashes.drain().collect();
            for hash in &hashes {
                registry.in_flight.remove(hash);
            }
            registry.free.push(tracker);
        }
        debug!("Batch {} sealed with {} genomes", id, members.len());
        Some(RankedBatch { id, members })
    }

    fn discard_partial(&self) {
        let registry = self.registry.lock();
        let partial = registry
            .live
            .values()
            .filter(|tracker| !tracker.lock().is_empty())
            .count();
        if partial > 0 {
            debug!("Discarding {} partial batches at completion", partial);
        }
    }
}

/// Sizing for a [`PoolProcessor`].
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Genomes per batch.
    pub pool_size: usize,
    /// Maximum concurrent scoring calls.
    pub max_parallelism: usize,
    /// Capacity of the ranked batch output.
    pub output_capacity: usize,
}

/// Streaming pool processor.
pub struct PoolProcessor<G: Genome> {
    state: Arc<PoolState<G>>,
    completion: Completion,
    status: Arc<WriteOnce<Result<(), PipelineError>>>,
}

impl<G: Genome> PoolProcessor<G> {
    /// Start consuming `input`. Must be called within a tokio runtime.
    ///
    /// The returned stream closes once the input closes and in-flight scoring
    /// drains, after [`PoolProcessor::complete`], or when a scoring call
    /// fails.
    pub fn spawn(
        options: PoolOptions,
        ids: BatchIds,
        score: ScoreFn<G>,
        input: mpsc::Receiver<Arc<G>>,
    ) -> (Self, mpsc::Receiver<RankedBatch<G>>) {
        let (output_tx, output_rx) = mpsc::channel(options.output_capacity.max(1));
        let state = Arc::new(PoolState {
            pool_size: options.pool_size.max(1),
            registry: Mutex::new(BatchRegistry {
                current: ids.next(),
                live: HashMap::new(),
                in_flight: HashSet::new(),
                free: Vec::new(),
            }),
            ids,
        });
        let completion = Completion::new();
        let status = Arc::new(WriteOnce::new());

        let worker = tokio::spawn(run(
            Arc::clone(&state),
            score,
            input,
            output_tx,
            options.max_parallelism.max(1),
            completion.clone(),
        ));
        {
            let status = Arc::clone(&status);
            let completion = completion.clone();
            tokio::spawn(async move {
                let result = match worker.await {
                    Ok(result) => result,
                    Err(err) => Err(err.into()),
                };
                completion.complete();
                status.set(result);
            });
        }

        (
            Self {
                state,
                completion,
                status,
            },
            output_rx,
        )
    }

    /// Stop accepting input and abort in-flight scoring. Idempotent.
    pub fn complete(&self) {
        self.completion.complete();
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_completed()
    }

    /// Wait for the processor to stop. Returns the fault, if any.
    pub async fn join(&self) -> Result<(), PipelineError> {
        self.status.wait().await.clone()
    }

    /// Batches admitted but not yet sealed.
    pub fn live_batches(&self) -> usize {
        self.state.registry.lock().live.len()
    }

    /// Recycled batch trackers awaiting reuse.
    pub fn free_trackers(&self) -> usize {
        self.state.registry.lock().free.len()
    }
}

async fn run<G: Genome>(
    state: Arc<PoolState<G>>,
    score: ScoreFn<G>,
    mut input: mpsc::Receiver<Arc<G>>,
    output: mpsc::Sender<RankedBatch<G>>,
    max_parallelism: usize,
    completion: Completion,
) -> Result<(), PipelineError> {
    let semaphore = Arc::new(Semaphore::new(max_parallelism));
    let mut tasks: JoinSet<Result<(), PipelineError>> = JoinSet::new();
    let mut permit = None;
    let mut open = true;

    loop {
        if !open && tasks.is_empty() {
            break;
        }

        tokio::select! {
            biased;
            _ = completion.completed() => {
                tasks.abort_all();
                break;
            }
            _ = output.closed() => {
                debug!("Pool output closed, halting");
                completion.complete();
                tasks.abort_all();
                break;
            }
            Some(joined) = tasks.join_next() => match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(err) if err.is_cancelled() => {}
                Err(err) => return Err(err.into()),
            },
            acquired = Arc::clone(&semaphore).acquire_owned(), if open && permit.is_none() => {
                permit = Some(acquired.map_err(|err| PipelineError::StageFailed(err.to_string()))?);
            }
            received = input.recv(), if open && permit.is_some() => match received {
                Some(genome) => {
                    let Some((id, tracker)) = state.admit(&genome) else {
                        continue;
                    };
                    let permit = permit.take();
                    let state = Arc::clone(&state);
                    let score = Arc::clone(&score);
                    let output = output.clone();
                    let completion = completion.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let fitness = score(Arc::clone(&genome), id).await?;
                        let entry = GenomeFitness::new(genome, fitness);
                        if let Some(batch) = state.record(id, &tracker, entry) {
                            // A closed receiver means downstream has completed.
                            if output.send(batch).await.is_err() {
                                completion.complete();
                            }
                        }
                        Ok(())
                    });
                }
                None => open = false,
            },
        }
    }

    state.discard_partial();
    Ok(())
}

/// Result of a [`SingleBatch`].
pub type BatchResult<G> = Result<Arc<RankedBatch<G>>, PipelineError>;

struct Submissions<G> {
    hashes: HashSet<String>,
    sender: Option<mpsc::UnboundedSender<Arc<G>>>,
}

/// Scores every submitted genome under one batch id and resolves once.
pub struct SingleBatch<G: Genome> {
    id: BatchId,
    limit: Option<usize>,
    submissions: Mutex<Submissions<G>>,
    result: Arc<WriteOnce<BatchResult<G>>>,
}

impl<G: Genome> SingleBatch<G> {
    /// Open a batch with a fresh id. With a `limit`, submission closes by
    /// itself after that many genomes are accepted.
    pub fn new(
        ids: &BatchIds,
        score: ScoreFn<G>,
        max_parallelism: usize,
        limit: Option<usize>,
    ) -> Self {
        let id = ids.next();
        let (tx, rx) = mpsc::unbounded_channel();
        let result = Arc::new(WriteOnce::new());
        tokio::spawn(collect(
            id,
            score,
            max_parallelism.max(1),
            rx,
            Arc::clone(&result),
        ));

        let batch = Self {
            id,
            limit,
            submissions: Mutex::new(Submissions {
                hashes: HashSet::new(),
                sender: Some(tx),
            }),
            result,
        };
        if limit == Some(0) {
            batch.complete();
        }
        batch
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Submit a genome. `false` if it is invalid, a duplicate, or the batch
    /// is closed.
    pub fn submit(&self, genome: Arc<G>) -> bool {
        if genome.hash().is_empty() {
            warn!("Dropping genome with empty hash from batch {}", self.id);
            return false;
        }

        let mut submissions = self.submissions.lock();
        let Some(sender) = submissions.sender.as_ref() else {
            return false;
        };
        if submissions.hashes.contains(genome.hash()) {
            debug!("Batch {} rejected duplicate {}", self.id, genome.hash());
            return false;
        }
        let hash = genome.hash().to_owned();
        if sender.send(genome).is_err() {
            return false;
        }
        submissions.hashes.insert(hash);
        if self.limit.is_some_and(|limit| submissions.hashes.len() >= limit) {
            submissions.sender = None;
        }
        true
    }

    /// Number of accepted genomes.
    pub fn accepted(&self) -> usize {
        self.submissions.lock().hashes.len()
    }

    /// Close submission. The result resolves once scoring drains.
    pub fn complete(&self) {
        self.submissions.lock().sender = None;
    }

    /// Wait for the ranked batch.
    pub async fn result(&self) -> BatchResult<G> {
        self.result.wait().await.clone()
    }
}

async fn collect<G: Genome>(
    id: BatchId,
    score: ScoreFn<G>,
    max_parallelism: usize,
    mut rx: mpsc::UnboundedReceiver<Arc<G>>,
    result: Arc<WriteOnce<BatchResult<G>>>,
) {
    let scored: Result<Vec<GenomeFitness<G>>, PipelineError> =
        futures::stream::poll_fn(|cx| rx.poll_recv(cx))
            .map(|genome| {
                let score = Arc::clone(&score);
                async move {
                    let fitness = score(Arc::clone(&genome), id).await?;
                    Ok::<_, PipelineError>(GenomeFitness::new(genome, fitness))
                }
            })
            .buffer_unordered(max_parallelism)
            .try_collect()
            .await;

    result.set(scored.map(|mut members| {
        members.sort_by(rank_cmp);
        debug!("Batch {} resolved with {} genomes", id, members.len());
        Arc::new(RankedBatch { id, members })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::ProblemError;
    use futures::FutureExt;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Scored {
        name: String,
        score: f64,
    }

    impl Genome for Scored {
        fn hash(&self) -> &str {
            &self.name
        }
    }

    fn scored(name: impl Into<String>, score: f64) -> Arc<Scored> {
        Arc::new(Scored {
            name: name.into(),
            score,
        })
    }

    fn table_score() -> ScoreFn<Scored> {
        Arc::new(|genome: Arc<Scored>, _id: BatchId| {
            async move {
                if genome.name.starts_with("bad") {
                    return Err(PipelineError::Scoring {
                        hash: genome.name.clone(),
                        source: ProblemError::new("unscorable"),
                    });
                }
                Ok(Fitness::from_scores(&[genome.score]))
            }
            .boxed()
        })
    }

    fn options(pool_size: usize) -> PoolOptions {
        PoolOptions {
            pool_size,
            max_parallelism: 4,
            output_capacity: 8,
        }
    }

    fn hashes(batch: &RankedBatch<Scored>) -> Vec<&str> {
        batch.members.iter().map(|m| m.genome.hash()).collect()
    }

    #[test]
    fn test_batch_ids_monotonic_and_shared() {
        let ids = BatchIds::new();
        let shared = ids.clone();
        assert_eq!(ids.next(), 1);
        assert_eq!(shared.next(), 2);
        assert_eq!(ids.last(), 2);
    }

    #[tokio::test]
    async fn test_streaming_sorted_nan_last_and_recycled() {
        let (tx, rx) = mpsc::channel(8);
        let (pool, mut out) = PoolProcessor::spawn(options(4), BatchIds::new(), table_score(), rx);

        for (name, score) in [("a", 0.9), ("b", 0.95), ("c", 0.2), ("d", f64::NAN)] {
            tx.send(scored(name, score)).await.unwrap();
        }
        let batch = out.recv().await.unwrap();
        assert_eq!(hashes(&batch), vec!["b", "a", "c", "d"]);
        assert_eq!(batch.leader().unwrap().genome.hash(), "b");
        assert_eq!(pool.live_batches(), 0);
        assert_eq!(pool.free_trackers(), 1);

        drop(tx);
        assert!(out.recv().await.is_none());
        assert_eq!(pool.join().await, Ok(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_streaming_batches_complete() {
        let (tx, rx) = mpsc::channel(4);
        let score: ScoreFn<Scored> = Arc::new(|genome: Arc<Scored>, _id: BatchId| {
            async move {
                let jitter = (genome.score * 7.0) as u64 % 3;
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                Ok::<_, PipelineError>(Fitness::from_scores(&[genome.score]))
            }
            .boxed()
        });
        let (pool, mut out) = PoolProcessor::spawn(options(5), BatchIds::new(), score, rx);

        tokio::spawn(async move {
            for i in 0..40 {
                tx.send(scored(format!("g{i}"), i as f64 / 40.0)).await.unwrap();
            }
        });

        let mut ids = HashSet::new();
        let mut seen = HashSet::new();
        while let Some(batch) = out.recv().await {
            assert_eq!(batch.len(), 5);
            assert!(ids.insert(batch.id), "batch {} emitted twice", batch.id);
            for pair in batch.members.windows(2) {
                assert_ne!(rank_cmp(&pair[0], &pair[1]), Ordering::Greater);
            }
            for member in &batch.members {
                assert!(member.fitness.sample_count() >= 1);
                assert!(seen.insert(member.genome.hash().to_owned()));
            }
        }
        assert_eq!(ids.len(), 8);
        assert_eq!(pool.join().await, Ok(()));
        assert_eq!(pool.live_batches(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_in_live_batch_rejected() {
        let (tx, rx) = mpsc::channel(8);
        let (_pool, mut out) = PoolProcessor::spawn(options(2), BatchIds::new(), table_score(), rx);

        for (name, score) in [("a", 0.1), ("a", 0.1), ("b", 0.2), ("", 0.3), ("c", 0.3)] {
            tx.send(scored(name, score)).await.unwrap();
        }
        drop(tx);

        let batch = out.recv().await.unwrap();
        assert_eq!(hashes(&batch), vec!["b", "a"]);
        // "c" is left in a partial batch and discarded.
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_scoring_error_faults_stage() {
        let (tx, rx) = mpsc::channel(8);
        let (pool, mut out) = PoolProcessor::spawn(options(2), BatchIds::new(), table_score(), rx);

        tx.send(scored("ok", 0.5)).await.unwrap();
        tx.send(scored("bad", 0.5)).await.unwrap();

        assert!(out.recv().await.is_none());
        match pool.join().await {
            Err(PipelineError::Scoring { hash, .. }) => assert_eq!(hash, "bad"),
            other => panic!("expected scoring fault, got {other:?}"),
        }
        assert!(pool.is_completed());
    }

    #[tokio::test]
    async fn test_complete_stops_open_input() {
        let (tx, rx) = mpsc::channel(8);
        let (pool, mut out) = PoolProcessor::spawn(options(4), BatchIds::new(), table_score(), rx);
        tx.send(scored("a", 0.5)).await.unwrap();

        pool.complete();
        assert_eq!(pool.join().await, Ok(()));
        assert!(out.recv().await.is_none());
        drop(tx);
    }

    #[tokio::test]
    async fn test_closed_output_completes_pool() {
        let (tx, rx) = mpsc::channel(8);
        let (pool, out) = PoolProcessor::spawn(options(2), BatchIds::new(), table_score(), rx);
        drop(out);

        let result = tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("pool stopped after its output closed");
        assert_eq!(result, Ok(()));
        assert!(pool.is_completed());
        assert!(tx.send(scored("late", 0.5)).await.is_err());
    }

    #[tokio::test]
    async fn test_sealed_batch_leaves_tracker_buffer() {
        let (tx, rx) = mpsc::channel(8);
        let (pool, mut out) = PoolProcessor::spawn(options(3), BatchIds::new(), table_score(), rx);
        for (name, score) in [("a", 0.1), ("b", 0.2), ("c", 0.3)] {
            tx.send(scored(name, score)).await.unwrap();
        }
        assert_eq!(out.recv().await.unwrap().len(), 3);

        let registry = pool.state.registry.lock();
        let tracker = registry.free[0].lock();
        assert!(tracker.is_empty());
        assert!(tracker.ranked.capacity() >= 3);
    }

    #[tokio::test]
    async fn test_single_batch_sorted_once() {
        let batch = SingleBatch::new(&BatchIds::new(), table_score(), 2, None);
        for (name, score) in [("a", 0.9), ("b", 0.95), ("c", 0.2), ("d", f64::NAN)] {
            assert!(batch.submit(scored(name, score)));
        }
        assert!(!batch.submit(scored("a", 0.9)));
        batch.complete();
        assert!(!batch.submit(scored("e", 0.1)));

        let first = batch.result().await.unwrap();
        let second = batch.result().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(hashes(&first), vec!["b", "a", "c", "d"]);
        assert_eq!(first.id, batch.id());
    }

    #[tokio::test]
    async fn test_single_batch_limit_auto_completes() {
        let batch = SingleBatch::new(&BatchIds::new(), table_score(), 2, Some(2));
        assert!(batch.submit(scored("a", 0.1)));
        assert!(batch.submit(scored("b", 0.2)));
        assert!(!batch.submit(scored("c", 0.3)));
        assert_eq!(batch.accepted(), 2);

        let result = batch.result().await.unwrap();
        assert_eq!(hashes(&result), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_single_batch_error_propagates() {
        let batch = SingleBatch::new(&BatchIds::new(), table_score(), 2, None);
        batch.submit(scored("bad-one", 0.1));
        batch.complete();
        assert!(matches!(
            batch.result().await,
            Err(PipelineError::Scoring { .. })
        ));
    }
}
