//! Deduplicating, backpressured genome producer.
//!
//! Two lanes feed one bounded output stream:
//!
//! - the **production lane**, filled by a driver task pulling from a lazy
//!   generator;
//! - the **priority lane**, filled by [`GenomeProducer::try_enqueue`] (bred
//!   offspring fed back from the pipeline).
//!
//! A merger task forwards both lanes to the output, always preferring the
//! priority lane. Every hash is reserved in a registry before it enters a
//! lane, so no hash is ever emitted twice.

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::schema::ProducerConfig;

use super::completion::Completion;
use super::genome::Genome;

/// Hashes reserved by the producer plus the priority lane entrance.
struct Registry<G> {
    hashes: HashSet<String>,
    priority: Option<mpsc::Sender<Arc<G>>>,
}

/// Handle to a running producer.
pub struct GenomeProducer<G: Genome> {
    registry: Arc<Mutex<Registry<G>>>,
    completion: Completion,
}

impl<G: Genome> GenomeProducer<G> {
    /// Start producing from `source`. Must be called within a tokio runtime.
    ///
    /// Returns the handle and the merged output stream. The stream ends once
    /// the source is exhausted and both lanes are drained, or after
    /// [`GenomeProducer::complete`].
    pub fn spawn<I>(source: I, config: &ProducerConfig) -> (Self, mpsc::Receiver<Arc<G>>)
    where
        I: IntoIterator<Item = G>,
        I::IntoIter: Send + 'static,
    {
        let (output_tx, output_rx) = mpsc::channel(config.output_capacity);
        let (production_tx, production_rx) = mpsc::channel(config.production_capacity);
        let (priority_tx, priority_rx) = mpsc::channel(config.priority_capacity);

        let registry = Arc::new(Mutex::new(Registry {
            hashes: HashSet::new(),
            priority: Some(priority_tx),
        }));
        let completion = Completion::new();

        tokio::spawn(drive(
            source.into_iter(),
            Arc::clone(&registry),
            production_tx,
            config.attempts_per_quantum.max(1),
            completion.clone(),
        ));
        tokio::spawn(merge(
            priority_rx,
            production_rx,
            output_tx,
            Arc::clone(&registry),
            completion.clone(),
        ));

        (
            Self {
                registry,
                completion,
            },
            output_rx,
        )
    }

    /// Reserve the genome's hash and post it to the priority lane.
    ///
    /// Returns `false` if the hash was already reserved, the priority lane is
    /// full, or the producer has completed. This is flow control, not an
    /// error: the caller may retry later.
    pub fn try_enqueue(&self, genome: G) -> bool {
        let hash = genome.hash().to_owned();
        let mut registry = self.registry.lock();
        if registry.hashes.contains(&hash) {
            return false;
        }
        let Some(lane) = registry.priority.as_ref() else {
            return false;
        };
        if lane.try_send(Arc::new(genome)).is_err() {
            return false;
        }
        registry.hashes.insert(hash)
    }

    /// Check if a hash has been reserved.
    pub fn contains(&self, hash: &str) -> bool {
        self.registry.lock().hashes.contains(hash)
    }

    /// Number of reserved hashes.
    pub fn registered(&self) -> usize {
        self.registry.lock().hashes.len()
    }

    /// Stop producing and complete the output stream. Idempotent.
    pub fn complete(&self) {
        if self.completion.complete() {
            self.registry.lock().priority = None;
        }
    }

    /// Check if the producer has completed.
    pub fn is_completed(&self) -> bool {
        self.completion.is_completed()
    }

    /// Wait until the producer has completed.
    pub async fn completed(&self) {
        self.completion.completed().await
    }
}

/// Reserve `hash`. Returns `false` if another owner already holds it.
fn reserve<G>(registry: &Mutex<Registry<G>>, hash: &str) -> bool {
    let mut registry = registry.lock();
    if registry.hashes.contains(hash) {
        return false;
    }
    registry.hashes.insert(hash.to_owned())
}

/// Driver loop: pull from the generator into the production lane.
///
/// After `attempts_per_quantum` consecutive pulls that produced nothing new
/// the task yields, so a generator full of duplicates cannot monopolize a
/// worker thread.
async fn drive<G, I>(
    mut source: I,
    registry: Arc<Mutex<Registry<G>>>,
    lane: mpsc::Sender<Arc<G>>,
    attempts_per_quantum: usize,
    completion: Completion,
) where
    G: Genome,
    I: Iterator<Item = G>,
{
    loop {
        let mut attempts = 0;
        while attempts < attempts_per_quantum {
            attempts += 1;
            let Some(next) = source.next() else {
                debug!("Genome generator exhausted");
                return;
            };

            let hash = next.hash().to_owned();
            if !reserve(&registry, &hash) {
                continue;
            }

            // Blocks while the lane is full; fails only once the merger is gone.
            if lane.send(Arc::new(next)).await.is_ok() {
                attempts = 0;
            } else {
                registry.lock().hashes.remove(&hash);
                debug!("Production lane closed, driver halting");
                return;
            }
        }

        if completion.is_completed() {
            return;
        }
        tokio::task::yield_now().await;
    }
}

/// Merge both lanes into the output, preferring the priority lane.
async fn merge<G: Genome>(
    mut priority: mpsc::Receiver<Arc<G>>,
    mut production: mpsc::Receiver<Arc<G>>,
    output: mpsc::Sender<Arc<G>>,
    registry: Arc<Mutex<Registry<G>>>,
    completion: Completion,
) {
    'merge: loop {
        let next = tokio::select! {
            biased;
            _ = completion.completed() => break,
            Some(genome) = priority.recv() => genome,
            received = production.recv() => match received {
                Some(genome) => genome,
                None => {
                    // Generator exhausted: flush what is already queued with priority.
                    registry.lock().priority = None;
                    while let Ok(genome) = priority.try_recv() {
                        tokio::select! {
                            biased;
                            _ = completion.completed() => break 'merge,
                            sent = output.send(genome) => if sent.is_err() {
                                break 'merge;
                            },
                        }
                    }
                    break;
                }
            },
        };

        tokio::select! {
            biased;
            _ = completion.completed() => break,
            sent = output.send(next) => if sent.is_err() {
                debug!("Producer output closed downstream");
                break;
            },
        }
    }

    registry.lock().priority = None;
    completion.complete();
}
