//! Environment orchestrator.
//!
//! Wires the producer into a network of pipeline stages ending in a
//! self-recycling distributor, breeds batch leaders back into the producer,
//! and runs the termination protocol.
//!
//! ```text
//! producer ──▶ stage-0 ──▶ … ──▶ stage-(n-1) ──▶ distributor ─┐
//!    ▲            │                   │              │  ▲      │
//!    └── breed ◀──┴───────────────────┘              │  └──────┘ recycle
//!                                                    ├──▶ top genome (broadcast)
//!                                                    └──▶ VIP re-test ──▶ converge
//! ```
//!
//! Termination runs exactly once, through a compare-and-set gate, whichever
//! of convergence, fault, exhaustion or external shutdown gets there first.

use std::sync::atomic::{Ordering, fence};
use std::sync::{Arc, OnceLock, Weak};

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::schema::EnvironmentConfig;

use super::completion::{Completion, WriteOnce};
use super::error::PipelineError;
use super::genome::{Generator, Genome, GenomeFactory};
use super::pipeline::{Network, PipelineBuilder, PipelineStage, SelectFn};
use super::pool::{BatchIds, PoolOptions, RankedBatch, ScoreFn};
use super::problem::{BatchId, GenomeFitness, Problem};
use super::producer::GenomeProducer;

/// How an environment finished.
#[derive(Debug)]
pub enum Outcome<G> {
    /// A genome met the convergence target.
    Converged(GenomeFitness<G>),
    /// A stage faulted; no winner was published.
    Faulted(PipelineError),
    /// [`Environment::shutdown`] was called.
    Cancelled,
    /// The generator ran dry and every stage drained.
    Exhausted,
}

impl<G> Outcome<G> {
    pub fn is_converged(&self) -> bool {
        matches!(self, Outcome::Converged(_))
    }

    /// The converged genome, if any.
    pub fn winner(&self) -> Option<&GenomeFitness<G>> {
        match self {
            Outcome::Converged(winner) => Some(winner),
            _ => None,
        }
    }
}

impl<G> Clone for Outcome<G> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Converged(winner) => Outcome::Converged(winner.clone()),
            Outcome::Faulted(err) => Outcome::Faulted(err.clone()),
            Outcome::Cancelled => Outcome::Cancelled,
            Outcome::Exhausted => Outcome::Exhausted,
        }
    }
}

struct Stages<G: Genome> {
    network: Network<G>,
    distributor: PipelineStage<G>,
}

struct Shared<G: Genome, F, P> {
    factory: Arc<F>,
    problem: Arc<P>,
    config: EnvironmentConfig,
    ids: BatchIds,
    producer: GenomeProducer<G>,
    top: Mutex<Option<broadcast::Sender<GenomeFitness<G>>>>,
    vip: Mutex<Option<mpsc::Sender<Arc<G>>>>,
    vip_done: Completion,
    stages: OnceLock<Stages<G>>,
    terminated: Completion,
    outcome: WriteOnce<Outcome<G>>,
}

impl<G, F, P> Shared<G, F, P>
where
    G: Genome,
    F: GenomeFactory<G>,
    P: Problem<G>,
{
    /// Breed from the batch leader into the producer's priority lane.
    fn breed_from(&self, batch: &RankedBatch<G>) {
        let Some(leader) = batch.leader() else {
            return;
        };
        for offspring in self.factory.breed(&leader.genome) {
            self.producer.try_enqueue(offspring);
        }
    }

    /// Selection at the distributor: publish, re-test, check, breed.
    fn on_finalist(&self, batch: &RankedBatch<G>) {
        let Some(leader) = batch.leader() else {
            return;
        };

        if let Some(top) = self.top.lock().as_ref() {
            // No subscribers is fine.
            let _ = top.send(leader.clone());
        }
        if let Some(vip) = self.vip.lock().as_ref() {
            let _ = vip.try_send(Arc::clone(&leader.genome));
        }

        let convergence = &self.config.convergence;
        match self
            .problem
            .has_converged(&leader.genome, convergence.threshold_samples, convergence)
        {
            Ok(true) => self.converge(&leader.genome),
            Ok(false) => {}
            Err(err) => self.fault(err.into()),
        }

        self.breed_from(batch);
        self.factory.cache().trim_in_background();
    }

    /// Re-test a finalist that looks converged against a fresh sample set.
    async fn retest(
        &self,
        genome: Arc<G>,
        repost: &mpsc::WeakSender<Arc<G>>,
    ) -> Result<(), PipelineError> {
        let convergence = &self.config.convergence;
        if !self.problem.has_converged(&genome, 0, convergence)? {
            return Ok(());
        }
        if self
            .problem
            .has_converged(&genome, convergence.threshold_samples, convergence)?
        {
            self.converge(&genome);
            return Ok(());
        }

        let batch_id: BatchId = self.ids.next();
        let sample = self
            .problem
            .score(&genome, batch_id)
            .await
            .map_err(|source| PipelineError::Scoring {
                hash: genome.hash().to_owned(),
                source,
            })?;
        self.problem.record(&genome, &sample);

        if let Some(vip) = repost.upgrade() {
            let _ = vip.try_send(genome);
        }
        Ok(())
    }

    fn converge(&self, genome: &Arc<G>) {
        if !self.terminated.complete() {
            return;
        }
        let winner = GenomeFitness::new(
            Arc::clone(genome),
            self.problem.fitness_for(genome).snapshot(),
        );
        info!(
            "Converged on {} after {} batches ({} samples)",
            genome.hash(),
            self.ids.last(),
            winner.fitness.sample_count()
        );

        // Publish, then close the broadcast before anything else stops.
        if let Some(top) = self.top.lock().take() {
            let _ = top.send(winner.clone());
        }
        self.halt();
        self.outcome.set(Outcome::Converged(winner));
    }

    fn fault(&self, err: PipelineError) {
        if self.terminated.is_completed() {
            debug!("Ignoring fault after termination: {}", err);
            return;
        }
        error!("Environment faulted: {}", err);
        self.terminate(Outcome::Faulted(err));
    }

    fn terminate(&self, outcome: Outcome<G>) {
        if !self.terminated.complete() {
            return;
        }
        self.top.lock().take();
        self.halt();
        self.outcome.set(outcome);
    }

    /// Complete distributor, producer, VIP pool and network, in that order.
    fn halt(&self) {
        // Pairs with the fence in `start` after stage registration.
        fence(Ordering::SeqCst);
        let stages = self.stages.get();
        if let Some(stages) = stages {
            stages.distributor.complete();
        }
        self.producer.complete();
        self.vip_done.complete();
        self.vip.lock().take();
        if let Some(stages) = stages {
            stages.network.complete();
        }
    }
}

/// A running evolution environment.
///
/// Dropping the handle shuts the environment down.
pub struct Environment<G, F, P>
where
    G: Genome,
    F: GenomeFactory<G>,
    P: Problem<G>,
{
    shared: Arc<Shared<G, F, P>>,
}

impl<G, F, P> Environment<G, F, P>
where
    G: Genome,
    F: GenomeFactory<G>,
    P: Problem<G>,
{
    /// Validate `config`, wire the pipeline and start it. Must be called
    /// within a tokio runtime.
    pub fn start(
        factory: Arc<F>,
        problem: Arc<P>,
        config: EnvironmentConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let ids = BatchIds::new();
        let generator = Generator::new(Arc::clone(&factory), config.producer.generation_misses);
        let (producer, genomes) = GenomeProducer::spawn(generator, &config.producer);
        let (top, _) = broadcast::channel(config.broadcast_capacity);
        let (vip_tx, vip_rx) = mpsc::channel(config.stage_buffer);
        let vip_repost = vip_tx.downgrade();

        let builder = PipelineBuilder::new(
            PoolOptions {
                pool_size: config.pool_size,
                max_parallelism: config.scoring.max_parallelism,
                output_capacity: config.stage_buffer,
            },
            config.node_size,
            config.stage_buffer,
            ids.clone(),
            score_with(Arc::clone(&problem)),
        );

        let shared = Arc::new(Shared {
            factory,
            problem,
            config,
            ids,
            producer,
            top: Mutex::new(Some(top)),
            vip: Mutex::new(Some(vip_tx)),
            vip_done: Completion::new(),
            stages: OnceLock::new(),
            terminated: Completion::new(),
            outcome: WriteOnce::new(),
        });

        let weak = Arc::downgrade(&shared);
        let breed: SelectFn<G> = {
            let weak = Weak::clone(&weak);
            Arc::new(move |batch: &RankedBatch<G>| {
                if let Some(shared) = weak.upgrade() {
                    shared.breed_from(batch);
                }
            })
        };
        let finalist: SelectFn<G> = {
            let weak = Weak::clone(&weak);
            Arc::new(move |batch: &RankedBatch<G>| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_finalist(batch);
                }
            })
        };

        let (distributor, finalists) = builder.distributor(finalist);
        let network = builder.network(shared.config.network_depth, genomes, finalists, breed);
        let vip = tokio::spawn(run_vip(weak, vip_rx, vip_repost, shared.vip_done.clone()));

        let _ = shared.stages.set(Stages {
            network,
            distributor,
        });
        // Termination may have raced stage registration.
        fence(Ordering::SeqCst);
        if shared.terminated.is_completed() {
            shared.halt();
        }
        tokio::spawn(supervise(Arc::clone(&shared), vip));

        info!(
            "Environment started: pool size {}, depth {}, node size {}",
            shared.config.pool_size, shared.config.network_depth, shared.config.node_size
        );
        Ok(Self { shared })
    }

    /// Subscribe to top genome updates. `None` once terminated.
    ///
    /// The final message of a converged run is the winner.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<GenomeFitness<G>>> {
        self.shared.top.lock().as_ref().map(broadcast::Sender::subscribe)
    }

    /// Wait for the environment to finish.
    pub async fn outcome(&self) -> Outcome<G> {
        self.shared.outcome.wait().await.clone()
    }

    /// Cancel the run. Idempotent; a no-op after termination.
    pub fn shutdown(&self) {
        if !self.shared.terminated.is_completed() {
            info!("Environment shutdown requested");
        }
        self.shared.terminate(Outcome::Cancelled);
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.is_completed()
    }

    /// Offer a genome to the producer's priority lane.
    pub fn seed(&self, genome: G) -> bool {
        self.shared.producer.try_enqueue(genome)
    }

    pub fn producer(&self) -> &GenomeProducer<G> {
        &self.shared.producer
    }

    pub fn problem(&self) -> &Arc<P> {
        &self.shared.problem
    }

    pub fn factory(&self) -> &Arc<F> {
        &self.shared.factory
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.shared.config
    }

    /// Batch ids minted so far.
    pub fn batches_started(&self) -> BatchId {
        self.shared.ids.last()
    }
}

impl<G, F, P> Drop for Environment<G, F, P>
where
    G: Genome,
    F: GenomeFactory<G>,
    P: Problem<G>,
{
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Scoring delegate: score one sample, fold it into the global fitness and
/// rank on the result.
fn score_with<G: Genome, P: Problem<G>>(problem: Arc<P>) -> ScoreFn<G> {
    Arc::new(move |genome: Arc<G>, batch_id: BatchId| {
        let problem = Arc::clone(&problem);
        async move {
            let sample = problem
                .score(&genome, batch_id)
                .await
                .map_err(|source| PipelineError::Scoring {
                    hash: genome.hash().to_owned(),
                    source,
                })?;
            Ok(problem.record(&genome, &sample))
        }
        .boxed()
    })
}

async fn run_vip<G, F, P>(
    weak: Weak<Shared<G, F, P>>,
    mut inbox: mpsc::Receiver<Arc<G>>,
    repost: mpsc::WeakSender<Arc<G>>,
    done: Completion,
) where
    G: Genome,
    F: GenomeFactory<G>,
    P: Problem<G>,
{
    loop {
        let genome = tokio::select! {
            biased;
            _ = done.completed() => break,
            received = inbox.recv() => match received {
                Some(genome) => genome,
                None => break,
            },
        };
        let Some(shared) = weak.upgrade() else {
            break;
        };
        if let Err(err) = shared.retest(genome, &repost).await {
            shared.fault(err);
            break;
        }
    }
    debug!("VIP pool drained");
}

/// Watch every stage. The first fault terminates the environment; if all
/// stages drain without one, the run is exhausted.
async fn supervise<G, F, P>(shared: Arc<Shared<G, F, P>>, vip: JoinHandle<()>)
where
    G: Genome,
    F: GenomeFactory<G>,
    P: Problem<G>,
{
    if let Some(stages) = shared.stages.get() {
        let mut pending: FuturesUnordered<_> = stages
            .network
            .stages()
            .iter()
            .chain(std::iter::once(&stages.distributor))
            .map(PipelineStage::join)
            .collect();
        while let Some(result) = pending.next().await {
            if let Err(err) = result {
                shared.fault(err);
            }
        }
    }

    shared.vip.lock().take();
    if let Err(err) = vip.await {
        shared.fault(err.into());
    }
    if !shared.terminated.is_completed() {
        info!("Genome supply exhausted after {} batches", shared.ids.last());
    }
    shared.terminate(Outcome::Exhausted);
}
