//! Pipeline stages and the tournament network.
//!
//! A stage is a streaming [`PoolProcessor`] plus a selector task. For every
//! ranked batch the selector runs the stage's selection callback and forwards
//! the best `node_size` members onward. Closing a stage's input (or calling
//! `complete`) drains it and then closes its output, so completion flows
//! downstream link by link. A stage whose next stage has closed completes
//! itself, so completion flows upstream as well.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use log::debug;
use tokio::sync::mpsc;

use super::completion::WriteOnce;
use super::error::PipelineError;
use super::genome::Genome;
use super::pool::{BatchIds, PoolOptions, PoolProcessor, RankedBatch, ScoreFn};

/// Selection callback, run on every ranked batch a stage emits.
pub type SelectFn<G> = Arc<dyn Fn(&RankedBatch<G>) + Send + Sync>;

/// Where a stage sends its survivors.
pub enum Forward<G> {
    /// Into the next stage. Blocks while it is full.
    Next(mpsc::Sender<Arc<G>>),
    /// Back into the stage's own input. Survivors are dropped when the input
    /// is full or already closed.
    Recycle(mpsc::WeakSender<Arc<G>>),
}

/// One processing node of the pipeline.
pub struct PipelineStage<G: Genome> {
    name: String,
    pool: Arc<PoolProcessor<G>>,
    status: Arc<WriteOnce<Result<(), PipelineError>>>,
}

impl<G: Genome> PipelineStage<G> {
    fn spawn(
        name: String,
        pool: PoolProcessor<G>,
        batches: mpsc::Receiver<RankedBatch<G>>,
        node_size: usize,
        forward: Forward<G>,
        on_selected: SelectFn<G>,
    ) -> Self {
        let pool = Arc::new(pool);
        let status = Arc::new(WriteOnce::new());

        let selector = tokio::spawn(forward_survivors(
            name.clone(),
            Arc::clone(&pool),
            batches,
            node_size,
            forward,
            on_selected,
        ));
        {
            let pool = Arc::clone(&pool);
            let status = Arc::clone(&status);
            tokio::spawn(async move {
                let selected = selector.await.map_err(PipelineError::from);
                let pooled = pool.join().await;
                status.set(pooled.and(selected));
            });
        }

        Self { name, pool, status }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the stage. Anything it already forwarded keeps flowing downstream.
    pub fn complete(&self) {
        self.pool.complete();
    }

    pub fn is_completed(&self) -> bool {
        self.pool.is_completed()
    }

    /// Wait for the stage to stop. Returns its fault, if any.
    pub async fn join(&self) -> Result<(), PipelineError> {
        self.status.wait().await.clone()
    }

    /// Batches admitted but not yet sealed.
    pub fn live_batches(&self) -> usize {
        self.pool.live_batches()
    }
}

/// Forward each batch's survivors. A closed next stage completes `pool`.
async fn forward_survivors<G: Genome>(
    name: String,
    pool: Arc<PoolProcessor<G>>,
    mut batches: mpsc::Receiver<RankedBatch<G>>,
    node_size: usize,
    forward: Forward<G>,
    on_selected: SelectFn<G>,
) {
    loop {
        let received = match &forward {
            Forward::Next(next) => tokio::select! {
                received = batches.recv() => received,
                _ = next.closed() => {
                    halt(&name, &pool);
                    return;
                }
            },
            Forward::Recycle(_) => batches.recv().await,
        };
        let Some(batch) = received else {
            break;
        };
        on_selected(&batch);

        let survivors = batch.top(node_size);
        match &forward {
            Forward::Next(next) => {
                for survivor in survivors {
                    if next.send(Arc::clone(&survivor.genome)).await.is_err() {
                        halt(&name, &pool);
                        return;
                    }
                }
            }
            Forward::Recycle(input) => {
                let Some(input) = input.upgrade() else {
                    continue;
                };
                for survivor in survivors {
                    if input.try_send(Arc::clone(&survivor.genome)).is_err() {
                        break;
                    }
                }
            }
        }
    }
    debug!("Stage {} drained", name);
}

fn halt<G: Genome>(name: &str, pool: &PoolProcessor<G>) {
    debug!("Stage {} halting: next stage closed", name);
    pool.complete();
}

/// Builds stages sharing one scoring delegate and one batch id source.
#[derive(Clone)]
pub struct PipelineBuilder<G> {
    options: PoolOptions,
    node_size: usize,
    stage_buffer: usize,
    ids: BatchIds,
    score: ScoreFn<G>,
}

impl<G: Genome> PipelineBuilder<G> {
    pub fn new(
        options: PoolOptions,
        node_size: usize,
        stage_buffer: usize,
        ids: BatchIds,
        score: ScoreFn<G>,
    ) -> Self {
        Self {
            options,
            node_size: node_size.max(1),
            stage_buffer: stage_buffer.max(1),
            ids,
            score,
        }
    }

    /// Start one stage reading from `input`.
    pub fn stage(
        &self,
        name: impl Into<String>,
        input: mpsc::Receiver<Arc<G>>,
        forward: Forward<G>,
        on_selected: SelectFn<G>,
    ) -> PipelineStage<G> {
        let (pool, batches) = PoolProcessor::spawn(
            self.options,
            self.ids.clone(),
            Arc::clone(&self.score),
            input,
        );
        PipelineStage::spawn(
            name.into(),
            pool,
            batches,
            self.node_size,
            forward,
            on_selected,
        )
    }

    /// Chain `depth` identical stages from `input` to `terminal`.
    pub fn network(
        &self,
        depth: usize,
        input: mpsc::Receiver<Arc<G>>,
        terminal: mpsc::Sender<Arc<G>>,
        on_selected: SelectFn<G>,
    ) -> Network<G> {
        let depth = depth.max(1);
        let mut stages = Vec::with_capacity(depth);
        let mut input = input;
        for level in 0..depth {
            let (next_tx, next_rx) = if level + 1 == depth {
                (terminal.clone(), None)
            } else {
                let (tx, rx) = mpsc::channel(self.stage_buffer);
                (tx, Some(rx))
            };
            stages.push(self.stage(
                format!("stage-{level}"),
                input,
                Forward::Next(next_tx),
                Arc::clone(&on_selected),
            ));
            match next_rx {
                Some(rx) => input = rx,
                None => break,
            }
        }
        Network { stages }
    }

    /// Final stage that recycles its survivors into itself.
    ///
    /// Returns the stage and its only strong input sender; the input closes
    /// once that sender (and every clone of it) is dropped.
    pub fn distributor(
        &self,
        on_selected: SelectFn<G>,
    ) -> (PipelineStage<G>, mpsc::Sender<Arc<G>>) {
        let (tx, rx) = mpsc::channel(self.stage_buffer);
        let stage = self.stage("distributor", rx, Forward::Recycle(tx.downgrade()), on_selected);
        (stage, tx)
    }
}

/// A cascade of stages, first to last.
pub struct Network<G: Genome> {
    stages: Vec<PipelineStage<G>>,
}

impl<G: Genome> Network<G> {
    pub fn depth(&self) -> usize {
        self.stages.len()
    }

    pub fn stages(&self) -> &[PipelineStage<G>] {
        &self.stages
    }

    /// Complete every stage.
    pub fn complete(&self) {
        for stage in &self.stages {
            stage.complete();
        }
    }

    /// Wait for every stage. Returns the first fault observed.
    pub async fn join(&self) -> Result<(), PipelineError> {
        let mut pending: FuturesUnordered<_> =
            self.stages.iter().map(PipelineStage::join).collect();
        let mut first = Ok(());
        while let Some(result) = pending.next().await {
            if first.is_ok() {
                first = result;
            }
        }
        first
    }
}
