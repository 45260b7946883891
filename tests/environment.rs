//! End-to-end runs of the pipeline on the phrase problem.

use std::sync::Arc;
use std::time::Duration;

use genepool::{
    Genome,
    engine::{Environment, Outcome},
    sample::{PhraseFactory, PhraseGenome, PhraseProblem},
    schema::{ConvergenceConfig, EnvironmentConfig},
};
use tokio::sync::broadcast::error::RecvError;

type PhraseEnvironment = Environment<PhraseGenome, PhraseFactory, PhraseProblem>;

fn config(threshold_samples: usize) -> EnvironmentConfig {
    EnvironmentConfig {
        pool_size: 4,
        network_depth: 2,
        node_size: 2,
        stage_buffer: 32,
        convergence: ConvergenceConfig {
            threshold_samples,
            ..Default::default()
        },
        random_seed: Some(3),
        ..Default::default()
    }
}

fn start(alphabet: &str, target: &str, threshold_samples: usize) -> PhraseEnvironment {
    let config = config(threshold_samples);
    let factory = Arc::new(PhraseFactory::new(alphabet, target.len(), config.random_seed));
    let problem = Arc::new(PhraseProblem::new(target, 2).unwrap());
    Environment::start(factory, problem, config).unwrap()
}

async fn finish(env: &PhraseEnvironment) -> Outcome<PhraseGenome> {
    tokio::time::timeout(Duration::from_secs(60), env.outcome())
        .await
        .expect("environment finished in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_evolves_target_phrase() {
    let env = start("abcd", "dcab", 5);

    let outcome = finish(&env).await;
    let winner = outcome.winner().expect("converged");
    assert_eq!(winner.genome.genes(), b"dcab");
    assert!(winner.fitness.sample_count() >= 5);
    assert_eq!(winner.fitness.averages(), vec![1.0, 1.0]);
    assert!(env.problem().evaluations() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seeded_solution_wins() {
    let env = start("abcdefghijklmnopqrstuvwxyz", "pipeline", 3);
    assert!(env.seed(PhraseGenome::new(b"pipeline".to_vec())));
    assert!(!env.seed(PhraseGenome::new(b"pipeline".to_vec())));

    let outcome = finish(&env).await;
    assert_eq!(outcome.winner().expect("converged").genome.hash(), "pipeline");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_ends_with_winner() {
    let env = start("abc", "cab", 4);
    let mut updates = env.subscribe().expect("running");

    let mut last = None;
    loop {
        match tokio::time::timeout(Duration::from_secs(60), updates.recv())
            .await
            .expect("update in time")
        {
            Ok(top) => last = Some(top.genome.hash().to_owned()),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }

    let outcome = finish(&env).await;
    assert_eq!(last.as_deref(), Some("cab"));
    assert_eq!(outcome.winner().unwrap().genome.hash(), "cab");
    assert!(env.producer().is_completed());
}

#[tokio::test]
async fn test_shutdown_closes_broadcast() {
    // Unreachable target: the alphabet lacks 'z'.
    let env = start("ab", "zz", 3);
    let mut updates = env.subscribe().expect("running");

    env.shutdown();
    assert!(matches!(finish(&env).await, Outcome::Cancelled));
    loop {
        match updates.recv().await {
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
    assert!(env.is_terminated());
}

#[tokio::test]
async fn test_length_mismatch_faults() {
    let config = config(3);
    let factory = Arc::new(PhraseFactory::new("ab", 3, config.random_seed));
    let problem = Arc::new(PhraseProblem::new("abcd", 2).unwrap());
    let env = Environment::start(factory, problem, config).unwrap();

    match finish(&env).await {
        Outcome::Faulted(err) => assert!(err.to_string().contains("does not match")),
        other => panic!("expected fault, got {other:?}"),
    }
    assert!(env.subscribe().is_none());
}
