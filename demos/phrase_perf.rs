//! Quick pipeline performance test

use std::sync::Arc;
use std::time::Instant;

use genepool::{
    GenomeFactory,
    engine::{Environment, Outcome},
    sample::{DEFAULT_ALPHABET, PhraseFactory, PhraseProblem},
    schema::{ConvergenceConfig, EnvironmentConfig},
};

#[tokio::main]
async fn main() {
    env_logger::init();
    println!("=== Phrase Pipeline Performance Test ===\n");

    // Test different phrase lengths
    for target in ["genome", "hello world", "the quick brown fox"] {
        println!("Target: {:?} ({} genes)", target, target.len());

        let config = EnvironmentConfig {
            pool_size: 8,
            network_depth: 3,
            node_size: 2,
            convergence: ConvergenceConfig {
                threshold_samples: 10,
                ..Default::default()
            },
            random_seed: Some(42),
            ..Default::default()
        };

        let factory = Arc::new(PhraseFactory::new(
            DEFAULT_ALPHABET,
            target.len(),
            config.random_seed,
        ));
        let problem = Arc::new(
            PhraseProblem::new(target, target.len().div_ceil(2)).expect("non-empty target"),
        );

        let start = Instant::now();
        let env = Environment::start(Arc::clone(&factory), Arc::clone(&problem), config)
            .expect("valid configuration");
        let outcome = env.outcome().await;
        let elapsed = start.elapsed();

        let evaluations = problem.evaluations();
        let evals_per_sec = evaluations as f64 / elapsed.as_secs_f64();

        match &outcome {
            Outcome::Converged(winner) => println!(
                "  Winner:         {:?}",
                String::from_utf8_lossy(winner.genome.genes())
            ),
            other => println!("  Outcome:        {:?}", other),
        }
        println!("  Batches:        {}", env.batches_started());
        println!("  Evaluations:    {}", evaluations);
        println!("  Tracked:        {}", problem.tracked());
        println!("  Cached genomes: {}", factory.cache().len());
        println!("  Elapsed:        {:.2}s", elapsed.as_secs_f64());
        println!("  Evals/sec:      {:.1}", evals_per_sec);
        println!();
    }
}
