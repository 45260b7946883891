//! Genepool CLI - Evolve a phrase from JSON configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use genepool::{
    engine::{Environment, Outcome},
    sample::{DEFAULT_ALPHABET, PhraseFactory, PhraseProblem},
    schema::EnvironmentConfig,
};
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_TARGET: &str = "to be or not to be";

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json|--default> [target phrase]", args[0]);
        eprintln!();
        eprintln!("Evolve a phrase through the genome pipeline.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json    Path to environment configuration file");
        eprintln!("  --default      Run with the default configuration");
        eprintln!("  target phrase  Phrase to evolve (default: \"{}\")", DEFAULT_TARGET);
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config = if args[1] == "--default" {
        EnvironmentConfig::default()
    } else {
        let config_path = PathBuf::from(&args[1]);
        EnvironmentConfig::load(&config_path).unwrap_or_else(|e| {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        })
    };
    let target = args.get(2).map(String::as_str).unwrap_or(DEFAULT_TARGET);

    println!("Genepool Phrase Evolution");
    println!("=========================");
    println!("Target: {:?}", target);
    println!(
        "Pool size: {}, network depth: {}, node size: {}",
        config.pool_size, config.network_depth, config.node_size
    );
    println!(
        "Convergence: {} samples at {} (tolerance {})",
        config.convergence.threshold_samples,
        config.convergence.target,
        config.convergence.tolerance
    );
    println!();

    let factory = Arc::new(PhraseFactory::new(
        DEFAULT_ALPHABET,
        target.len(),
        config.random_seed,
    ));
    let problem = Arc::new(PhraseProblem::new(target, target.len().div_ceil(2)).unwrap_or_else(|e| {
        eprintln!("Error creating problem: {}", e);
        std::process::exit(1);
    }));

    let start = Instant::now();
    let env = Environment::start(factory, Arc::clone(&problem), config).unwrap_or_else(|e| {
        eprintln!("Error starting environment: {}", e);
        std::process::exit(1);
    });

    if let Some(mut updates) = env.subscribe() {
        let mut best = String::new();
        loop {
            match updates.recv().await {
                Ok(top) => {
                    let hash = String::from_utf8_lossy(top.genome.genes()).into_owned();
                    if hash != best {
                        println!(
                            "  [{:>7.2}s] {:?} {:?} ({} samples)",
                            start.elapsed().as_secs_f32(),
                            hash,
                            top.fitness.averages(),
                            top.fitness.sample_count()
                        );
                        best = hash;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    }

    let elapsed = start.elapsed();
    println!();
    match env.outcome().await {
        Outcome::Converged(winner) => println!(
            "Converged: {:?} after {} samples",
            String::from_utf8_lossy(winner.genome.genes()),
            winner.fitness.sample_count()
        ),
        Outcome::Faulted(e) => {
            eprintln!("Pipeline faulted: {}", e);
            std::process::exit(1);
        }
        Outcome::Cancelled => println!("Cancelled"),
        Outcome::Exhausted => println!("Genome supply exhausted"),
    }
    println!(
        "Time: {:.2}s ({} evaluations, {:.0} evaluations/s, {} batches)",
        elapsed.as_secs_f32(),
        problem.evaluations(),
        problem.evaluations() as f32 / elapsed.as_secs_f32(),
        env.batches_started()
    );
}

fn print_example_config() {
    let config = EnvironmentConfig::default();

    println!("Example configuration (config.json):");
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing config: {}", e),
    }
}
