//! deeppoly: certify local robustness of a classifier with DeepPoly.
//!
//! Loads a JSON network and an `img{id}_{dataset}_{eps}.txt` spec, checks that
//! the network predicts the spec's label on the unperturbed input, then runs
//! the verifier and prints its verdict.

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use deeppoly_cli::{check_line, ground_truth, load_network, load_spec, verdict_text};
use deeppoly_propagate::{predict, OptimizerConfig, RelaxationMode, StoppingConfig, Verifier, VerifierConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// DeepPoly robustness certifier
#[derive(Parser, Debug)]
#[command(name = "deeppoly")]
#[command(about = "Neural network verification using DeepPoly relaxation")]
#[command(version)]
struct Args {
    /// Network description (JSON)
    #[arg(long)]
    net: PathBuf,

    /// Test case to verify, named img{id}_{dataset}_{eps}.txt
    #[arg(long)]
    spec: PathBuf,

    /// Compare the verdict with gt.txt in the spec's directory
    #[arg(long)]
    check: bool,

    /// Stop once the loss failed to improve this many times
    #[arg(long)]
    early_stopping: Option<usize>,

    /// Halve the learning rate once the loss failed to improve this many times
    #[arg(long, default_value = "1")]
    lr_scheduling: usize,

    /// Hard cap on optimization epochs
    #[arg(long)]
    max_epochs: Option<usize>,

    /// Initial learning rate of the slope optimizer
    #[arg(long)]
    lr: Option<f32>,

    /// Keep the tie-break slopes instead of optimizing them
    #[arg(long)]
    fixed_relaxation: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level: Level = args
        .log
        .parse()
        .map_err(|e| anyhow!("invalid --log level {:?}: {}", args.log, e))?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let layers = load_network(&args.net)?;
    let spec_file = load_spec(&args.spec)?;
    let spec = &spec_file.spec;
    info!(
        "Image {} ({}), label {}, eps {}",
        spec_file.id, spec_file.dataset, spec.label, spec.epsilon
    );

    let center = spec.center()?;
    let predicted = predict(&layers, &center).context("evaluating the network on the spec input")?;
    if predicted != spec.label {
        bail!(
            "network predicts {predicted} but {} is labelled {}",
            args.spec.display(),
            spec.label
        );
    }

    let defaults = OptimizerConfig::default();
    let config = VerifierConfig {
        stopping: StoppingConfig {
            max_epochs: args.max_epochs,
            early_stopping: args.early_stopping,
            lr_scheduling: Some(args.lr_scheduling),
        },
        optimizer: OptimizerConfig {
            learning_rate: args.lr.unwrap_or(defaults.learning_rate),
            relaxation: if args.fixed_relaxation {
                RelaxationMode::Fixed
            } else {
                RelaxationMode::Adaptive
            },
            ..defaults
        },
    };
    let outcome = Verifier::new(config)?.verify(&layers, &center, spec.label, spec.epsilon)?;
    let verdict = verdict_text(outcome.verified);

    if args.check {
        let net = args
            .net
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("network path {} has no file name", args.net.display()))?;
        let truth = ground_truth(net, &args.spec)?.ok_or_else(|| {
            anyhow!("no ground truth for {net} / {}", args.spec.display())
        })?;
        println!(
            "{}",
            check_line(
                outcome.verified,
                &truth,
                outcome.elapsed,
                &args.spec.display().to_string()
            )
        );
    } else {
        println!("{verdict}");
    }
    Ok(())
}
