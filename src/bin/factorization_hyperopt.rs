//! Tune the BPR factorization model on a CSV interaction log.
//!
//! Users are split into train/validation/test blocks. Trials are scored on
//! the validation block; the best configuration is then refitted and scored
//! on the test block. The trial history is written next to the report.
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rectune::config::RuntimeConfig;
use rectune::data::{Block, Dataset, InteractionTable};
use rectune::evaluation::{Evaluator, EvaluatorConfig, MetricResult};
use rectune::models::factorization::FactorizationBuilder;
use rectune::optimization::{
    refit_and_score, Assignment, OptimizationResult, Optimizer, OptimizerConfig, ParamValue,
    NopPruner, ParameterDomain, PercentilePruner, Pruner, RandomSampler, Sampler, SearchHistory,
    SearchSpace, TpeConfig, TpeSampler,
};
use rectune::split::{user_holdout_split, HoldoutRatios};
use rectune::TrialContext;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SamplerKind {
    Random,
    Tpe,
}

#[derive(Debug, Parser)]
#[command(about = "Tune a BPR factorization model on a CSV interaction log.")]
struct Args {
    /// CSV file with one interaction per row.
    #[arg(long)]
    data: PathBuf,
    /// Column holding user ids.
    #[arg(long, default_value = "user_id")]
    user_column: String,
    /// Column holding item ids.
    #[arg(long, default_value = "item_id")]
    item_column: String,
    /// TOML tuning configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Output prefix; `<prefix>.json` and `<prefix>.csv` are written.
    #[arg(long, default_value = "factorization_results")]
    output: PathBuf,
    /// Overrides `optimizer.n_trials`.
    #[arg(long)]
    n_trials: Option<usize>,
    /// Overrides `optimizer.seed`.
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, value_enum, default_value_t = SamplerKind::Tpe)]
    sampler: SamplerKind,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TuningConfig {
    split: HoldoutRatios,
    split_seed: u64,
    evaluator: EvaluatorConfig,
    optimizer: OptimizerConfig,
    /// Trials are never pruned without a `[pruner]` table.
    pruner: Option<PercentilePruner>,
    tpe: TpeConfig,
    search_space: SearchSpace,
}

impl TuningConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("Cannot read {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("Cannot parse {}", path.display()))?
            }
            None => TuningConfig::default(),
        };

        if config.search_space.is_empty() {
            config.search_space = default_space();
        }
        if let Some(pruner) = &config.pruner {
            pruner.validate()?;
        }
        config.tpe.validate()?;

        Ok(config)
    }

    fn pruner(&self) -> Box<dyn Pruner> {
        match &self.pruner {
            Some(pruner) => Box::new(pruner.clone()),
            None => Box::new(NopPruner),
        }
    }
}

fn default_space() -> SearchSpace {
    SearchSpace::new()
        .add("latent_dim", ParameterDomain::int_log(8, 128))
        .add("learning_rate", ParameterDomain::float_log(1e-3, 0.3))
        .add("l2_penalty", ParameterDomain::float_log(1e-6, 1e-2))
}

#[derive(Debug, Serialize)]
struct Report {
    best_trial_id: usize,
    best_params: Assignment,
    best_value: f64,
    best_step: Option<usize>,
    best_seed: u64,
    test_metrics: MetricResult,
    elapsed: Duration,
    trials: SearchHistory,
}

fn load_dataset(args: &Args, config: &TuningConfig) -> Result<Dataset> {
    let table = InteractionTable::from_path(&args.data, &args.user_column, &args.item_column)
        .with_context(|| format!("Cannot load {}", args.data.display()))?;
    info!(n_interactions = table.len(), "Loaded interactions");

    let dataset = user_holdout_split(&table, &config.split, config.split_seed)?;
    info!(
        n_items = dataset.n_items(),
        train_users = dataset.train().n_users(),
        val_users = dataset.val().n_users(),
        test_users = dataset.test().n_users(),
        "Split users"
    );

    Ok(dataset)
}

fn tune<S: Sampler>(
    dataset: &Dataset,
    config: &TuningConfig,
    runtime: RuntimeConfig,
    sampler: S,
) -> Result<OptimizationResult> {
    let evaluator = Evaluator::new(
        dataset.val().x_test().clone(),
        dataset.offset(Block::Val),
        config.evaluator.clone(),
    )?;

    let mut optimizer = Optimizer::new(
        FactorizationBuilder,
        dataset.training_matrix(Block::Val),
        &evaluator,
        sampler,
    )
    .search_space(config.search_space.clone())
    .config(config.optimizer.clone())
    .runtime(runtime);

    Ok(optimizer.optimize()?)
}

fn score_on_test(
    dataset: &Dataset,
    config: &TuningConfig,
    runtime: RuntimeConfig,
    result: &OptimizationResult,
) -> Result<MetricResult> {
    let evaluator = Evaluator::new(
        dataset.test().x_test().clone(),
        dataset.offset(Block::Test),
        config.evaluator.clone(),
    )?;

    // Train for as long as the best trial took to reach its value.
    let mut params = result.best_params.clone();
    if let Some(best_step) = result.best_step {
        params.insert("num_epochs".to_owned(), ParamValue::Int(best_step as i64));
    }

    let context = TrialContext {
        trial_id: result.best_trial_id,
        seed: result.best_seed,
        n_threads: runtime.n_threads,
    };

    Ok(refit_and_score(
        &FactorizationBuilder,
        Arc::new(dataset.training_matrix(Block::Test)),
        &params,
        &context,
        &evaluator,
    )?)
}

fn write_outputs(prefix: &Path, report: &Report) -> Result<()> {
    let json_path = prefix.with_extension("json");
    let json = BufWriter::new(
        File::create(&json_path).with_context(|| format!("Cannot create {}", json_path.display()))?,
    );
    serde_json::to_writer_pretty(json, report)?;

    let csv_path = prefix.with_extension("csv");
    let csv = File::create(&csv_path).with_context(|| format!("Cannot create {}", csv_path.display()))?;
    report.trials.write_csv(BufWriter::new(csv))?;

    info!(json = %json_path.display(), csv = %csv_path.display(), "Wrote results");

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = TuningConfig::load(args.config.as_deref())?;
    if let Some(n_trials) = args.n_trials {
        config.optimizer.n_trials = n_trials;
    }
    if let Some(seed) = args.seed {
        config.optimizer.seed = seed;
    }
    let runtime = RuntimeConfig::from_env();

    let start = Instant::now();
    let dataset = load_dataset(&args, &config)?;

    let seed = config.optimizer.seed;
    let pruner = config.pruner();
    let result = match args.sampler {
        SamplerKind::Random => tune(
            &dataset,
            &config,
            runtime,
            RandomSampler::new(seed).with_pruner(pruner),
        )?,
        SamplerKind::Tpe => tune(
            &dataset,
            &config,
            runtime,
            TpeSampler::new(seed)
                .with_config(config.tpe.clone())
                .with_pruner(pruner),
        )?,
    };

    let test_metrics = score_on_test(&dataset, &config, runtime, &result)?;
    for (key, value) in test_metrics.iter() {
        info!(metric = key, value, "Test score");
    }

    let report = Report {
        best_trial_id: result.best_trial_id,
        best_params: result.best_params,
        best_value: result.best_value,
        best_step: result.best_step,
        best_seed: result.best_seed,
        test_metrics,
        elapsed: start.elapsed(),
        trials: result.validation_results,
    };

    write_outputs(&args.output, &report)
}
