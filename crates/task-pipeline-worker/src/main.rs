use clap::Parser;
use rand::Rng;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use task_pipeline_core::Task;
use task_pipeline_worker::handler::{EchoHandler, FlakyHandler};
use task_pipeline_worker::{Pipeline, PipelineConfig, PipelineMetrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const BASE_URL: &str = "https://httpbin.org";

#[derive(Parser, Debug)]
#[command(name = "tq-pipeline")]
#[command(about = "Run generated tasks through a retrying worker pool", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Number of worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Number of tasks to generate
    #[arg(short, long, default_value = "1000")]
    tasks: usize,

    /// Attempts per task before quarantine
    #[arg(long)]
    attempts: Option<u32>,

    /// Delay after the first failed attempt, in milliseconds
    #[arg(long)]
    base_delay_ms: Option<u64>,

    /// Backoff multiplier applied after every failed attempt
    #[arg(long)]
    multiplier: Option<f64>,

    /// Fraction of handler invocations that fail (0.0-1.0)
    #[arg(long, default_value = "0.1")]
    failure_rate: f64,

    /// Directory for per-worker result files
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// NDJSON file to append quarantined tasks to
    #[arg(long)]
    quarantine_report: Option<PathBuf>,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    dump_metrics: bool,
}

fn generate_tasks(count: usize) -> Vec<Task> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let output = rng.gen_range(0..=i).to_string();
            Task::builder()
                .arg(format!("{}/get", BASE_URL))
                .kwarg("params", json!({ "output": output }))
                .build()
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        PipelineConfig::from_file(config_path)?
    } else {
        PipelineConfig::default()
    };

    // Override with CLI args
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(attempts) = args.attempts {
        config.attempts = attempts;
    }
    if let Some(base_delay_ms) = args.base_delay_ms {
        config.base_delay_ms = base_delay_ms;
    }
    if let Some(multiplier) = args.multiplier {
        config.backoff_multiplier = multiplier;
    }
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }
    if args.quarantine_report.is_some() {
        config.quarantine_report = args.quarantine_report;
    }

    tracing::info!("Starting pipeline with config: {:?}", config);

    let metrics = Arc::new(PipelineMetrics::new()?);
    let handler = Arc::new(FlakyHandler::new(EchoHandler, args.failure_rate));
    let pipeline = Pipeline::new(config, handler)?.with_metrics(metrics.clone());

    let report = pipeline.run_to_files(generate_tasks(args.tasks))?;

    println!(
        "done: {} submitted, {} succeeded, {} quarantined",
        report.submitted,
        report.succeeded,
        report.quarantined_count()
    );
    for worker in &report.workers {
        println!(
            "  worker {}: {} succeeded, {} quarantined",
            worker.worker_id, worker.succeeded, worker.quarantined
        );
    }

    if args.dump_metrics {
        print!("{}", metrics.encode_text()?);
    }

    Ok(())
}
