use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use task_pipeline_core::{read_ndjson, QuarantineRecord};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "tq-admin")]
#[command(about = "Inspect quarantine reports written by tq-pipeline", long_about = None)]
struct Args {
    /// Quarantine report (NDJSON)
    #[arg(short, long, default_value = "quarantine.ndjson")]
    report: PathBuf,

    /// Output format (json, table, yaml)
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List quarantined tasks
    List {
        /// Only tasks quarantined by this worker
        #[arg(short, long)]
        worker: Option<usize>,

        /// Limit number of results
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Show one quarantined task in full
    Show {
        /// Task ID
        task_id: String,
    },

    /// Summarize the report
    Stats,
}

#[derive(Debug, Default, PartialEq, Serialize)]
struct ReportStats {
    total: usize,
    by_worker: BTreeMap<usize, usize>,
    by_reason: BTreeMap<String, usize>,
    average_attempts: f64,
    first_quarantined: Option<DateTime<Utc>>,
    last_quarantined: Option<DateTime<Utc>>,
}

fn load_report(path: &Path) -> anyhow::Result<Vec<QuarantineRecord>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open quarantine report {}", path.display()))?;
    let records = read_ndjson(BufReader::new(file))
        .with_context(|| format!("failed to parse quarantine report {}", path.display()))?;
    Ok(records)
}

fn filter_records(
    records: Vec<QuarantineRecord>,
    worker: Option<usize>,
    limit: usize,
) -> Vec<QuarantineRecord> {
    records
        .into_iter()
        .filter(|r| worker.map_or(true, |w| r.worker_id == w))
        .take(limit)
        .collect()
}

fn compute_stats(records: &[QuarantineRecord]) -> ReportStats {
    let mut stats = ReportStats {
        total: records.len(),
        ..Default::default()
    };
    if records.is_empty() {
        return stats;
    }

    let mut attempts = 0u64;
    for record in records {
        *stats.by_worker.entry(record.worker_id).or_insert(0) += 1;
        *stats
            .by_reason
            .entry(record.reason.as_str().to_string())
            .or_insert(0) += 1;
        attempts += u64::from(record.attempts);
    }
    stats.average_attempts = attempts as f64 / records.len() as f64;
    stats.first_quarantined = records.iter().map(|r| r.quarantined_at).min();
    stats.last_quarantined = records.iter().map(|r| r.quarantined_at).max();
    stats
}

fn find_record<'a>(records: &'a [QuarantineRecord], task_id: &str) -> anyhow::Result<&'a QuarantineRecord> {
    let task_id = Uuid::parse_str(task_id)?;
    match records.iter().find(|r| r.task.id() == task_id) {
        Some(record) => Ok(record),
        None => anyhow::bail!("task {} not found", task_id),
    }
}

/// Cut long payloads and errors down for table cells
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let records = load_report(&args.report)?;

    match args.command {
        Commands::List { worker, limit } => {
            let records = filter_records(records, worker, limit);

            match args.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&records)?),
                "yaml" => println!("{}", serde_yaml::to_string(&records)?),
                _ => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["ID", "Worker", "Attempts", "Last Error", "Payload", "Quarantined"]);
                    for record in &records {
                        table.add_row(vec![
                            record.task.id().to_string(),
                            record.worker_id.to_string(),
                            record.attempts.to_string(),
                            truncate(&record.last_error, 40),
                            truncate(&record.task.to_string(), 60),
                            record.quarantined_at.to_rfc3339(),
                        ]);
                    }
                    println!("{table}");
                }
            }
        }

        Commands::Show { task_id } => {
            let record = find_record(&records, &task_id)
                .with_context(|| format!("in {}", args.report.display()))?;

            match args.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(record)?),
                "yaml" => println!("{}", serde_yaml::to_string(record)?),
                _ => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["Field", "Value"]);
                    table.add_row(vec!["ID", &record.task.id().to_string()]);
                    table.add_row(vec!["Args", &serde_json::to_string(record.task.args())?]);
                    table.add_row(vec!["Kwargs", &serde_json::to_string(record.task.kwargs())?]);
                    table.add_row(vec!["Created", &record.task.created_at().to_rfc3339()]);
                    table.add_row(vec!["Reason", record.reason.as_str()]);
                    table.add_row(vec!["Attempts", &record.attempts.to_string()]);
                    table.add_row(vec!["Worker", &record.worker_id.to_string()]);
                    table.add_row(vec!["Last Error", &record.last_error]);
                    table.add_row(vec!["Quarantined", &record.quarantined_at.to_rfc3339()]);
                    println!("{table}");
                }
            }
        }

        Commands::Stats => {
            let stats = compute_stats(&records);

            match args.format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&stats)?),
                "yaml" => println!("{}", serde_yaml::to_string(&stats)?),
                _ => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["Metric", "Value"]);
                    table.add_row(vec!["Quarantined Tasks".to_string(), stats.total.to_string()]);
                    table.add_row(vec![
                        "Average Attempts".to_string(),
                        format!("{:.2}", stats.average_attempts),
                    ]);
                    for (reason, count) in &stats.by_reason {
                        table.add_row(vec![format!("Reason ({})", reason), count.to_string()]);
                    }
                    for (worker, count) in &stats.by_worker {
                        table.add_row(vec![format!("Worker {}", worker), count.to_string()]);
                    }
                    if let (Some(first), Some(last)) = (stats.first_quarantined, stats.last_quarantined) {
                        table.add_row(vec!["First".to_string(), first.to_rfc3339()]);
                        table.add_row(vec!["Last".to_string(), last.to_rfc3339()]);
                    }
                    println!("{table}");
                }
            }
        }
    }

    Ok(())
}
