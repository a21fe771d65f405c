//! Pool setup and the coordinator that waits for every task to be accounted for.

use crate::config::PipelineConfig;
use crate::executor::RetryingHandler;
use crate::handler::TaskHandler;
use crate::metrics::PipelineMetrics;
use crate::producer::Producer;
use crate::sink::{FileSink, Sink};
use crate::worker::{Worker, WorkerHandle, WorkerReport};
use task_pipeline_core::{
    write_ndjson, ClosableQueue, PipelineError, QuarantineRecord, QueueError, Result, Sleeper,
    Task, ThreadSleeper,
};

use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How often the coordinator checks for failed workers while joining the input queue
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(50);

const BACKOFF_LOG_LIMIT: usize = 8;

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub submitted: usize,
    pub succeeded: usize,
    pub quarantined: Vec<QuarantineRecord>,
    /// One entry per worker, ordered by worker id
    pub workers: Vec<WorkerReport>,
}

impl PipelineReport {
    pub fn quarantined_count(&self) -> usize {
        self.quarantined.len()
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    handler: Arc<dyn TaskHandler>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, handler: Arc<dyn TaskHandler>) -> Result<Self> {
        config.validate()?;
        Ok(Pipeline {
            config,
            handler,
            sleeper: Arc::new(ThreadSleeper),
            metrics: None,
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Spawn one worker per sink. `sinks.len()` must equal `worker_count`.
    pub fn start(&self, sinks: Vec<Box<dyn Sink>>) -> Result<RunningPipeline> {
        if sinks.len() != self.config.worker_count {
            return Err(PipelineError::config(format!(
                "expected {} sinks, got {}",
                self.config.worker_count,
                sinks.len()
            )));
        }

        let policy = self.config.retry_policy()?;
        debug!(
            "Backoff schedule: {:?}",
            policy.backoff_schedule().take(BACKOFF_LOG_LIMIT).collect::<Vec<_>>()
        );

        let mut executor =
            RetryingHandler::new(self.handler.clone(), policy).with_sleeper(self.sleeper.clone());
        if let Some(metrics) = &self.metrics {
            executor = executor.with_metrics(metrics.clone());
        }
        let executor = Arc::new(executor);

        let input = Arc::new(ClosableQueue::new());
        let quarantine = Arc::new(ClosableQueue::new());

        let mut running = RunningPipeline {
            input: input.clone(),
            quarantine: quarantine.clone(),
            workers: Vec::with_capacity(sinks.len()),
            finished: Vec::new(),
            quarantine_report: self.config.quarantine_report.clone(),
        };

        for (id, sink) in sinks.into_iter().enumerate() {
            let mut worker = Worker::new(id, executor.clone(), sink, input.clone(), quarantine.clone())
                .with_progress_log_interval(self.config.progress_log_interval);
            if let Some(metrics) = &self.metrics {
                worker = worker.with_metrics(metrics.clone());
            }

            let name = format!("{}-{}", self.config.thread_name_prefix, id);
            match worker.spawn(name) {
                Ok(handle) => running.workers.push(handle),
                Err(e) => {
                    running.release_workers();
                    return Err(e);
                }
            }
        }

        info!(
            "Started {} workers (attempts={}, base_delay={:?}, multiplier={})",
            running.workers.len(),
            self.config.attempts,
            self.config.base_delay(),
            self.config.backoff_multiplier
        );
        Ok(running)
    }

    /// Run `tasks` through the pool: producer on its own thread, then the coordinator.
    pub fn run<I>(&self, tasks: I, sinks: Vec<Box<dyn Sink>>) -> Result<PipelineReport>
    where
        I: IntoIterator<Item = Task> + Send + 'static,
    {
        let running = self.start(sinks)?;
        let producer = running.producer();

        let producer = match thread::Builder::new()
            .name(format!("{}-producer", self.config.thread_name_prefix))
            .spawn(move || producer.run(tasks))
        {
            Ok(handle) => handle,
            Err(e) => {
                running.release_workers();
                return Err(PipelineError::Spawn(e));
            }
        };
        let submitted = match producer.join() {
            Ok(submitted) => submitted,
            Err(_) => {
                running.release_workers();
                return Err(PipelineError::ProducerPanic);
            }
        };

        running.finish(submitted)
    }

    /// Like [`run`](Self::run), writing results to `output_dir/<worker_id>`
    pub fn run_to_files<I>(&self, tasks: I) -> Result<PipelineReport>
    where
        I: IntoIterator<Item = Task> + Send + 'static,
    {
        let sinks = FileSink::for_workers(&self.config.output_dir, self.config.worker_count)?
            .into_iter()
            .map(|(_, sink)| Box::new(sink) as Box<dyn Sink>)
            .collect();

        self.run(tasks, sinks)
    }
}

/// A started worker pool waiting for its producer to finish
pub struct RunningPipeline {
    input: Arc<ClosableQueue<Task>>,
    quarantine: Arc<ClosableQueue<QuarantineRecord>>,
    workers: Vec<WorkerHandle>,
    finished: Vec<WorkerReport>,
    quarantine_report: Option<PathBuf>,
}

impl RunningPipeline {
    pub fn input(&self) -> &Arc<ClosableQueue<Task>> {
        &self.input
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len() + self.finished.len()
    }

    /// A producer that closes the input queue once per worker
    pub fn producer(&self) -> Producer {
        Producer::new(self.input.clone(), self.worker_count())
    }

    /// Coordinate shutdown after the producer has enqueued `submitted` tasks and closed.
    ///
    /// Joins the input queue, then every worker, then closes, drains and
    /// joins the quarantine queue.
    pub fn finish(mut self, submitted: usize) -> Result<PipelineReport> {
        self.join_input()?;

        for handle in std::mem::take(&mut self.workers) {
            self.finished.push(handle.join()?);
        }
        let mut workers = std::mem::take(&mut self.finished);
        workers.sort_by_key(|report| report.worker_id);

        self.quarantine.close();
        let quarantined = self
            .quarantine
            .iter()
            .collect::<std::result::Result<Vec<_>, QueueError>>()?;
        self.report_quarantine(&quarantined)?;
        self.quarantine.join();

        let succeeded = workers.iter().map(|w| w.succeeded).sum();
        if succeeded + quarantined.len() != submitted {
            error!(
                "Task accounting mismatch: {} submitted, {} succeeded, {} quarantined",
                submitted,
                succeeded,
                quarantined.len()
            );
            return Err(PipelineError::Accounting {
                submitted,
                succeeded,
                quarantined: quarantined.len(),
            });
        }

        info!(
            "Pipeline finished: {} submitted, {} succeeded, {} quarantined",
            submitted,
            succeeded,
            quarantined.len()
        );
        Ok(PipelineReport {
            submitted,
            succeeded,
            quarantined,
            workers,
        })
    }

    /// Send one shutdown marker per live worker so none stays blocked in `get`
    fn release_workers(&self) {
        for _ in 0..self.workers.len() {
            self.input.close();
        }
    }

    /// Wait for the input queue to drain, surfacing workers that die on the way
    fn join_input(&mut self) -> Result<()> {
        while !self.input.join_timeout(WORKER_POLL_INTERVAL) {
            let mut i = 0;
            while i < self.workers.len() {
                if self.workers[i].is_finished() {
                    let handle = self.workers.swap_remove(i);
                    self.finished.push(handle.join()?);
                } else {
                    i += 1;
                }
            }

            // No consumer is left to acknowledge what remains
            if self.workers.is_empty() && self.input.unfinished() > 0 {
                let remaining = self.input.unfinished();
                error!("All workers exited with {} messages unacknowledged", remaining);
                return Err(QueueError::Stranded(remaining).into());
            }
        }
        Ok(())
    }

    fn report_quarantine(&self, records: &[QuarantineRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        warn!("{} tasks quarantined after exhausting retries", records.len());
        for record in records {
            warn!(
                "Quarantined task {} (worker {}, {} attempts): {} payload={}",
                record.task.id(),
                record.worker_id,
                record.attempts,
                record.last_error,
                record.task
            );
        }

        if let Some(path) = &self.quarantine_report {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            write_ndjson(records, BufWriter::new(file))?;
            info!("Wrote {} quarantine records to {}", records.len(), path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EchoHandler;
    use crate::sink::MemorySink;

    fn pipeline(workers: usize) -> Pipeline {
        let config = PipelineConfig {
            worker_count: workers,
            ..Default::default()
        };
        Pipeline::new(config, Arc::new(EchoHandler)).unwrap()
    }

    fn sinks(count: usize) -> Vec<Box<dyn Sink>> {
        (0..count)
            .map(|_| Box::new(MemorySink::new()) as Box<dyn Sink>)
            .collect()
    }

    #[test]
    fn test_release_workers_unblocks_idle_pool() {
        let running = pipeline(3).start(sinks(3)).unwrap();
        assert_eq!(running.worker_count(), 3);

        running.release_workers();

        assert!(running.input().join_timeout(Duration::from_secs(5)));
        let report = running.finish(0).unwrap();
        assert_eq!(report.workers.len(), 3);
        assert!(report.workers.iter().all(|w| w.processed() == 0));
    }

    #[test]
    fn test_release_workers_after_partial_input() {
        let running = pipeline(2).start(sinks(2)).unwrap();
        running.input().put(Task::builder().arg(1).build());

        running.release_workers();

        let report = running.finish(1).unwrap();
        assert_eq!(report.succeeded, 1);
    }
}
