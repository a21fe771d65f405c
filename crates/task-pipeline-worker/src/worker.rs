use crate::executor::RetryingHandler;
use crate::metrics::PipelineMetrics;
use crate::sink::Sink;
use task_pipeline_core::{
    ClosableQueue, ExceededRetriesError, PipelineError, QuarantineRecord, Result, Task,
};

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

pub type WorkerId = usize;

/// What one worker did before it observed its shutdown marker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: WorkerId,
    pub succeeded: usize,
    pub quarantined: usize,
}

impl WorkerReport {
    fn new(worker_id: WorkerId) -> Self {
        WorkerReport {
            worker_id,
            ..Default::default()
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.quarantined
    }
}

/// Consumes tasks from the shared input queue until it dequeues a shutdown marker
pub struct Worker {
    id: WorkerId,
    executor: Arc<RetryingHandler>,
    sink: Box<dyn Sink>,
    input: Arc<ClosableQueue<Task>>,
    quarantine: Arc<ClosableQueue<QuarantineRecord>>,
    progress_log_interval: usize,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        executor: Arc<RetryingHandler>,
        sink: Box<dyn Sink>,
        input: Arc<ClosableQueue<Task>>,
        quarantine: Arc<ClosableQueue<QuarantineRecord>>,
    ) -> Self {
        Worker {
            id,
            executor,
            sink,
            input,
            quarantine,
            progress_log_interval: 0,
            metrics: None,
        }
    }

    pub fn with_progress_log_interval(mut self, interval: usize) -> Self {
        self.progress_log_interval = interval;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Run the worker on a named thread
    pub fn spawn(self, name: String) -> Result<WorkerHandle> {
        let id = self.id;
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(PipelineError::Spawn)?;

        Ok(WorkerHandle {
            id,
            thread: Some(thread),
        })
    }

    /// Process tasks until shutdown.
    ///
    /// Task failures are quarantined and never end the loop; sink and queue
    /// errors are returned.
    pub fn run(mut self) -> Result<WorkerReport> {
        info!("Starting worker {}", self.id);
        if let Some(metrics) = &self.metrics {
            metrics.workers_active.inc();
        }

        let result = self.process_all();

        if let Some(metrics) = &self.metrics {
            metrics.workers_active.dec();
        }
        match &result {
            Ok(report) => info!(
                "Worker {} shutting down: {} succeeded, {} quarantined",
                self.id, report.succeeded, report.quarantined
            ),
            Err(e) => warn!("Worker {} stopped on fatal error: {}", self.id, e),
        }
        result
    }

    fn process_all(&mut self) -> Result<WorkerReport> {
        let input = self.input.clone();
        let mut report = WorkerReport::new(self.id);

        for task in input.iter() {
            let task = task?;
            self.execute_task(task, &mut report)?;

            if self.progress_log_interval > 0 && report.processed() % self.progress_log_interval == 0 {
                info!(
                    "Worker {} progress: {} processed ({} succeeded, {} quarantined)",
                    self.id,
                    report.processed(),
                    report.succeeded,
                    report.quarantined
                );
            }
        }

        Ok(report)
    }

    /// Execute a task
    fn execute_task(&mut self, task: Task, report: &mut WorkerReport) -> Result<()> {
        let start = Instant::now();
        debug!("Worker {} executing task {}", self.id, task.id());

        match self.executor.execute(&task) {
            Ok(result) => {
                self.report_success(&result)?;
                report.succeeded += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_success(start.elapsed());
                }
            }
            Err(exhausted) => {
                self.report_failure(exhausted);
                report.quarantined += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_quarantine(start.elapsed());
                }
            }
        }

        Ok(())
    }

    /// Write a result and flush it right away
    fn report_success(&mut self, result: &str) -> Result<()> {
        let worker_id = self.id;
        self.sink
            .write_result(result)
            .and_then(|()| self.sink.flush())
            .map_err(|source| PipelineError::Sink { worker_id, source })
    }

    /// Move an exhausted task to the quarantine queue
    fn report_failure(&self, exhausted: ExceededRetriesError) {
        warn!("Worker {} quarantining task: {}", self.id, exhausted);
        self.quarantine
            .put(QuarantineRecord::from_exhausted(exhausted, self.id));
    }
}

/// Join handle for a spawned worker
pub struct WorkerHandle {
    id: WorkerId,
    thread: Option<JoinHandle<Result<WorkerReport>>>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// True once the worker thread has exited (or has already been joined)
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Block until the worker exits; a panic becomes [`PipelineError::WorkerPanic`]
    pub fn join(mut self) -> Result<WorkerReport> {
        self.take_result()
    }

    fn take_result(&mut self) -> Result<WorkerReport> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| PipelineError::WorkerPanic(self.id))?,
            None => Err(PipelineError::WorkerPanic(self.id)),
        }
    }
}
