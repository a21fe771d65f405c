use rand::Rng;
use serde_json::Value;
use task_pipeline_core::Task;

/// Result type for task handlers: one line of text on success, an error message otherwise
pub type TaskResult = Result<String, String>;

/// The per-task operation run by every worker.
///
/// Implementations may fail arbitrarily; failures are retried by the
/// pipeline and never stop a worker.
pub trait TaskHandler: Send + Sync {
    fn execute(&self, task: &Task) -> TaskResult;
}

impl<F> TaskHandler for F
where
    F: Fn(&Task) -> TaskResult + Send + Sync,
{
    fn execute(&self, task: &Task) -> TaskResult {
        self(task)
    }
}

/// Returns `kwargs.params.output` when present, otherwise the task payload.
///
/// Mirrors an HTTP echo service that reflects query parameters back.
pub struct EchoHandler;

impl TaskHandler for EchoHandler {
    fn execute(&self, task: &Task) -> TaskResult {
        let output = task
            .kwarg("params")
            .and_then(|params| params.get("output"))
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });

        Ok(output.unwrap_or_else(|| task.to_string()))
    }
}

/// Wraps a handler and fails a random fraction of invocations
pub struct FlakyHandler<H> {
    inner: H,
    failure_rate: f64,
}

impl<H: TaskHandler> FlakyHandler<H> {
    pub fn new(inner: H, failure_rate: f64) -> Self {
        FlakyHandler {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

impl<H: TaskHandler> TaskHandler for FlakyHandler<H> {
    fn execute(&self, task: &Task) -> TaskResult {
        if rand::thread_rng().gen_bool(self.failure_rate) {
            return Err("simulated transient failure".to_string());
        }
        self.inner.execute(task)
    }
}

/// Always fails with the given message
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    pub fn new<S: Into<String>>(message: S) -> Self {
        FailingHandler {
            message: message.into(),
        }
    }
}

impl TaskHandler for FailingHandler {
    fn execute(&self, _task: &Task) -> TaskResult {
        Err(self.message.clone())
    }
}
