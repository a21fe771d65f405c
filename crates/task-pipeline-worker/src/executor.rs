use crate::handler::{TaskHandler, TaskResult};
use crate::metrics::PipelineMetrics;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use task_pipeline_core::{ExceededRetriesError, RetryPolicy, Sleeper, Task, ThreadSleeper};

/// Task executor with retry and backoff.
///
/// One instance is shared by every worker; each call to
/// [`execute`](Self::execute) keeps its own retry state.
pub struct RetryingHandler {
    handler: Arc<dyn TaskHandler>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl RetryingHandler {
    pub fn new(handler: Arc<dyn TaskHandler>, policy: RetryPolicy) -> Self {
        RetryingHandler {
            handler,
            policy,
            sleeper: Arc::new(ThreadSleeper),
            metrics: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute a task, retrying failures according to the policy
    pub fn execute(&self, task: &Task) -> Result<String, ExceededRetriesError> {
        let sleeper = ObservedSleeper {
            inner: self.sleeper.as_ref(),
            metrics: self.metrics.as_deref(),
        };

        self.policy.run(task, &sleeper, |task| {
            let result = self.execute_once(task);
            if let Some(metrics) = &self.metrics {
                metrics.record_attempt(result.is_ok());
            }
            result
        })
    }

    /// Execute with panic recovery: a panicking handler counts as a failed attempt
    fn execute_once(&self, task: &Task) -> TaskResult {
        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.execute(task))) {
            Ok(result) => result,
            Err(payload) => Err(format!("handler panicked: {}", panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

struct ObservedSleeper<'a> {
    inner: &'a dyn Sleeper,
    metrics: Option<&'a PipelineMetrics>,
}

impl Sleeper for ObservedSleeper<'_> {
    fn sleep(&self, duration: Duration) {
        if let Some(metrics) = self.metrics {
            metrics.record_backoff(duration);
        }
        self.inner.sleep(duration);
    }
}
