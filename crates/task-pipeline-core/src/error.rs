use crate::Task;
use thiserror::Error;

/// Errors raised by the closable queue when its acknowledgment protocol is broken.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("task_done() called more times than items were dequeued")]
    AckUnderflow,

    #[error("{0} messages left in the queue with no consumer to acknowledge them")]
    Stranded(usize),
}

/// A task failed on every one of its allowed attempts.
#[derive(Error, Debug, Clone)]
#[error("task {} failed after {attempts} attempts: {last_error}", .task.id())]
pub struct ExceededRetriesError {
    pub task: Task,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Queue protocol violated: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Sink for worker {worker_id} failed: {source}")]
    Sink {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {0} panicked")]
    WorkerPanic(usize),

    #[error("Producer panicked")]
    ProducerPanic,

    #[error("Task accounting mismatch: {submitted} submitted, {succeeded} succeeded, {quarantined} quarantined")]
    Accounting {
        submitted: usize,
        succeeded: usize,
        quarantined: usize,
    },

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PipelineError::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
