mod error;
mod queue;
mod quarantine;
mod retry;
mod task;

pub use error::{ExceededRetriesError, PipelineError, QueueError, Result};
pub use queue::{ClosableQueue, Consumer, Message};
pub use quarantine::{read_ndjson, write_ndjson, QuarantineReason, QuarantineRecord};
pub use retry::{RecordingSleeper, RetryPolicy, RetryState, Sleeper, ThreadSleeper};
pub use task::{Task, TaskArgs, TaskBuilder, TaskId, TaskKwargs};
