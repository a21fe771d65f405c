pub mod config;
pub mod executor;
pub mod handler;
pub mod metrics;
pub mod pipeline;
pub mod producer;
pub mod sink;
pub mod worker;

pub use config::PipelineConfig;
pub use executor::RetryingHandler;
pub use handler::{TaskHandler, TaskResult};
pub use metrics::PipelineMetrics;
pub use pipeline::{Pipeline, PipelineReport, RunningPipeline};
pub use producer::Producer;
pub use sink::{FileSink, MemorySink, Sink};
pub use worker::{Worker, WorkerHandle, WorkerReport};
