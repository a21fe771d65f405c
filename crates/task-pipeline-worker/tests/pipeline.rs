// Integration tests for the worker pool, producer and coordinator

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use task_pipeline_core::{
    read_ndjson, ClosableQueue, PipelineError, QuarantineReason, QuarantineRecord,
    RecordingSleeper, RetryPolicy, Task, TaskId,
};
use task_pipeline_worker::handler::{EchoHandler, FailingHandler};
use task_pipeline_worker::{
    MemorySink, Pipeline, PipelineConfig, PipelineMetrics, RetryingHandler, Sink, TaskHandler,
    TaskResult, Worker,
};

fn config(workers: usize, attempts: u32) -> PipelineConfig {
    PipelineConfig {
        worker_count: workers,
        attempts,
        base_delay_ms: 10,
        backoff_multiplier: 2.0,
        progress_log_interval: 5,
        ..Default::default()
    }
}

fn numbered_task(n: usize) -> Task {
    Task::builder()
        .arg("https://httpbin.org/get")
        .kwarg("params", json!({ "output": n.to_string() }))
        .build()
}

fn memory_sinks(count: usize) -> (Vec<MemorySink>, Vec<Box<dyn Sink>>) {
    let sinks: Vec<MemorySink> = (0..count).map(|_| MemorySink::new()).collect();
    let boxed = sinks
        .iter()
        .map(|s| Box::new(s.clone()) as Box<dyn Sink>)
        .collect();
    (sinks, boxed)
}

fn all_lines(sinks: &[MemorySink]) -> Vec<String> {
    let mut lines: Vec<String> = sinks.iter().flat_map(|s| s.lines()).collect();
    lines.sort();
    lines
}

/// Fails every call for outputs in `failing`, and counts calls per task
struct SelectiveHandler {
    failing: HashSet<String>,
    calls: Mutex<HashMap<TaskId, u32>>,
}

impl SelectiveHandler {
    fn new<I: IntoIterator<Item = String>>(failing: I) -> Self {
        SelectiveHandler {
            failing: failing.into_iter().collect(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn calls_for(&self, id: TaskId) -> u32 {
        self.calls.lock().get(&id).copied().unwrap_or(0)
    }
}

impl TaskHandler for SelectiveHandler {
    fn execute(&self, task: &Task) -> TaskResult {
        *self.calls.lock().entry(task.id()).or_insert(0) += 1;
        let output = EchoHandler.execute(task)?;
        if self.failing.contains(&output) {
            Err(format!("{} is unreachable", output))
        } else {
            Ok(output)
        }
    }
}

/// Fails the first `failures` calls for every task, then succeeds
struct RecoveringHandler {
    failures: u32,
    calls: Mutex<HashMap<TaskId, u32>>,
}

impl TaskHandler for RecoveringHandler {
    fn execute(&self, task: &Task) -> TaskResult {
        let mut calls = self.calls.lock();
        let count = calls.entry(task.id()).or_insert(0);
        *count += 1;
        if *count <= self.failures {
            Err(format!("attempt {} failed", count))
        } else {
            EchoHandler.execute(task)
        }
    }
}

#[test]
fn test_always_failing_task_quarantined_once_and_worker_continues() {
    let tasks: Vec<Task> = (0..4).map(numbered_task).collect();
    let doomed = tasks[0].clone();
    let handler = Arc::new(SelectiveHandler::new(["0".to_string()]));
    let sleeper = Arc::new(RecordingSleeper::new());

    let pipeline = Pipeline::new(config(1, 3), handler.clone())
        .unwrap()
        .with_sleeper(sleeper.clone());
    let (sinks, boxed) = memory_sinks(1);

    let report = pipeline.run(tasks, boxed).unwrap();

    assert_eq!(report.submitted, 4);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.quarantined_count(), 1);

    let record = &report.quarantined[0];
    assert_eq!(record.task, doomed);
    assert_eq!(record.reason, QuarantineReason::RetriesExhausted);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.worker_id, 0);
    assert_eq!(handler.calls_for(doomed.id()), 3);

    // The single worker went on to process everything queued after the failure
    assert_eq!(sinks[0].lines(), vec!["1", "2", "3"]);
    assert_eq!(
        sleeper.sleeps(),
        vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
        ]
    );
}

#[test]
fn test_success_on_second_attempt_written_once_after_one_backoff() {
    let handler = Arc::new(RecoveringHandler {
        failures: 1,
        calls: Mutex::new(HashMap::new()),
    });
    let sleeper = Arc::new(RecordingSleeper::new());
    let pipeline = Pipeline::new(config(1, 3), handler.clone())
        .unwrap()
        .with_sleeper(sleeper.clone());
    let (sinks, boxed) = memory_sinks(1);

    let task = numbered_task(42);
    let report = pipeline.run(vec![task.clone()], boxed).unwrap();

    assert_eq!(report.succeeded, 1);
    assert!(report.quarantined.is_empty());
    assert_eq!(sinks[0].lines(), vec!["42"]);
    assert_eq!(sinks[0].flush_count(), 1);
    assert_eq!(sleeper.total(), Duration::from_millis(10));
    assert_eq!(*handler.calls.lock().get(&task.id()).unwrap(), 2);
}

#[test]
fn test_zero_tasks_terminates_immediately() {
    let pipeline = Pipeline::new(config(4, 3), Arc::new(FailingHandler::new("unused"))).unwrap();
    let (sinks, boxed) = memory_sinks(4);

    let report = pipeline.run(Vec::new(), boxed).unwrap();

    assert_eq!(report.submitted, 0);
    assert_eq!(report.succeeded, 0);
    assert!(report.quarantined.is_empty());
    assert_eq!(report.workers.len(), 4);
    assert!(report.workers.iter().all(|w| w.processed() == 0));
    assert!(all_lines(&sinks).is_empty());
}

#[test]
fn test_worker_reports_ordered_by_id() {
    let pipeline = Pipeline::new(config(3, 1), Arc::new(EchoHandler)).unwrap();
    let (_, boxed) = memory_sinks(3);

    let report = pipeline.run((0..30).map(numbered_task).collect::<Vec<_>>(), boxed).unwrap();

    let ids: Vec<usize> = report.workers.iter().map(|w| w.worker_id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(report.workers.iter().map(|w| w.succeeded).sum::<usize>(), 30);
}

#[test]
fn test_started_pool_consumes_before_producer_closes() {
    let pipeline = Pipeline::new(config(2, 1), Arc::new(EchoHandler)).unwrap();
    let (sinks, boxed) = memory_sinks(2);
    let running = pipeline.start(boxed).unwrap();

    running.input().put(numbered_task(1));
    running.input().put(numbered_task(2));

    // Tasks are acknowledged as workers finish them, before anything closes the queue
    assert!(running.input().join_timeout(Duration::from_secs(5)));
    assert_eq!(all_lines(&sinks), vec!["1", "2"]);

    running.input().put(numbered_task(3));
    let producer = running.producer();
    let submitted = producer.run(Vec::new());
    assert_eq!(submitted, 0);

    let report = running.finish(3).unwrap();
    assert_eq!(report.succeeded, 3);
}

#[test]
fn test_fewer_shutdowns_than_workers_leaves_one_running() {
    let input = Arc::new(ClosableQueue::new());
    let quarantine = Arc::new(ClosableQueue::<QuarantineRecord>::new());
    let executor = Arc::new(RetryingHandler::new(
        Arc::new(EchoHandler),
        RetryPolicy::new(1, Duration::ZERO, 1.0).unwrap(),
    ));

    let handles: Vec<_> = (0..3)
        .map(|id| {
            Worker::new(
                id,
                executor.clone(),
                Box::new(MemorySink::new()),
                input.clone(),
                quarantine.clone(),
            )
            .spawn(format!("tp-test-{}", id))
            .unwrap()
        })
        .collect();

    input.put(numbered_task(1));
    input.close();
    input.close();

    // Every message put so far is acknowledged, yet one worker is still blocked in `get`
    assert!(input.join_timeout(Duration::from_secs(5)));
    assert_eq!(input.unfinished(), 0);

    let deadline = Instant::now() + Duration::from_secs(5);
    while handles.iter().filter(|h| h.is_finished()).count() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(100));
    let running = handles.iter().filter(|h| !h.is_finished()).count();
    assert_eq!(running, 1);

    // A third marker releases the last worker
    input.close();
    assert!(input.join_timeout(Duration::from_secs(5)));
    let processed: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap().processed())
        .sum();
    assert_eq!(processed, 1);
}

#[test]
fn test_file_sinks_and_quarantine_report() {
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("quarantine.ndjson");
    let mut config = config(3, 2);
    config.output_dir = dir.path().join("http-requests");
    config.quarantine_report = Some(report_path.clone());

    let failing: Vec<String> = vec!["3".to_string(), "7".to_string()];
    let pipeline = Pipeline::new(config, Arc::new(SelectiveHandler::new(failing)))
        .unwrap()
        .with_sleeper(Arc::new(RecordingSleeper::new()));

    let report = pipeline
        .run_to_files((0..10).map(numbered_task).collect::<Vec<_>>())
        .unwrap();
    assert_eq!(report.succeeded, 8);

    let mut written: Vec<String> = (0..3)
        .flat_map(|i| {
            let path = dir.path().join("http-requests").join(i.to_string());
            std::fs::read_to_string(path)
                .unwrap()
                .lines()
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect();
    written.sort();
    assert_eq!(written, vec!["0", "1", "2", "4", "5", "6", "8", "9"]);

    let file = std::fs::File::open(&report_path).unwrap();
    let records = read_ndjson(io::BufReader::new(file)).unwrap();
    let mut outputs: Vec<String> = records
        .iter()
        .map(|r| EchoHandler.execute(&r.task).unwrap())
        .collect();
    outputs.sort();
    assert_eq!(outputs, vec!["3", "7"]);
    assert!(records.iter().all(|r| r.attempts == 2));
}

#[test]
fn test_metrics_track_outcomes() {
    let metrics = Arc::new(PipelineMetrics::new().unwrap());
    let pipeline = Pipeline::new(config(2, 2), Arc::new(SelectiveHandler::new(["1".to_string()])))
        .unwrap()
        .with_sleeper(Arc::new(RecordingSleeper::new()))
        .with_metrics(metrics.clone());
    let (_, boxed) = memory_sinks(2);

    pipeline
        .run((0..5).map(numbered_task).collect::<Vec<_>>(), boxed)
        .unwrap();

    assert_eq!(metrics.outcome_count("succeeded"), 4);
    assert_eq!(metrics.outcome_count("quarantined"), 1);
    assert_eq!(metrics.attempt_count("ok"), 4);
    assert_eq!(metrics.attempt_count("error"), 2);
    assert_eq!(metrics.workers_active.get(), 0);
}

struct BrokenSink;

impl Sink for BrokenSink {
    fn write_result(&mut self, _result: &str) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "disk full"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_fatal_worker_error_propagates_to_coordinator() {
    let pipeline = Pipeline::new(config(2, 1), Arc::new(EchoHandler)).unwrap();
    let sinks: Vec<Box<dyn Sink>> = vec![Box::new(BrokenSink), Box::new(BrokenSink)];

    let result = pipeline.run((0..4).map(numbered_task).collect::<Vec<_>>(), sinks);

    assert!(matches!(result, Err(PipelineError::Sink { .. })));
}

#[test]
fn test_sink_count_must_match_workers() {
    let pipeline = Pipeline::new(config(3, 1), Arc::new(EchoHandler)).unwrap();
    let (_, boxed) = memory_sinks(2);

    assert!(matches!(pipeline.start(boxed), Err(PipelineError::Config(_))));
}

#[test]
fn test_invalid_config_rejected() {
    assert!(Pipeline::new(config(0, 3), Arc::new(EchoHandler)).is_err());
    assert!(Pipeline::new(config(2, 0), Arc::new(EchoHandler)).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_every_task_ends_in_exactly_one_place(
        count in 0usize..40,
        workers in 1usize..5,
        attempts in 1u32..4,
        failing in proptest::collection::hash_set(0usize..40, 0..10),
    ) {
        let failing_outputs: HashSet<String> = failing
            .iter()
            .filter(|n| **n < count)
            .map(|n| n.to_string())
            .collect();
        let handler = Arc::new(SelectiveHandler::new(failing_outputs.clone()));
        let pipeline = Pipeline::new(config(workers, attempts), handler.clone())
            .unwrap()
            .with_sleeper(Arc::new(RecordingSleeper::new()));
        let (sinks, boxed) = memory_sinks(workers);

        let tasks: Vec<Task> = (0..count).map(numbered_task).collect();
        let report = pipeline.run(tasks, boxed).unwrap();

        let written = all_lines(&sinks);
        prop_assert_eq!(written.len() + report.quarantined.len(), count);
        prop_assert_eq!(report.succeeded, written.len());

        let quarantined: HashSet<String> = report
            .quarantined
            .iter()
            .map(|r| EchoHandler.execute(&r.task).unwrap())
            .collect();
        prop_assert_eq!(&quarantined, &failing_outputs);
        prop_assert_eq!(quarantined.len(), report.quarantined.len());

        for record in &report.quarantined {
            prop_assert_eq!(record.attempts, attempts);
            prop_assert_eq!(handler.calls_for(record.task.id()), attempts);
        }

        let expected: Vec<String> = {
            let mut v: Vec<String> = (0..count)
                .map(|n| n.to_string())
                .filter(|s| !failing_outputs.contains(s))
                .collect();
            v.sort();
            v
        };
        prop_assert_eq!(written, expected);
    }
}
