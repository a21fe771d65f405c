use std::sync::Arc;
use task_pipeline_core::{ClosableQueue, Task};
use tracing::info;

/// Feeds the input queue and then broadcasts one shutdown marker per consumer
pub struct Producer {
    queue: Arc<ClosableQueue<Task>>,
    consumers: usize,
}

impl Producer {
    pub fn new(queue: Arc<ClosableQueue<Task>>, consumers: usize) -> Self {
        Producer { queue, consumers }
    }

    /// Enqueue every task in iteration order, then close once per consumer.
    ///
    /// Returns the number of tasks enqueued.
    pub fn run<I>(self, tasks: I) -> usize
    where
        I: IntoIterator<Item = Task>,
    {
        let mut submitted = 0;
        for task in tasks {
            self.queue.put(task);
            submitted += 1;
        }

        for _ in 0..self.consumers {
            self.queue.close();
        }

        info!(
            "Producer enqueued {} tasks and closed the queue for {} consumers",
            submitted, self.consumers
        );
        submitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use task_pipeline_core::Message;

    #[test]
    fn test_tasks_precede_shutdown_markers() {
        let queue = Arc::new(ClosableQueue::new());
        let tasks: Vec<Task> = (0..3).map(|i| Task::builder().arg(i).build()).collect();

        let submitted = Producer::new(queue.clone(), 2).run(tasks.clone());

        assert_eq!(submitted, 3);
        for task in tasks {
            assert_eq!(queue.try_get(), Some(Message::Item(task)));
        }
        assert_eq!(queue.try_get(), Some(Message::Shutdown));
        assert_eq!(queue.try_get(), Some(Message::Shutdown));
        assert_eq!(queue.try_get(), None);
    }

    #[test]
    fn test_no_tasks_still_closes() {
        let queue = Arc::new(ClosableQueue::new());
        assert_eq!(Producer::new(queue.clone(), 3).run(Vec::new()), 0);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.unfinished(), 3);
    }
}
