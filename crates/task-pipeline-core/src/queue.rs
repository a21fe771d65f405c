//! Unbounded FIFO queue with a cooperative close protocol.
//!
//! Consumers stop when they dequeue a [`Message::Shutdown`]. Each call to
//! [`ClosableQueue::close`] enqueues exactly one of them, so a pool of `K`
//! consumers needs `K` calls. Every dequeued message, shutdowns included,
//! must be acknowledged with [`ClosableQueue::task_done`] before
//! [`ClosableQueue::join`] returns.

use crate::QueueError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::error;

/// A dequeued entry: either work or the end-of-stream marker for one consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<T> {
    Item(T),
    Shutdown,
}

impl<T> Message<T> {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Message::Shutdown)
    }

    pub fn into_item(self) -> Option<T> {
        match self {
            Message::Item(item) => Some(item),
            Message::Shutdown => None,
        }
    }
}

struct QueueState<T> {
    messages: VecDeque<Message<T>>,
    /// Messages put but not yet acknowledged
    unfinished: usize,
}

pub struct ClosableQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    all_done: Condvar,
}

impl<T> ClosableQueue<T> {
    pub fn new() -> Self {
        ClosableQueue {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                unfinished: 0,
            }),
            not_empty: Condvar::new(),
            all_done: Condvar::new(),
        }
    }

    /// Append an item to the tail. Never blocks.
    pub fn put(&self, item: T) {
        self.push(Message::Item(item));
    }

    /// Enqueue one shutdown marker. Call once per consumer.
    pub fn close(&self) {
        self.push(Message::Shutdown);
    }

    fn push(&self, message: Message<T>) {
        {
            let mut state = self.state.lock();
            state.messages.push_back(message);
            state.unfinished += 1;
        }
        self.not_empty.notify_one();
    }

    /// Remove and return the head, blocking until one is available
    pub fn get(&self) -> Message<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(message) = state.messages.pop_front() {
                return message;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Remove the head without blocking
    pub fn try_get(&self) -> Option<Message<T>> {
        self.state.lock().messages.pop_front()
    }

    /// Acknowledge one dequeued message.
    pub fn task_done(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.unfinished == 0 {
            return Err(QueueError::AckUnderflow);
        }
        state.unfinished -= 1;
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
        Ok(())
    }

    /// Block until every message put so far has been acknowledged
    pub fn join(&self) {
        let mut state = self.state.lock();
        while state.unfinished > 0 {
            self.all_done.wait(&mut state);
        }
    }

    /// Returns `false` if acknowledgments are still outstanding after `timeout`.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.unfinished > 0 {
            if self.all_done.wait_until(&mut state, deadline).timed_out() {
                return state.unfinished == 0;
            }
        }
        true
    }

    /// Number of messages waiting to be dequeued
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of messages put but not yet acknowledged
    pub fn unfinished(&self) -> usize {
        self.state.lock().unfinished
    }

    /// Consume items until a shutdown marker is dequeued.
    ///
    /// Each item is acknowledged when the next one is requested (or when the
    /// iterator is dropped), so `join` cannot return while an item is still
    /// being processed. The shutdown marker is acknowledged immediately.
    pub fn iter(&self) -> Consumer<'_, T> {
        Consumer {
            queue: self,
            in_flight: false,
            finished: false,
        }
    }
}

impl<T> Default for ClosableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ClosableQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ClosableQueue")
            .field("len", &state.messages.len())
            .field("unfinished", &state.unfinished)
            .finish()
    }
}

impl<'a, T> IntoIterator for &'a ClosableQueue<T> {
    type Item = Result<T, QueueError>;
    type IntoIter = Consumer<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator returned by [`ClosableQueue::iter`]
pub struct Consumer<'a, T> {
    queue: &'a ClosableQueue<T>,
    in_flight: bool,
    finished: bool,
}

impl<T> Consumer<'_, T> {
    fn ack_in_flight(&mut self) -> Result<(), QueueError> {
        if self.in_flight {
            self.in_flight = false;
            self.queue.task_done()?;
        }
        Ok(())
    }
}

impl<T> Iterator for Consumer<'_, T> {
    type Item = Result<T, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if let Err(e) = self.ack_in_flight() {
            self.finished = true;
            return Some(Err(e));
        }

        match self.queue.get() {
            Message::Item(item) => {
                self.in_flight = true;
                Some(Ok(item))
            }
            Message::Shutdown => {
                self.finished = true;
                match self.queue.task_done() {
                    Ok(()) => None,
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }
}

impl<T> Drop for Consumer<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.ack_in_flight() {
            error!("Failed to acknowledge in-flight item on consumer drop: {}", e);
        }
    }
}
