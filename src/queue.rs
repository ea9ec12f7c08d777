use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Unbounded FIFO queue feeding one stage's worker pool.
///
/// Back-pressure is implicit: the submission handler blocks on its reply
/// channels, so slow stages slow intake without the queue itself bounding.
pub struct JobQueue<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JobQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, job: T) {
        self.queue.lock().unwrap().push_back(job);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> T {
        loop {
            if let Some(job) = self.queue.lock().unwrap().pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
