use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::queue::{EventQueue, OverflowPolicy, QueueError};

/// Consumer side of a [`Dispatcher`].
pub trait EventHandler<T>: Send + Sync {
    fn handle(&self, event: T);
}

impl<T, F> EventHandler<T> for F
where
    F: Fn(T) + Send + Sync,
{
    fn handle(&self, event: T) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub capacity: usize,
    /// Number of consumer threads. `1` gives strictly ordered handling.
    pub workers: usize,
    pub overflow: OverflowPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            workers: 1,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// An [`EventQueue`] drained by one or more named worker threads.
pub struct Dispatcher<T: Send + 'static> {
    name: String,
    queue: Arc<EventQueue<T>>,
    workers: Vec<JoinHandle<()>>,
    worker_count: usize,
}

impl<T: Send + 'static> Dispatcher<T> {
    pub fn spawn(
        name: &str,
        config: DispatcherConfig,
        handler: Arc<dyn EventHandler<T>>,
    ) -> io::Result<Self> {
        let queue = Arc::new(EventQueue::new(name, config.capacity, config.overflow));
        let worker_count = config.workers.max(1);

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let thread_name = format!("{name} {i}");
            let worker_queue = queue.clone();
            let handler = handler.clone();
            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&thread_name, &worker_queue, handler.as_ref()));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    queue.close();
                    join_all(name, &mut workers);
                    return Err(err);
                }
            }
        }
        tracing::debug!(dispatcher = name, workers = worker_count, "dispatcher started");

        Ok(Self {
            name: name.to_string(),
            queue,
            workers,
            worker_count,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&self, event: T) -> Result<Option<T>, QueueError<T>> {
        self.queue.push(event)
    }

    pub fn queue(&self) -> &Arc<EventQueue<T>> {
        &self.queue
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Close the queue, let workers handle what is left, and join them. Idempotent.
    pub fn stop(&mut self) {
        self.queue.close();
        join_all(&self.name, &mut self.workers);
    }

    /// Close the queue and discard pending events without handling them. Returns how many were
    /// discarded.
    pub fn abort(&mut self) -> usize {
        self.queue.close();
        let dropped = self.queue.flush();
        if dropped > 0 {
            tracing::debug!(dispatcher = %self.name, dropped, "dispatcher aborted with pending events");
        }
        join_all(&self.name, &mut self.workers);
        dropped
    }
}

impl<T: Send + 'static> Drop for Dispatcher<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: Send + 'static> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("worker_count", &self.worker_count)
            .field("running", &!self.workers.is_empty())
            .finish()
    }
}

fn worker_loop<T>(thread_name: &str, queue: &EventQueue<T>, handler: &dyn EventHandler<T>) {
    while let Some(event) = queue.pop_wait() {
        if panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))).is_err() {
            tracing::warn!(thread = thread_name, "event handler panicked; continuing");
        }
    }
    tracing::trace!(thread = thread_name, "worker exiting");
}

fn join_all(name: &str, workers: &mut Vec<JoinHandle<()>>) {
    for handle in workers.drain(..) {
        if handle.join().is_err() {
            tracing::warn!(dispatcher = name, "worker thread panicked");
        }
    }
}
