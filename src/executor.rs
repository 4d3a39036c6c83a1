//! Handler execution off the event loop.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::thread::JoinHandle;

/// A unit of handler work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs user handlers away from the connection's event loop.
///
/// `execute` hands the task back when the executor is saturated so the
/// caller can apply its rejection policy.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task) -> Result<(), Task>;
}

/// Fixed-size worker pool over a bounded queue.
pub struct ThreadPoolExecutor {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    /// Spawn `workers` threads sharing a queue of `queue_depth` tasks.
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let (sender, receiver) = bounded::<Task>(queue_depth);
        let workers = (0..workers.max(1))
            .map(|i| {
                let receiver: Receiver<Task> = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("exchange-worker-{}", i))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            task();
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) -> Result<(), Task> {
        let sender = match &self.sender {
            Some(sender) => sender,
            None => return Err(task),
        };
        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => Err(task),
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        // Disconnect the queue so workers drain and exit.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_executes_tasks() {
        let pool = ThreadPoolExecutor::new(2, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = counter.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .map_err(|_| "execute failed")
            .unwrap();
        }

        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_rejects_when_saturated() {
        let pool = ThreadPoolExecutor::new(1, 1);
        let gate = Arc::new(std::sync::Barrier::new(2));

        // Occupy the single worker.
        let held = gate.clone();
        pool.execute(Box::new(move || {
            held.wait();
        }))
        .map_err(|_| "execute failed")
        .unwrap();

        // Fill the queue, then overflow it.
        std::thread::sleep(Duration::from_millis(20));
        let _ = pool.execute(Box::new(|| {}));
        let overflow = pool.execute(Box::new(|| {}));
        assert!(overflow.is_err());

        gate.wait();
    }
}
