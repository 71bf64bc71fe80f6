//! Executors that run queue tickets.

use crate::error::{Result, StoreError};
use crossbeam_channel::{unbounded, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use super::serial::QueueConfig;

/// A type-erased unit of work handed to an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs on some thread at some point.
///
/// An executor that can no longer run jobs (for example after shutdown)
/// drops them; the queue resolves the affected ticket as abandoned and
/// moves on.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs every job synchronously on the submitting thread.
///
/// Useful in tests and single-threaded hosts. A job that waits on a handle of
/// its own queue deadlocks under this executor.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Fixed-size pool of named worker threads fed by a channel.
///
/// Dropping the pool closes the channel and joins the workers after they
/// drain the jobs already submitted.
pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    name: String,
}

impl ThreadPool {
    /// Spawn `config.worker_threads` workers.
    pub fn new(config: &QueueConfig) -> Result<Self> {
        let threads = config.worker_threads;
        if threads == 0 {
            return Err(StoreError::InvalidConfig(format!(
                "queue {} needs at least one worker thread",
                config.name
            )));
        }
        let (sender, receiver) = unbounded::<Job>();

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("{}-{}", config.name, index))
                .spawn(move || {
                    for job in receiver.iter() {
                        // Tasks catch their own panics; this keeps the worker
                        // alive if a raw job does not.
                        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::warn!("executor job panicked");
                        }
                    }
                })
                .map_err(|e| StoreError::Executor(e.to_string()))?;
            workers.push(worker);
        }

        tracing::debug!(pool = %config.name, threads, "thread pool started");

        Ok(Self {
            sender: Some(sender),
            workers,
            name: config.name.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) {
        match &self.sender {
            Some(sender) => {
                if sender.send(job).is_err() {
                    tracing::warn!(pool = %self.name, "thread pool is shut down, dropping job");
                }
            }
            None => tracing::warn!(pool = %self.name, "thread pool is shut down, dropping job"),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.sender.take();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last owner may be a job running on one of our own workers.
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
        tracing::debug!(pool = %self.name, "thread pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::time::Duration;

    #[test]
    fn test_inline_runs_immediately() {
        let (tx, rx) = bounded(1);
        InlineExecutor.execute(Box::new(move || tx.send(5).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), 5);
    }

    #[test]
    fn test_pool_runs_jobs_on_named_threads() {
        let pool = ThreadPool::new(&QueueConfig {
            name: "pool-test".into(),
            worker_threads: 2,
        })
        .unwrap();
        assert_eq!(pool.threads(), 2);

        let (tx, rx) = unbounded();
        for _ in 0..4 {
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                let name = thread::current().name().unwrap_or_default().to_string();
                tx.send(name).unwrap();
            }));
        }

        for _ in 0..4 {
            let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert!(name.starts_with("pool-test-"));
        }
    }

    #[test]
    fn test_pool_rejects_zero_workers() {
        let config = QueueConfig {
            name: "empty".into(),
            worker_threads: 0,
        };
        assert!(matches!(
            ThreadPool::new(&config),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_pool_survives_panicking_job() {
        let pool = ThreadPool::new(&QueueConfig::default()).unwrap();
        let (tx, rx) = bounded(1);

        pool.execute(Box::new(|| panic!("job failure")));
        pool.execute(Box::new(move || tx.send(()).unwrap()));

        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_drop_drains_submitted_jobs() {
        let (tx, rx) = unbounded();
        {
            let pool = ThreadPool::new(&QueueConfig::default()).unwrap();
            for i in 0..10 {
                let tx = tx.clone();
                pool.execute(Box::new(move || tx.send(i).unwrap()));
            }
        }
        let got: Vec<i32> = rx.try_iter().collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }
}
