//! Fixed-size worker pool
//!
//! Workers pull jobs from a bounded [`Queue`] and push each job's output to
//! an unbounded completion queue. Outputs are only ever handled on the
//! caller's thread, through [`ThreadPool::complete`].

use crate::queue::Queue;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// How often idle workers check for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Unit of work run on a pool worker
pub trait Job: Send + 'static {
    type Output: Send + 'static;

    fn run(self) -> Self::Output;
}

pub struct ThreadPool<J: Job> {
    jobs: Queue<J>,
    completed: Queue<J::Output>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    panicked: Arc<AtomicUsize>,
}

impl<J: Job> ThreadPool<J> {
    /// Start `threads` workers; at most `queue_depth` jobs wait for one
    pub fn new(threads: usize, queue_depth: usize, name: &str) -> std::io::Result<Self> {
        let jobs: Queue<J> = Queue::new(queue_depth);
        let completed = Queue::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let panicked = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let jobs = jobs.clone();
            let completed = completed.clone();
            let shutdown = Arc::clone(&shutdown);
            let counters = Counters {
                in_flight: Arc::clone(&in_flight),
                panicked: Arc::clone(&panicked),
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(jobs, completed, shutdown, counters))?;
            workers.push(handle);
        }

        debug!("Started pool {} with {} workers", name, workers.len());
        Ok(ThreadPool {
            jobs,
            completed,
            workers,
            shutdown,
            in_flight,
            panicked,
        })
    }

    /// Enqueue a job, waiting up to `timeout` for room
    ///
    /// The job is handed back on timeout or after `join`.
    pub fn schedule(&self, job: J, timeout: Duration) -> Result<(), J> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(job);
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.jobs.put(job, timeout).inspect_err(|_| {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        })
    }

    /// Hand every finished job's output to `f`, on this thread
    ///
    /// Returns how many outputs were processed. Never blocks.
    pub fn complete<F: FnMut(J::Output)>(&self, mut f: F) -> usize {
        let mut count = 0;
        while let Some(output) = self.completed.try_get() {
            f(output);
            count += 1;
        }
        count
    }

    /// Jobs scheduled whose output has not been produced yet
    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Jobs that panicked instead of producing an output
    pub fn panicked(&self) -> usize {
        self.panicked.load(Ordering::Acquire)
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting jobs, let workers drain the queue, and wait for them
    pub fn join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!("Pool worker {} panicked", name);
            }
        }
    }
}

impl<J: Job> Drop for ThreadPool<J> {
    fn drop(&mut self) {
        self.join();
    }
}

struct Counters {
    in_flight: Arc<AtomicUsize>,
    panicked: Arc<AtomicUsize>,
}

/// Takes a job off the in-flight count however the job ends
struct Finished<'a>(&'a AtomicUsize);

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn worker_loop<J: Job>(
    jobs: Queue<J>,
    completed: Queue<J::Output>,
    shutdown: Arc<AtomicBool>,
    counters: Counters,
) {
    loop {
        match jobs.get(POLL_INTERVAL) {
            Some(job) => {
                let _finished = Finished(&counters.in_flight);
                match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
                    Ok(output) => {
                        // The completion queue is unbounded, so this cannot time out
                        let _ = completed.put(output, Duration::ZERO);
                    }
                    Err(_) => {
                        counters.panicked.fetch_add(1, Ordering::AcqRel);
                        error!(
                            "Job on {} panicked",
                            thread::current().name().unwrap_or("worker")
                        );
                    }
                }
            }
            None if shutdown.load(Ordering::Acquire) => break,
            None => {}
        }
    }
}
