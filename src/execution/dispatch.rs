//! Instance Dispatch
//!
//! The engine never runs a state on the thread that produced the work
//! (a notify caller, a timer, a parent resuming). It hands a job to a
//! [`Dispatcher`] instead.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, info};

/// A unit of engine work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs engine jobs.
pub trait Dispatcher: Send + Sync {
    fn submit(&self, job: Job);
}

/// Runs each job to completion on the submitting thread.
///
/// Deterministic; nested submissions run depth-first.
#[derive(Debug, Clone, Default)]
pub struct InlineDispatcher;

impl InlineDispatcher {
    pub fn new() -> Self {
        Self
    }
}

impl Dispatcher for InlineDispatcher {
    fn submit(&self, job: Job) {
        job();
    }
}

/// Fixed set of worker threads fed through a channel.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `size` workers (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx): (Sender<Job>, Receiver<Job>) = channel();
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size)
            .filter_map(|index| {
                let rx = Arc::clone(&rx);
                thread::Builder::new()
                    .name(format!("stateflow-worker-{}", index))
                    .spawn(move || worker_loop(index, rx))
                    .map_err(|e| error!("Failed to spawn worker {}: {}", index, e))
                    .ok()
            })
            .collect::<Vec<_>>();

        info!("Worker pool started with {} thread(s)", workers.len());

        Self {
            sender: Mutex::new(Some(tx)),
            workers,
        }
    }

    /// One worker per CPU.
    pub fn with_cpu_count() -> Self {
        Self::new(num_cpus::get())
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

fn worker_loop(index: usize, rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rx.recv()
        };

        match job {
            Ok(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Job panicked on worker {}", index);
                }
            }
            Err(_) => {
                debug!("Worker {} shutting down", index);
                break;
            }
        }
    }
}

impl Dispatcher for WorkerPool {
    fn submit(&self, job: Job) {
        let sender = self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match sender.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.send(job) {
                    error!("Failed to submit job: {}", e);
                }
            }
            None => error!("Job submitted after worker pool shutdown"),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets every worker drain and exit.
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // A job may hold the last handle to the pool.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Worker thread panicked during shutdown");
            }
        }
    }
}
