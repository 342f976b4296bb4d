//! Fixed-size worker pool draining a [`TaskQueue`].

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::queue::{Task, TaskQueue};

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers named `sluice-worker-{i}`, each looping on
    /// [`TaskQueue::pop_next`] and handing every task to `run`.
    pub fn spawn<F>(threads: usize, queue: Arc<TaskQueue>, run: F) -> io::Result<Self>
    where
        F: Fn(Task) + Send + Sync + 'static,
    {
        let run = Arc::new(run);
        let mut handles = Vec::with_capacity(threads);

        for i in 0..threads.max(1) {
            let worker_queue = queue.clone();
            let run = run.clone();
            let spawned = thread::Builder::new()
                .name(format!("sluice-worker-{i}"))
                .spawn(move || {
                    while let Some(task) = worker_queue.pop_next() {
                        run(task);
                    }
                    debug!(worker = i, "worker exiting");
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Stop the workers already running before reporting.
                    queue.shutdown();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { handles })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit. The queue must already be shut down.
    pub fn join(self) {
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!(worker = %name, "worker panicked");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
