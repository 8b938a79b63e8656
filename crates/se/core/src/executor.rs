//! Bounded worker pool for blocking native calls
//!
//! Jobs are fed to a fixed set of named worker threads through a bounded
//! channel. A full queue rejects the submission instead of blocking the
//! caller. Every job carries a [`CancellationToken`]; cancellation is
//! cooperative and only affects jobs that have not started yet.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::SeError;

/// Cooperative cancellation flag, optionally chained to a parent
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancellationToken>>,
}

impl CancellationToken {
    /// Create a new root token
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that is also cancelled when `self` is
    pub fn child_token(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Cancel this token and all of its children
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether this token or one of its ancestors was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.is_cancelled())
    }
}

/// A unit of work for the pool
pub(crate) trait Job: Send {
    /// Run the job on a worker
    fn run(self: Box<Self>, token: &CancellationToken);

    /// The job will never run; resolve it with `error`
    fn reject(self: Box<Self>, error: SeError);
}

struct Envelope {
    job: Box<dyn Job>,
    token: CancellationToken,
}

/// Reason a job was not accepted by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Every worker is busy and the queue is at capacity
    #[error("Task queue is full")]
    Full,
    /// The pool has been shut down
    #[error("Task executor is shut down")]
    ShutDown,
}

impl From<SubmitError> for SeError {
    fn from(error: SubmitError) -> Self {
        Self::unknown(error.to_string())
    }
}

/// A job handed back by a rejected submission
pub(crate) struct Rejected {
    pub(crate) reason: SubmitError,
    pub(crate) job: Box<dyn Job>,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// Fixed size pool of worker threads
pub(crate) struct TaskExecutor {
    sender: Mutex<Option<Sender<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    root: CancellationToken,
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("workers", &self.workers.lock().len())
            .field("cancelled", &self.root.is_cancelled())
            .finish()
    }
}

impl TaskExecutor {
    /// Start `threads` workers sharing a queue of `capacity` jobs
    pub(crate) fn new(threads: usize, capacity: usize, name: &str) -> Result<Self, SeError> {
        let (sender, receiver) = bounded::<Envelope>(capacity);
        let mut workers = Vec::with_capacity(threads.max(1));

        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || Self::worker_loop(receiver))
                .map_err(|e| SeError::unknown(format!("Thread creation failed: {e}")))?;
            workers.push(handle);
        }
        debug!(threads = workers.len(), capacity, "Task executor started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            root: CancellationToken::new(),
        })
    }

    fn worker_loop(receiver: Receiver<Envelope>) {
        for Envelope { job, token } in receiver.iter() {
            trace!("Worker picked up job");
            if panic::catch_unwind(AssertUnwindSafe(|| job.run(&token))).is_err() {
                error!("Worker job panicked");
            }
        }
        trace!("Worker exiting");
    }

    /// Token that every job token descends from
    pub(crate) const fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Queue `job`, handing it back if the pool cannot take it
    pub(crate) fn submit(
        &self,
        token: CancellationToken,
        job: Box<dyn Job>,
    ) -> Result<(), Rejected> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(Rejected {
                reason: SubmitError::ShutDown,
                job,
            });
        };

        match sender.try_send(Envelope { job, token }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(envelope)) => {
                warn!("Task queue is full, rejecting job");
                Err(Rejected {
                    reason: SubmitError::Full,
                    job: envelope.job,
                })
            }
            Err(TrySendError::Disconnected(envelope)) => Err(Rejected {
                reason: SubmitError::ShutDown,
                job: envelope.job,
            }),
        }
    }

    /// Cancel queued jobs and stop the workers
    ///
    /// Jobs still queued are handed to workers with a cancelled token so they
    /// resolve instead of vanishing.
    pub(crate) fn shutdown(&self) {
        self.root.cancel();
        drop(self.sender.lock().take());

        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            // The last owner may be dropped from inside a job
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
