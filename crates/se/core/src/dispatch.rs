//! Single serialized dispatch queue
//!
//! All completion callbacks and listener notifications run on one
//! [`MainLoop`]. Worker threads and native event threads only ever post
//! closures through a cloneable [`DispatchQueue`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Quit,
}

/// Errors when posting onto the dispatch queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The main loop has been dropped
    #[error("Dispatch queue closed")]
    Closed,
}

/// Posting side of the main loop
#[derive(Clone)]
pub struct DispatchQueue {
    sender: Sender<Message>,
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("queued", &self.sender.len())
            .finish()
    }
}

impl DispatchQueue {
    /// Queue `job` to run on the main loop
    pub fn post<F>(&self, job: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Message::Run(Box::new(job)))
            .map_err(|_| DispatchError::Closed)
    }

    /// Ask [`MainLoop::run`] to return once everything queued before has run
    pub fn quit(&self) -> Result<(), DispatchError> {
        self.sender
            .send(Message::Quit)
            .map_err(|_| DispatchError::Closed)
    }

    /// Number of jobs waiting to run
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    /// Whether no job is waiting
    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// The serialized execution context that runs every callback
pub struct MainLoop {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
}

impl fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MainLoop")
            .field("queued", &self.receiver.len())
            .finish()
    }
}

impl MainLoop {
    /// Create a new main loop
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Get a queue that posts onto this loop
    pub fn queue(&self) -> DispatchQueue {
        DispatchQueue {
            sender: self.sender.clone(),
        }
    }

    /// Run jobs until [`DispatchQueue::quit`] is called
    pub fn run(&self) {
        while let Ok(message) = self.receiver.recv() {
            match message {
                Message::Run(job) => Self::execute(job),
                Message::Quit => break,
            }
        }
    }

    /// Run every job that is already queued, without waiting
    ///
    /// Returns the number of jobs run. Quit requests are consumed.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            match self.receiver.try_recv() {
                Ok(Message::Run(job)) => {
                    Self::execute(job);
                    count += 1;
                }
                Ok(Message::Quit) => {}
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return count,
            }
        }
    }

    /// Run jobs until `done` returns true or `timeout` elapses
    ///
    /// `done` is checked before waiting and after every job. Returns whether
    /// the condition was met.
    pub fn run_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match self.receiver.recv_timeout(remaining) {
                Ok(Message::Run(job)) => Self::execute(job),
                Ok(Message::Quit) => {}
                Err(RecvTimeoutError::Timeout) => return done(),
                Err(RecvTimeoutError::Disconnected) => return done(),
            }
        }
    }

    /// Run jobs for `duration`, returning the number of jobs run
    pub fn run_for(&self, duration: Duration) -> usize {
        let mut count = 0;
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(Message::Run(job)) => {
                    Self::execute(job);
                    count += 1;
                }
                Ok(Message::Quit) => return count,
                Err(_) => return count,
            }
        }
    }

    fn execute(job: Job) {
        trace!("Running dispatch job");
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Dispatch job panicked");
        }
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}
