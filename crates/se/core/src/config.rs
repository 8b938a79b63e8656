//! Configuration options for the secure element service

/// What happens to queued reader requests when the service shuts down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingPolicy {
    /// Complete each request through its error callback (default)
    #[default]
    Fail,
    /// Drop the requests without invoking any callback
    Discard,
}

/// Configuration options for [`SeService`](crate::SeService)
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Number of worker threads running blocking native calls
    pub worker_threads: usize,

    /// Jobs that may wait for a worker before submissions are rejected
    pub queue_capacity: usize,

    /// Name given to worker threads
    pub thread_name: String,

    /// Handling of pending reader requests on shutdown
    pub pending_policy: PendingPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            queue_capacity: 64,
            thread_name: "se-worker".to_string(),
            pending_policy: PendingPolicy::Fail,
        }
    }
}

impl ServiceConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads
    pub const fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Set the worker queue capacity
    pub const fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Set the worker thread name
    pub fn with_thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the pending request policy
    pub const fn with_pending_policy(mut self, policy: PendingPolicy) -> Self {
        self.pending_policy = policy;
        self
    }
}
