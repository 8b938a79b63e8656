//! Runs blocking native calls off the caller's context
//!
//! The runner wraps an operation and its [`CallbackData`] into a worker job.
//! Whatever the operation does, including panicking, the carrier ends up on
//! the dispatch queue where [`CallbackData::complete`] delivers it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::callback::CallbackData;
use crate::context::ContextLiveness;
use crate::dispatch::DispatchQueue;
use crate::error::SeError;
use crate::executor::{CancellationToken, Job, TaskExecutor};

/// Submits native operations to the worker pool and routes their results
#[derive(Clone)]
pub(crate) struct AsyncTaskRunner {
    executor: Arc<TaskExecutor>,
    dispatch: DispatchQueue,
    liveness: Arc<dyn ContextLiveness>,
}

impl fmt::Debug for AsyncTaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTaskRunner")
            .field("executor", &self.executor)
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

impl AsyncTaskRunner {
    pub(crate) fn new(
        executor: Arc<TaskExecutor>,
        dispatch: DispatchQueue,
        liveness: Arc<dyn ContextLiveness>,
    ) -> Self {
        Self {
            executor,
            dispatch,
            liveness,
        }
    }

    pub(crate) fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub(crate) const fn dispatch(&self) -> &DispatchQueue {
        &self.dispatch
    }

    pub(crate) fn liveness(&self) -> &Arc<dyn ContextLiveness> {
        &self.liveness
    }

    /// Run `op` on a worker and deliver its outcome through `carrier`
    ///
    /// A rejected submission is reported here and no callback fires.
    pub(crate) fn spawn<P, T, F>(
        &self,
        operation: &'static str,
        token: CancellationToken,
        carrier: CallbackData<P, T>,
        op: F,
    ) -> Result<(), SeError>
    where
        P: Send + 'static,
        T: Send + 'static,
        F: FnOnce(&P) -> Result<T, SeError> + Send + 'static,
    {
        let job = NativeJob {
            operation,
            carrier,
            op,
            sink: self.sink(),
        };
        self.executor
            .submit(token, Box::new(job))
            .map_err(|rejected| {
                error!(operation, reason = %rejected.reason, "Failed to submit job");
                SeError::from(rejected.reason)
            })
    }

    /// Run `op` for each carrier, in order, on a single worker
    ///
    /// Completions are posted in the order of `carriers`. A rejected
    /// submission completes every carrier with the rejection error.
    pub(crate) fn spawn_batch<P, T, F>(
        &self,
        operation: &'static str,
        token: CancellationToken,
        carriers: Vec<CallbackData<P, T>>,
        op: F,
    ) where
        P: Send + 'static,
        T: Send + 'static,
        F: Fn(&P) -> Result<T, SeError> + Send + 'static,
    {
        if carriers.is_empty() {
            return;
        }
        let job = BatchJob {
            operation,
            carriers,
            op,
            sink: self.sink(),
        };
        if let Err(rejected) = self.executor.submit(token, Box::new(job)) {
            error!(operation, reason = %rejected.reason, "Failed to submit batch job");
            let reason = rejected.reason;
            rejected.job.reject(reason.into());
        }
    }

    /// Post an already resolved carrier to the main loop
    pub(crate) fn deliver<P, T>(&self, carrier: CallbackData<P, T>)
    where
        P: Send + 'static,
        T: Send + 'static,
    {
        self.sink().post(carrier);
    }

    fn sink(&self) -> CompletionSink {
        CompletionSink {
            dispatch: self.dispatch.clone(),
            liveness: Arc::clone(&self.liveness),
        }
    }
}

struct CompletionSink {
    dispatch: DispatchQueue,
    liveness: Arc<dyn ContextLiveness>,
}

impl CompletionSink {
    fn post<P, T>(&self, carrier: CallbackData<P, T>)
    where
        P: Send + 'static,
        T: Send + 'static,
    {
        let liveness = Arc::clone(&self.liveness);
        let posted = self.dispatch.post(move || {
            carrier.complete(liveness.as_ref());
        });
        if posted.is_err() {
            warn!("Dispatch queue closed, dropping completion");
        }
    }
}

fn execute<P, T, F>(operation: &'static str, carrier: &mut CallbackData<P, T>, op: F)
where
    F: FnOnce(&P) -> Result<T, SeError>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| op(carrier.params())));
    match outcome {
        Ok(Ok(value)) => {
            debug!(operation, "Operation succeeded");
            carrier.set_result(value);
        }
        Ok(Err(err)) => {
            error!(operation, name = err.name(), message = err.message(), "Operation failed");
            carrier.set_error(err);
        }
        Err(_) => {
            error!(operation, "Operation panicked");
            carrier.set_error(SeError::unknown(format!("{operation} fails")));
        }
    }
}

fn cancelled(operation: &'static str) -> SeError {
    SeError::invalid_state(format!("{operation} cancelled"))
}

struct NativeJob<P, T, F> {
    operation: &'static str,
    carrier: CallbackData<P, T>,
    op: F,
    sink: CompletionSink,
}

impl<P, T, F> Job for NativeJob<P, T, F>
where
    P: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&P) -> Result<T, SeError> + Send + 'static,
{
    fn run(self: Box<Self>, token: &CancellationToken) {
        let Self {
            operation,
            mut carrier,
            op,
            sink,
        } = *self;

        if token.is_cancelled() {
            debug!(operation, "Job cancelled before start");
            carrier.set_error(cancelled(operation));
        } else {
            execute(operation, &mut carrier, op);
        }
        sink.post(carrier);
    }

    fn reject(self: Box<Self>, error: SeError) {
        let Self {
            mut carrier, sink, ..
        } = *self;
        carrier.set_error(error);
        sink.post(carrier);
    }
}

struct BatchJob<P, T, F> {
    operation: &'static str,
    carriers: Vec<CallbackData<P, T>>,
    op: F,
    sink: CompletionSink,
}

impl<P, T, F> Job for BatchJob<P, T, F>
where
    P: Send + 'static,
    T: Send + 'static,
    F: Fn(&P) -> Result<T, SeError> + Send + 'static,
{
    fn run(self: Box<Self>, token: &CancellationToken) {
        let Self {
            operation,
            carriers,
            op,
            sink,
        } = *self;

        for mut carrier in carriers {
            if token.is_cancelled() {
                carrier.set_error(cancelled(operation));
            } else {
                execute(operation, &mut carrier, &op);
            }
            sink.post(carrier);
        }
    }

    fn reject(self: Box<Self>, error: SeError) {
        let Self { carriers, sink, .. } = *self;
        for mut carrier in carriers {
            carrier.set_error(error.clone());
            sink.post(carrier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Completion;
    use crate::context::ContextRegistry;
    use crate::dispatch::MainLoop;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<Result<u32, ErrorKind>>>>;

    fn setup(threads: usize) -> (MainLoop, Arc<ContextRegistry>, AsyncTaskRunner) {
        let main_loop = MainLoop::new();
        let contexts = Arc::new(ContextRegistry::new());
        let executor = Arc::new(TaskExecutor::new(threads, 16, "runner-test").unwrap());
        let runner = AsyncTaskRunner::new(executor, main_loop.queue(), contexts.clone());
        (main_loop, contexts, runner)
    }

    fn logging_carrier(
        contexts: &ContextRegistry,
        log: &Log,
        param: u32,
    ) -> CallbackData<u32, u32> {
        let ok_log = Arc::clone(log);
        let err_log = Arc::clone(log);
        CallbackData::new(
            param,
            Completion::new(
                contexts.create(),
                move |value| ok_log.lock().push(Ok(value)),
                move |error: SeError| err_log.lock().push(Err(error.kind())),
            ),
        )
    }

    #[test]
    fn test_success_reaches_main_loop() {
        let (main_loop, contexts, runner) = setup(2);
        let log: Log = Arc::default();

        let carrier = logging_carrier(&contexts, &log, 20);
        runner
            .spawn("double", CancellationToken::new(), carrier, |p| Ok(p * 2))
            .unwrap();

        assert!(main_loop.run_until(Duration::from_secs(2), || !log.lock().is_empty()));
        assert_eq!(*log.lock(), vec![Ok(40)]);
    }

    #[test]
    fn test_error_and_panic_are_recovered() {
        let (main_loop, contexts, runner) = setup(2);
        let log: Log = Arc::default();

        runner
            .spawn(
                "fail",
                CancellationToken::new(),
                logging_carrier(&contexts, &log, 1),
                |_| Err(SeError::io("link down")),
            )
            .unwrap();
        runner
            .spawn(
                "panic",
                CancellationToken::new(),
                logging_carrier(&contexts, &log, 2),
                |_| -> Result<u32, SeError> { panic!("driver bug") },
            )
            .unwrap();

        assert!(main_loop.run_until(Duration::from_secs(2), || log.lock().len() == 2));
        let log = log.lock();
        assert!(log.contains(&Err(ErrorKind::Io)));
        assert!(log.contains(&Err(ErrorKind::Unknown)));
    }

    #[test]
    fn test_cancelled_token_skips_operation() {
        let (main_loop, contexts, runner) = setup(1);
        let log: Log = Arc::default();
        let token = CancellationToken::new();
        token.cancel();

        runner
            .spawn("never", token, logging_carrier(&contexts, &log, 1), |_| {
                panic!("must not run")
            })
            .unwrap();

        assert!(main_loop.run_until(Duration::from_secs(2), || !log.lock().is_empty()));
        assert_eq!(*log.lock(), vec![Err(ErrorKind::InvalidState)]);
    }

    #[test]
    fn test_batch_preserves_order() {
        let (main_loop, contexts, runner) = setup(4);
        let log: Log = Arc::default();

        let carriers = (0..5)
            .map(|i| logging_carrier(&contexts, &log, i))
            .collect::<Vec<_>>();
        runner.spawn_batch("batch", CancellationToken::new(), carriers, |p| {
            // Later requests finish faster; order must still hold
            std::thread::sleep(Duration::from_millis(u64::from(5 - *p)));
            Ok(*p)
        });

        assert!(main_loop.run_until(Duration::from_secs(2), || log.lock().len() == 5));
        assert_eq!(*log.lock(), (0..5).map(Ok).collect::<Vec<_>>());
    }

    #[test]
    fn test_rejected_spawn_fires_no_callback() {
        let (main_loop, contexts, runner) = setup(1);
        let log: Log = Arc::default();
        runner.executor().shutdown();

        let err = runner
            .spawn(
                "late",
                CancellationToken::new(),
                logging_carrier(&contexts, &log, 1),
                |p| Ok(*p),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);

        main_loop.run_for(Duration::from_millis(50));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_rejected_batch_fails_every_carrier() {
        let (main_loop, contexts, runner) = setup(1);
        let log: Log = Arc::default();
        runner.executor().shutdown();

        let carriers = (0..3)
            .map(|i| logging_carrier(&contexts, &log, i))
            .collect::<Vec<_>>();
        runner.spawn_batch("late", CancellationToken::new(), carriers, |p| Ok(*p));

        assert_eq!(main_loop.run_pending(), 3);
        assert_eq!(*log.lock(), vec![Err(ErrorKind::Unknown); 3]);
    }
}
