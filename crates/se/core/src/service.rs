//! Service connection, the entry point of the engine
//!
//! [`SeService`] owns the native connection, the requests issued before the
//! connection completed, the resource arenas and the change listeners.
//! Native callbacks arrive on driver threads and are marshaled onto the
//! dispatch queue before they touch any of that state.
//!
//! Locks are always taken in the order service state, then resources.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::arena::Arena;
use crate::callback::{Completion, GetReadersCallbackData, GetReadersParams};
use crate::channel::ChannelId;
use crate::config::{PendingPolicy, ServiceConfig};
use crate::context::{ContextId, ContextLiveness};
use crate::dispatch::DispatchQueue;
use crate::error::{NativeError, SeError};
use crate::executor::{CancellationToken, TaskExecutor};
use crate::listener::{ChangeListenerRegistry, ListenerId, SeChangeListener};
use crate::native::{
    NativeChannel, NativeConnection, NativeEventHandler, NativeReader, NativeSession,
    PresenceKind, SeDriver,
};
use crate::reader::{Reader, ReaderId};
use crate::runner::AsyncTaskRunner;
use crate::session::SessionId;

/// Upgrade a wrapper's service reference
pub(crate) fn upgrade(service: &Weak<ServiceShared>) -> Result<Arc<ServiceShared>, SeError> {
    service
        .upgrade()
        .ok_or_else(|| SeError::invalid_state("service is no longer available"))
}

#[derive(Debug)]
struct ReaderEntry {
    name: String,
    native: Arc<dyn NativeReader>,
}

#[derive(Debug)]
struct SessionEntry {
    native: Arc<dyn NativeSession>,
}

#[derive(Debug)]
struct ChannelEntry {
    session: SessionId,
    native: Arc<dyn NativeChannel>,
}

/// Native handles owned by the current connection
#[derive(Debug)]
pub(crate) struct Resources {
    epoch: u64,
    readers: Arena<ReaderEntry>,
    by_name: HashMap<String, ReaderId>,
    sessions: Arena<SessionEntry>,
    channels: Arena<ChannelEntry>,
}

/// Entries released by [`Resources::reset`], dropped outside the lock
#[derive(Debug)]
struct Released {
    readers: Vec<ReaderEntry>,
    sessions: Vec<SessionEntry>,
    channels: Vec<ChannelEntry>,
}

impl Resources {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            readers: Arena::new(),
            by_name: HashMap::new(),
            sessions: Arena::new(),
            channels: Arena::new(),
        }
    }

    fn check_epoch(&self, epoch: u64) -> Result<(), SeError> {
        if self.epoch == epoch {
            Ok(())
        } else {
            Err(SeError::invalid_state("service was shut down"))
        }
    }

    /// Invalidate every handle and move on to `epoch`
    fn reset(&mut self, epoch: u64) -> Released {
        self.epoch = epoch;
        self.by_name.clear();
        Released {
            readers: self.readers.clear(),
            sessions: self.sessions.clear(),
            channels: self.channels.clear(),
        }
    }

    /// Store a reader, reusing the slot of a known reader with the same name
    fn register_reader(&mut self, name: String, native: Arc<dyn NativeReader>) -> ReaderId {
        if let Some(&id) = self.by_name.get(&name) {
            if let Some(entry) = self.readers.get_mut(id.0) {
                entry.native = native;
                return id;
            }
        }
        let id = ReaderId(self.readers.insert(ReaderEntry {
            name: name.clone(),
            native,
        }));
        self.by_name.insert(name, id);
        id
    }

    pub(crate) fn reader(&self, id: ReaderId) -> Result<Arc<dyn NativeReader>, SeError> {
        self.readers
            .get(id.0)
            .map(|entry| Arc::clone(&entry.native))
            .ok_or_else(|| SeError::invalid_state("reader is no longer valid"))
    }

    pub(crate) fn insert_session(
        &mut self,
        epoch: u64,
        reader: ReaderId,
        native: &Arc<dyn NativeSession>,
    ) -> Result<SessionId, SeError> {
        self.check_epoch(epoch)?;
        if !self.readers.contains(reader.0) {
            return Err(SeError::invalid_state("reader is no longer valid"));
        }
        Ok(SessionId(self.sessions.insert(SessionEntry {
            native: Arc::clone(native),
        })))
    }

    pub(crate) fn session(&self, id: SessionId) -> Result<Arc<dyn NativeSession>, SeError> {
        self.sessions
            .get(id.0)
            .map(|entry| Arc::clone(&entry.native))
            .ok_or_else(|| SeError::invalid_state("session is no longer valid"))
    }

    /// Remove a session together with the channels opened on it
    pub(crate) fn remove_session(&mut self, id: SessionId) -> Option<Arc<dyn NativeSession>> {
        let entry = self.sessions.remove(id.0)?;
        let orphaned = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.session == id)
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        for key in orphaned {
            self.channels.remove(key);
        }
        Some(entry.native)
    }

    pub(crate) fn insert_channel(
        &mut self,
        epoch: u64,
        session: SessionId,
        native: &Arc<dyn NativeChannel>,
    ) -> Result<ChannelId, SeError> {
        self.check_epoch(epoch)?;
        if !self.sessions.contains(session.0) {
            return Err(SeError::invalid_state("session is no longer valid"));
        }
        Ok(ChannelId(self.channels.insert(ChannelEntry {
            session,
            native: Arc::clone(native),
        })))
    }

    /// A channel and the session it was opened on
    pub(crate) fn channel(
        &self,
        id: ChannelId,
    ) -> Result<(Arc<dyn NativeChannel>, Arc<dyn NativeSession>), SeError> {
        let entry = self
            .channels
            .get(id.0)
            .ok_or_else(|| SeError::invalid_state("channel is no longer valid"))?;
        let session = self.session(entry.session)?;
        Ok((Arc::clone(&entry.native), session))
    }

    pub(crate) fn remove_channel(&mut self, id: ChannelId) -> Option<Arc<dyn NativeChannel>> {
        self.channels.remove(id.0).map(|entry| entry.native)
    }
}

struct ServiceState {
    initialized: bool,
    epoch: u64,
    connection: Option<Arc<dyn NativeConnection>>,
    token: CancellationToken,
    pending: Vec<GetReadersCallbackData>,
}

/// State shared by a service and every handle obtained from it
pub(crate) struct ServiceShared {
    driver: Arc<dyn SeDriver>,
    runner: AsyncTaskRunner,
    policy: PendingPolicy,
    state: Mutex<ServiceState>,
    resources: Mutex<Resources>,
    listeners: ChangeListenerRegistry,
}

impl fmt::Debug for ServiceShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ServiceShared");
        debug.field("driver", &self.driver);
        if let Some(state) = self.state.try_lock() {
            debug
                .field("initialized", &state.initialized)
                .field("epoch", &state.epoch)
                .field("pending", &state.pending.len());
        }
        debug.finish_non_exhaustive()
    }
}

impl ServiceShared {
    pub(crate) const fn runner(&self) -> &AsyncTaskRunner {
        &self.runner
    }

    pub(crate) fn resources(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock()
    }

    /// Cancellation token and epoch for a job of the current connection
    pub(crate) fn job_token(&self) -> (CancellationToken, u64) {
        let state = self.state.lock();
        (state.token.clone(), state.epoch)
    }

    fn connection(&self, epoch: u64) -> Result<Arc<dyn NativeConnection>, SeError> {
        let state = self.state.lock();
        if state.epoch != epoch {
            return Err(SeError::invalid_state("service was shut down"));
        }
        state
            .connection
            .clone()
            .ok_or_else(|| SeError::invalid_state("service is not connected"))
    }

    /// Start a native connection for the current epoch
    fn establish(self: &Arc<Self>, state: &mut ServiceState) -> Result<(), NativeError> {
        let events = Arc::new(ConnectionEvents {
            service: Arc::downgrade(self),
            epoch: state.epoch,
            dispatch: self.runner.dispatch().clone(),
        });
        let connection = self.driver.connect(events)?;
        debug!(epoch = state.epoch, "Native connection started");
        state.connection = Some(connection);
        Ok(())
    }

    fn get_readers(self: &Arc<Self>, completion: Completion<Vec<Reader>>) -> Result<(), SeError> {
        let carrier = GetReadersCallbackData::new(GetReadersParams, completion);

        let mut state = self.state.lock();
        if !state.initialized {
            // A failed reconnect leaves nothing that could complete the queue
            if state.connection.is_none() {
                self.establish(&mut state)
                    .map_err(|e| SeError::from_native(&e, "connecting to service"))?;
            }
            state.pending.push(carrier);
            debug!(pending = state.pending.len(), "Service not connected yet, queueing request");
            return Ok(());
        }
        let (token, epoch) = (state.token.clone(), state.epoch);
        drop(state);

        let service = Arc::downgrade(self);
        self.runner
            .spawn("getting readers", token, carrier, move |_| {
                enumerate(&service, epoch)
            })
    }

    fn on_connected(self: &Arc<Self>, epoch: u64) {
        let (pending, token) = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                debug!(epoch, "Ignoring connect from a previous connection");
                return;
            }
            if state.initialized {
                return;
            }
            state.initialized = true;
            (mem::take(&mut state.pending), state.token.clone())
        };
        info!(pending = pending.len(), "Secure element service connected");

        let service = Arc::downgrade(self);
        self.runner
            .spawn_batch("getting readers", token, pending, move |_| {
                enumerate(&service, epoch)
            });
    }

    fn on_event(self: &Arc<Self>, epoch: u64, name: &str, kind: PresenceKind) {
        let connection = {
            let state = self.state.lock();
            if state.epoch != epoch {
                debug!(epoch, reader = name, "Ignoring event from a previous connection");
                return;
            }
            if !state.initialized {
                debug!(reader = name, %kind, "Service not connected yet, ignoring event");
                return;
            }
            state.connection.clone()
        };
        if self.listeners.is_empty() {
            trace!(reader = name, %kind, "No listener registered, ignoring event");
            return;
        }
        let Some(connection) = connection else {
            return;
        };

        let natives = match connection.readers() {
            Ok(natives) => natives,
            Err(error) => {
                warn!(%error, "Failed to list readers for event");
                return;
            }
        };
        let expect_present = kind == PresenceKind::Present;
        let Some(native) = natives
            .into_iter()
            .find(|native| native.name() == name && native.is_present() == expect_present)
        else {
            debug!(reader = name, %kind, "No reader matches event");
            return;
        };

        let id = {
            let mut resources = self.resources.lock();
            if resources.check_epoch(epoch).is_err() {
                return;
            }
            resources.register_reader(name.to_string(), native)
        };
        let reader = Reader::new(Arc::downgrade(self), id, name.to_string());

        let dispatches = self.listeners.snapshot();
        debug!(reader = name, %kind, listeners = dispatches.len(), "Dispatching presence change");
        for dispatch in dispatches {
            let reader = reader.clone();
            let liveness = Arc::clone(self.runner.liveness());
            let posted = self.runner.dispatch().post(move || {
                dispatch.deliver(kind, reader, liveness.as_ref());
            });
            if posted.is_err() {
                warn!("Dispatch queue closed, dropping presence change");
                break;
            }
        }
    }

    fn shutdown(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let pending = mem::take(&mut state.pending);
        if !state.initialized {
            drop(state);
            debug!("Service not connected, nothing to shut down");
            self.resolve_pending(pending);
            return;
        }

        state.token.cancel();
        state.initialized = false;
        state.epoch += 1;
        state.token = self.runner.executor().root_token().child_token();
        let released = self.resources.lock().reset(state.epoch);
        let connection = state.connection.take();
        drop(state);

        if let Some(connection) = connection {
            if let Err(error) = connection.shutdown() {
                error!(%error, "Failed to shut down native connection");
            }
        }
        debug!(
            readers = released.readers.len(),
            sessions = released.sessions.len(),
            channels = released.channels.len(),
            "Released native handles"
        );
        drop(released);
        self.resolve_pending(pending);

        let mut state = self.state.lock();
        if state.connection.is_none() && !state.initialized {
            if let Err(error) = self.establish(&mut state) {
                error!(%error, "Failed to reconnect to secure element service");
            }
        }
        info!("Secure element service shut down");
    }

    fn resolve_pending(&self, pending: Vec<GetReadersCallbackData>) {
        if pending.is_empty() {
            return;
        }
        match self.policy {
            PendingPolicy::Fail => {
                debug!(count = pending.len(), "Failing pending requests");
                for mut carrier in pending {
                    carrier.set_error(SeError::invalid_state("service was shut down"));
                    self.runner.deliver(carrier);
                }
            }
            PendingPolicy::Discard => {
                debug!(count = pending.len(), "Discarding pending requests");
            }
        }
    }
}

impl Drop for ServiceShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.token.cancel();
        let pending = mem::take(&mut state.pending);
        let connection = state.connection.take();

        if let Some(connection) = connection {
            if let Err(error) = connection.shutdown() {
                warn!(%error, "Failed to shut down native connection");
            }
        }
        self.resolve_pending(pending);
        self.runner.executor().shutdown();
        debug!("Secure element service dropped");
    }
}

/// Enumerate the readers of connection `epoch` and register them
fn enumerate(service: &Weak<ServiceShared>, epoch: u64) -> Result<Vec<Reader>, SeError> {
    let service = upgrade(service)?;
    let connection = service.connection(epoch)?;
    let natives = connection
        .readers()
        .map_err(|e| SeError::from_native(&e, "getting readers"))?;
    let named = natives
        .into_iter()
        .map(|native| (native.name(), native))
        .collect::<Vec<_>>();

    let ids = {
        let mut resources = service.resources.lock();
        resources.check_epoch(epoch)?;
        named
            .into_iter()
            .map(|(name, native)| (resources.register_reader(name.clone(), native), name))
            .collect::<Vec<_>>()
    };
    trace!(count = ids.len(), "Enumerated readers");

    let weak = Arc::downgrade(&service);
    Ok(ids
        .into_iter()
        .map(|(id, name)| Reader::new(weak.clone(), id, name))
        .collect())
}

/// Native callbacks of one connection, marshaled onto the dispatch queue
#[derive(Debug)]
struct ConnectionEvents {
    service: Weak<ServiceShared>,
    epoch: u64,
    dispatch: DispatchQueue,
}

impl NativeEventHandler for ConnectionEvents {
    fn service_connected(&self) {
        let service = self.service.clone();
        let epoch = self.epoch;
        if self
            .dispatch
            .post(move || {
                if let Some(service) = service.upgrade() {
                    service.on_connected(epoch);
                }
            })
            .is_err()
        {
            warn!("Dispatch queue closed, dropping connect notification");
        }
    }

    fn presence_changed(&self, reader: &str, kind: PresenceKind) {
        trace!(reader, %kind, "Presence change from native layer");
        let service = self.service.clone();
        let epoch = self.epoch;
        let reader = reader.to_string();
        if self
            .dispatch
            .post(move || {
                if let Some(service) = service.upgrade() {
                    service.on_event(epoch, &reader, kind);
                }
            })
            .is_err()
        {
            warn!("Dispatch queue closed, dropping presence change");
        }
    }

    fn service_error(&self, error: NativeError) {
        error!(epoch = self.epoch, %error, "Native service error");
    }
}

/// Connection to the secure element service
///
/// Construct one per application and share it by cloning. Dropping the last
/// clone shuts the native connection down and stops the worker threads;
/// readers, sessions and channels obtained from it then report
/// [`InvalidState`](crate::ErrorKind::InvalidState).
#[derive(Clone)]
pub struct SeService {
    shared: Arc<ServiceShared>,
}

impl fmt::Debug for SeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SeService").field(&self.shared).finish()
    }
}

impl SeService {
    /// Create the service and start connecting through `driver`
    ///
    /// Completions and listener notifications are posted to `dispatch`;
    /// `liveness` decides whether they still reach their caller.
    pub fn new(
        driver: Arc<dyn SeDriver>,
        liveness: Arc<dyn ContextLiveness>,
        dispatch: DispatchQueue,
        config: ServiceConfig,
    ) -> Result<Self, SeError> {
        let executor = Arc::new(TaskExecutor::new(
            config.worker_threads,
            config.queue_capacity,
            &config.thread_name,
        )?);
        let token = executor.root_token().child_token();
        let shared = Arc::new(ServiceShared {
            driver,
            runner: AsyncTaskRunner::new(executor, dispatch, liveness),
            policy: config.pending_policy,
            state: Mutex::new(ServiceState {
                initialized: false,
                epoch: 1,
                connection: None,
                token,
                pending: Vec::new(),
            }),
            resources: Mutex::new(Resources::new(1)),
            listeners: ChangeListenerRegistry::new(),
        });

        {
            let mut state = shared.state.lock();
            shared
                .establish(&mut state)
                .map_err(|e| SeError::from_native(&e, "connecting to service"))?;
        }
        info!(workers = config.worker_threads, "Secure element service created");
        Ok(Self { shared })
    }

    /// Whether the native connection has completed
    pub fn is_initialized(&self) -> bool {
        self.shared.state.lock().initialized
    }

    /// Enumerate the readers
    ///
    /// Requests made before the connection completes are queued and served,
    /// in order, once it does. An error returned here means the request was
    /// not accepted and no callback will fire.
    #[instrument(level = "trace", skip_all)]
    pub fn get_readers(&self, completion: Completion<Vec<Reader>>) -> Result<(), SeError> {
        self.shared.get_readers(completion)
    }

    /// Readers registered by previous enumerations
    pub fn readers(&self) -> Vec<Reader> {
        let weak = Arc::downgrade(&self.shared);
        self.shared
            .resources
            .lock()
            .readers
            .iter()
            .map(|(key, entry)| Reader::new(weak.clone(), ReaderId(key), entry.name.clone()))
            .collect()
    }

    /// Number of `get_readers` requests waiting for the connection
    pub fn pending_requests(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Subscribe `listener` to presence changes on behalf of `context`
    pub fn register_listener<L>(&self, context: ContextId, listener: L) -> ListenerId
    where
        L: SeChangeListener + 'static,
    {
        self.shared.listeners.register(context, Arc::new(listener))
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Remove a listener; notifications already queued for it are dropped
    pub fn unregister_listener(&self, id: ListenerId) -> Result<(), SeError> {
        self.shared.listeners.unregister(id)
    }

    /// Tear down the native connection and start a fresh one
    ///
    /// Handles obtained before become invalid, jobs that have not started
    /// complete with [`InvalidState`](crate::ErrorKind::InvalidState) and
    /// queued `get_readers` requests are resolved according to
    /// [`PendingPolicy`].
    #[instrument(level = "debug", skip_all)]
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}
