//! In-memory driver with virtual readers and cards
//!
//! Readers and cards are added and removed at runtime and fire presence
//! events on every live connection. Applets answer SELECT with a configured
//! response and commands through a responder closure. Failures can be
//! injected per operation, and every native call is counted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{NativeError, NativeErrorCode};
use crate::native::{
    NativeChannel, NativeConnection, NativeEventHandler, NativeReader, NativeSession,
    PresenceKind, SeDriver,
};

/// Highest logical channel number handed out
pub const MAX_LOGICAL_CHANNEL: u8 = 19;

const SW_OK: [u8; 2] = [0x90, 0x00];

type Responder = Arc<dyn Fn(&[u8]) -> Bytes + Send + Sync>;

/// Native operations of the simulated driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    /// `SeDriver::connect`
    Connect,
    /// `NativeConnection::readers`
    Readers,
    /// `NativeConnection::shutdown`
    Shutdown,
    /// `NativeReader::open_session`
    OpenSession,
    /// `NativeReader::close_sessions`
    CloseSessions,
    /// `NativeSession::open_basic_channel`
    OpenBasicChannel,
    /// `NativeSession::open_logical_channel`
    OpenLogicalChannel,
    /// `NativeSession::atr`
    Atr,
    /// `NativeSession::close`
    CloseSession,
    /// `NativeSession::close_channels`
    CloseChannels,
    /// `NativeChannel::transmit`
    Transmit,
    /// `NativeChannel::select_response`
    SelectResponse,
    /// `NativeChannel::close`
    CloseChannel,
}

/// An applet installed on a simulated card
#[derive(Clone)]
pub struct SimApplet {
    aid: Bytes,
    select_response: Bytes,
    responder: Responder,
}

impl fmt::Debug for SimApplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimApplet")
            .field("aid", &hex::encode(&self.aid))
            .field("select_response", &hex::encode(&self.select_response))
            .finish_non_exhaustive()
    }
}

impl SimApplet {
    /// Applet answering `90 00` to SELECT and to every command
    pub fn new(aid: impl Into<Bytes>) -> Self {
        Self {
            aid: aid.into(),
            select_response: Bytes::from_static(&SW_OK),
            responder: Arc::new(|_| Bytes::from_static(&SW_OK)),
        }
    }

    /// Set the response to SELECT
    pub fn with_select_response(mut self, response: impl Into<Bytes>) -> Self {
        self.select_response = response.into();
        self
    }

    /// Answer commands with `responder`
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Bytes + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }
}

/// A simulated secure element
#[derive(Debug, Clone)]
pub struct SimCard {
    atr: Bytes,
    applets: Vec<SimApplet>,
}

impl SimCard {
    /// Card answering reset with `atr` and no applet installed
    pub fn new(atr: impl Into<Bytes>) -> Self {
        Self {
            atr: atr.into(),
            applets: Vec::new(),
        }
    }

    /// Install `applet`
    pub fn with_applet(mut self, applet: SimApplet) -> Self {
        self.applets.push(applet);
        self
    }

    fn applet(&self, aid: &[u8]) -> Option<&SimApplet> {
        self.applets.iter().find(|applet| applet.aid.as_ref() == aid)
    }
}

#[derive(Default)]
struct SimState {
    readers: BTreeMap<String, Option<SimCard>>,
    connections: Vec<Weak<SimConnection>>,
    sessions: Vec<Weak<SimSession>>,
    failures: HashMap<SimOp, NativeError>,
    calls: HashMap<SimOp, usize>,
    latency: Duration,
}

struct SimInner {
    auto_connect: bool,
    next_connection: AtomicU64,
    state: Mutex<SimState>,
}

impl fmt::Debug for SimInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimInner")
            .field("auto_connect", &self.auto_connect)
            .finish_non_exhaustive()
    }
}

impl SimInner {
    /// Count a call, apply latency and injected failures
    fn enter(&self, op: SimOp) -> Result<(), NativeError> {
        let (latency, failure) = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_default() += 1;
            (state.latency, state.failures.get(&op).cloned())
        };
        trace!(?op, "Simulated native call");
        if !latency.is_zero() && matches!(op, SimOp::OpenSession | SimOp::Transmit) {
            thread::sleep(latency);
        }
        failure.map_or(Ok(()), Err)
    }

    fn card(&self, reader: &str) -> Option<SimCard> {
        self.state.lock().readers.get(reader).cloned().flatten()
    }

    fn handlers(&self) -> Vec<Arc<dyn NativeEventHandler>> {
        let mut state = self.state.lock();
        state.connections.retain(|c| c.strong_count() > 0);
        state
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.shut.load(Ordering::Acquire))
            .map(|c| Arc::clone(&c.events))
            .collect()
    }

    fn sessions_where<F: Fn(&SimSession) -> bool>(&self, filter: F) -> Vec<Arc<SimSession>> {
        let mut state = self.state.lock();
        state.sessions.retain(|s| s.strong_count() > 0);
        state
            .sessions
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| filter(s))
            .collect()
    }

    fn fire(&self, reader: &str, kind: PresenceKind) {
        for handler in self.handlers() {
            handler.presence_changed(reader, kind);
        }
    }
}

/// Simulated native driver
///
/// Clones share the same readers and cards.
#[derive(Clone)]
pub struct SimDriver {
    inner: Arc<SimInner>,
}

impl fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SimDriver")
            .field("auto_connect", &self.inner.auto_connect)
            .field("readers", &state.readers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDriver {
    /// Driver whose connections report ready from their own thread
    pub fn new() -> Self {
        Self::with_auto_connect(true)
    }

    /// Driver whose connections only report ready on [`Self::connect_pending`]
    pub fn manual() -> Self {
        Self::with_auto_connect(false)
    }

    fn with_auto_connect(auto_connect: bool) -> Self {
        Self {
            inner: Arc::new(SimInner {
                auto_connect,
                next_connection: AtomicU64::new(1),
                state: Mutex::new(SimState::default()),
            }),
        }
    }

    /// Add an empty reader
    pub fn add_reader(&self, name: &str) {
        self.inner
            .state
            .lock()
            .readers
            .entry(name.to_string())
            .or_default();
        debug!(reader = name, "Simulated reader added");
    }

    /// Remove a reader, firing an absent event if it held a card
    pub fn remove_reader(&self, name: &str) {
        let card = self.inner.state.lock().readers.remove(name).flatten();
        self.close_reader_sessions(name);
        if card.is_some() {
            self.inner.fire(name, PresenceKind::Absent);
        }
    }

    /// Put `card` into `reader` (creating the reader) and fire a present event
    pub fn insert_card(&self, reader: &str, card: SimCard) {
        self.inner
            .state
            .lock()
            .readers
            .insert(reader.to_string(), Some(card));
        debug!(reader, "Simulated card inserted");
        self.inner.fire(reader, PresenceKind::Present);
    }

    /// Take the card out of `reader`, closing its sessions, and fire an absent event
    pub fn remove_card(&self, reader: &str) {
        let removed = self
            .inner
            .state
            .lock()
            .readers
            .get_mut(reader)
            .and_then(Option::take);
        if removed.is_some() {
            debug!(reader, "Simulated card removed");
            self.close_reader_sessions(reader);
            self.inner.fire(reader, PresenceKind::Absent);
        }
    }

    /// Fire a presence event without changing any state
    pub fn emit(&self, reader: &str, kind: PresenceKind) {
        self.inner.fire(reader, kind);
    }

    /// Report ready on every connection still waiting; returns how many
    pub fn connect_pending(&self) -> usize {
        let waiting = {
            let state = self.inner.state.lock();
            state
                .connections
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|c| !c.shut.load(Ordering::Acquire))
                .filter(|c| !c.connected.swap(true, Ordering::AcqRel))
                .collect::<Vec<_>>()
        };
        for connection in &waiting {
            connection.events.service_connected();
        }
        waiting.len()
    }

    /// Make every call of `op` fail with `code`
    pub fn fail(&self, op: SimOp, code: NativeErrorCode) {
        let error = NativeError::new(code, format!("injected {op:?} failure"));
        self.inner.state.lock().failures.insert(op, error);
    }

    /// Stop failing `op`
    pub fn clear_failure(&self, op: SimOp) {
        self.inner.state.lock().failures.remove(&op);
    }

    /// Delay session opens and transmissions by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.inner.state.lock().latency = latency;
    }

    /// Number of calls of `op` so far
    pub fn calls(&self, op: SimOp) -> usize {
        self.inner
            .state
            .lock()
            .calls
            .get(&op)
            .copied()
            .unwrap_or_default()
    }

    /// Connections that have not been shut down
    pub fn live_connections(&self) -> usize {
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.shut.load(Ordering::Acquire))
            .count()
    }

    fn close_reader_sessions(&self, reader: &str) {
        for session in self.inner.sessions_where(|s| s.reader == reader) {
            session.close_all();
        }
    }
}

impl SeDriver for SimDriver {
    fn connect(
        &self,
        events: Arc<dyn NativeEventHandler>,
    ) -> Result<Arc<dyn NativeConnection>, NativeError> {
        self.inner.enter(SimOp::Connect)?;
        let connection = Arc::new(SimConnection {
            id: self.inner.next_connection.fetch_add(1, Ordering::Relaxed),
            driver: Arc::clone(&self.inner),
            events,
            connected: AtomicBool::new(self.inner.auto_connect),
            shut: AtomicBool::new(false),
        });
        self.inner
            .state
            .lock()
            .connections
            .push(Arc::downgrade(&connection));
        debug!(connection = connection.id, "Simulated connection created");

        if self.inner.auto_connect {
            let events = Arc::clone(&connection.events);
            thread::Builder::new()
                .name(format!("sim-connect-{}", connection.id))
                .spawn(move || events.service_connected())
                .map_err(|e| {
                    NativeError::new(NativeErrorCode::IpcFailed, format!("Thread creation failed: {e}"))
                })?;
        }
        Ok(connection)
    }
}

struct SimConnection {
    id: u64,
    driver: Arc<SimInner>,
    events: Arc<dyn NativeEventHandler>,
    connected: AtomicBool,
    shut: AtomicBool,
}

impl fmt::Debug for SimConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimConnection")
            .field("id", &self.id)
            .field("shut", &self.shut.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SimConnection {
    fn check_open(&self) -> Result<(), NativeError> {
        if self.shut.load(Ordering::Acquire) {
            return Err(NativeError::new(
                NativeErrorCode::IllegalState,
                "connection is shut down",
            ));
        }
        Ok(())
    }
}

impl NativeConnection for SimConnection {
    fn readers(&self) -> Result<Vec<Arc<dyn NativeReader>>, NativeError> {
        self.driver.enter(SimOp::Readers)?;
        self.check_open()?;
        let names = self
            .driver
            .state
            .lock()
            .readers
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        Ok(names
            .into_iter()
            .map(|name| {
                Arc::new(SimReader {
                    driver: Arc::clone(&self.driver),
                    connection: self.id,
                    name,
                }) as Arc<dyn NativeReader>
            })
            .collect())
    }

    fn shutdown(&self) -> Result<(), NativeError> {
        self.driver.enter(SimOp::Shutdown)?;
        if self.shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for session in self.driver.sessions_where(|s| s.connection == self.id) {
            session.close_all();
        }
        debug!(connection = self.id, "Simulated connection shut down");
        Ok(())
    }
}

#[derive(Debug)]
struct SimReader {
    driver: Arc<SimInner>,
    connection: u64,
    name: String,
}

impl NativeReader for SimReader {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_present(&self) -> bool {
        self.driver.card(&self.name).is_some()
    }

    fn open_session(&self) -> Result<Arc<dyn NativeSession>, NativeError> {
        self.driver.enter(SimOp::OpenSession)?;
        let card = self.driver.card(&self.name).ok_or_else(|| {
            NativeError::new(NativeErrorCode::IllegalState, "no secure element present")
        })?;
        let session = Arc::new_cyclic(|me| SimSession {
            me: me.clone(),
            driver: Arc::clone(&self.driver),
            connection: self.connection,
            reader: self.name.clone(),
            card,
            closed: AtomicBool::new(false),
            channels: Mutex::new(ChannelTable::default()),
        });
        self.driver
            .state
            .lock()
            .sessions
            .push(Arc::downgrade(&session));
        Ok(session)
    }

    fn close_sessions(&self) -> Result<(), NativeError> {
        self.driver.enter(SimOp::CloseSessions)?;
        for session in self.driver.sessions_where(|s| s.reader == self.name) {
            session.close_all();
        }
        Ok(())
    }
}

#[derive(Default)]
struct ChannelTable {
    basic_open: bool,
    logical: BTreeSet<u8>,
    open: Vec<Weak<SimChannel>>,
}

struct SimSession {
    me: Weak<SimSession>,
    driver: Arc<SimInner>,
    connection: u64,
    reader: String,
    card: SimCard,
    closed: AtomicBool,
    channels: Mutex<ChannelTable>,
}

impl fmt::Debug for SimSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimSession")
            .field("reader", &self.reader)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SimSession {
    fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_open_channels();
    }

    fn close_open_channels(&self) {
        let channels = {
            let mut table = self.channels.lock();
            table.basic_open = false;
            table.logical.clear();
            std::mem::take(&mut table.open)
        };
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.closed.store(true, Ordering::Release);
        }
    }

    fn open(&self, aid: &[u8], basic: bool) -> Result<Arc<dyn NativeChannel>, NativeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NativeError::new(NativeErrorCode::IllegalState, "session is closed"));
        }
        let applet = self.card.applet(aid).ok_or_else(|| {
            NativeError::new(
                NativeErrorCode::IllegalReference,
                format!("applet {} not found", hex::encode(aid)),
            )
        })?;

        let mut table = self.channels.lock();
        let number = if basic {
            if table.basic_open {
                return Err(NativeError::new(
                    NativeErrorCode::Unavailable,
                    "basic channel is in use",
                ));
            }
            table.basic_open = true;
            0
        } else {
            let number = (1..=MAX_LOGICAL_CHANNEL)
                .find(|n| !table.logical.contains(n))
                .ok_or_else(|| {
                    NativeError::new(NativeErrorCode::Unavailable, "no free logical channel")
                })?;
            table.logical.insert(number);
            number
        };

        let channel = Arc::new(SimChannel {
            driver: Arc::clone(&self.driver),
            session: self.me.clone(),
            number,
            select_response: applet.select_response.clone(),
            responder: Arc::clone(&applet.responder),
            closed: AtomicBool::new(false),
        });
        table.open.push(Arc::downgrade(&channel));
        trace!(number, reader = %self.reader, "Simulated channel opened");
        Ok(channel)
    }

    fn release(&self, number: u8) {
        let mut table = self.channels.lock();
        if number == 0 {
            table.basic_open = false;
        } else {
            table.logical.remove(&number);
        }
    }
}

impl NativeSession for SimSession {
    fn open_basic_channel(&self, aid: &[u8]) -> Result<Arc<dyn NativeChannel>, NativeError> {
        self.driver.enter(SimOp::OpenBasicChannel)?;
        self.open(aid, true)
    }

    fn open_logical_channel(&self, aid: &[u8]) -> Result<Arc<dyn NativeChannel>, NativeError> {
        self.driver.enter(SimOp::OpenLogicalChannel)?;
        self.open(aid, false)
    }

    fn atr(&self) -> Result<Bytes, NativeError> {
        self.driver.enter(SimOp::Atr)?;
        Ok(self.card.atr.clone())
    }

    fn close(&self) -> Result<(), NativeError> {
        self.driver.enter(SimOp::CloseSession)?;
        self.close_all();
        Ok(())
    }

    fn close_channels(&self) -> Result<(), NativeError> {
        self.driver.enter(SimOp::CloseChannels)?;
        self.close_open_channels();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct SimChannel {
    driver: Arc<SimInner>,
    session: Weak<SimSession>,
    number: u8,
    select_response: Bytes,
    responder: Responder,
    closed: AtomicBool,
}

impl fmt::Debug for SimChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimChannel")
            .field("number", &self.number)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl NativeChannel for SimChannel {
    fn transmit(&self, command: &[u8]) -> Result<Bytes, NativeError> {
        self.driver.enter(SimOp::Transmit)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(NativeError::new(NativeErrorCode::IllegalState, "channel is closed"));
        }
        Ok((self.responder)(command))
    }

    fn select_response(&self) -> Result<Bytes, NativeError> {
        self.driver.enter(SimOp::SelectResponse)?;
        Ok(self.select_response.clone())
    }

    fn close(&self) -> Result<(), NativeError> {
        self.driver.enter(SimOp::CloseChannel)?;
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Some(session) = self.session.upgrade() {
                session.release(self.number);
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_basic(&self) -> bool {
        self.number == 0
    }
}
