//! Common test utilities
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use nexum_se_core::sim::{SimApplet, SimCard, SimDriver};
use nexum_se_core::{
    Channel, Completion, ContextId, ContextRegistry, MainLoop, Reader, SeError, SeService,
    ServiceConfig, Session,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const AID: [u8; 5] = [0xA0, 0x00, 0x00, 0x01, 0x51];
pub const ATR: [u8; 4] = [0x3B, 0x8A, 0x80, 0x01];
pub const SELECT: [u8; 4] = [0x00, 0xA4, 0x04, 0x00];
pub const SELECT_RESPONSE: [u8; 4] = [0x6F, 0x00, 0x90, 0x00];

/// Card with one applet echoing every command followed by `90 00`
pub fn echo_card() -> SimCard {
    SimCard::new(ATR.to_vec()).with_applet(
        SimApplet::new(AID.to_vec())
            .with_select_response(SELECT_RESPONSE.to_vec())
            .with_responder(|command| {
                let mut response = command.to_vec();
                response.extend_from_slice(&[0x90, 0x00]);
                Bytes::from(response)
            }),
    )
}

/// Every callback fired for one request
pub struct Outcome<T> {
    results: Arc<Mutex<Vec<Result<T, SeError>>>>,
}

impl<T> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        Self {
            results: Arc::clone(&self.results),
        }
    }
}

impl<T: Send + 'static> Outcome<T> {
    pub fn new() -> Self {
        Self {
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn completion(&self, context: ContextId) -> Completion<T> {
        let ok = Arc::clone(&self.results);
        let err = Arc::clone(&self.results);
        Completion::new(
            context,
            move |value| ok.lock().push(Ok(value)),
            move |error| err.lock().push(Err(error)),
        )
    }

    pub fn count(&self) -> usize {
        self.results.lock().len()
    }

    pub fn take(&self) -> Option<Result<T, SeError>> {
        let mut results = self.results.lock();
        if results.is_empty() {
            None
        } else {
            Some(results.remove(0))
        }
    }
}

pub struct Harness {
    pub main_loop: MainLoop,
    pub contexts: Arc<ContextRegistry>,
    pub context: ContextId,
    pub driver: SimDriver,
    pub service: SeService,
}

impl Harness {
    pub fn new(driver: SimDriver) -> Self {
        Self::with_config(driver, ServiceConfig::new().with_worker_threads(2))
    }

    pub fn with_config(driver: SimDriver, config: ServiceConfig) -> Self {
        let main_loop = MainLoop::new();
        let contexts = Arc::new(ContextRegistry::new());
        let context = contexts.create();
        let service = SeService::new(
            Arc::new(driver.clone()),
            contexts.clone(),
            main_loop.queue(),
            config,
        )
        .expect("service");

        Self {
            main_loop,
            contexts,
            context,
            driver,
            service,
        }
    }

    /// Manual driver with an echo card in "SIM1", already connected
    pub fn connected() -> Self {
        let driver = SimDriver::manual();
        driver.insert_card("SIM1", echo_card());
        let harness = Self::new(driver);
        harness.connect();
        harness
    }

    pub fn connect(&self) {
        self.driver.connect_pending();
        assert!(self.wait(|| self.service.is_initialized()), "service never connected");
    }

    pub fn wait(&self, done: impl FnMut() -> bool) -> bool {
        self.main_loop.run_until(TIMEOUT, done)
    }

    /// Run the loop for a while so late callbacks would show up
    pub fn settle(&self) {
        self.main_loop.run_for(Duration::from_millis(100));
    }

    pub fn outcome<T: Send + 'static>(&self, outcome: &Outcome<T>) -> Result<T, SeError> {
        assert!(self.wait(|| outcome.count() > 0), "no completion");
        outcome.take().expect("outcome")
    }

    pub fn get_readers(&self) -> Vec<Reader> {
        let outcome = Outcome::new();
        self.service
            .get_readers(outcome.completion(self.context))
            .expect("get readers");
        self.outcome(&outcome).expect("readers")
    }

    pub fn reader(&self, name: &str) -> Reader {
        self.get_readers()
            .into_iter()
            .find(|reader| reader.name() == name)
            .expect("reader")
    }

    pub fn open_session(&self, reader: &Reader) -> Session {
        let outcome = Outcome::new();
        reader
            .open_session(outcome.completion(self.context))
            .expect("open session");
        self.outcome(&outcome).expect("session")
    }

    pub fn open_channel(&self, session: &Session, basic: bool) -> Channel {
        let outcome = Outcome::new();
        session
            .open_channel(&AID, basic, outcome.completion(self.context))
            .expect("open channel");
        self.outcome(&outcome).expect("channel")
    }

    pub fn transmit(&self, channel: &Channel, command: &[u8]) -> Result<Bytes, SeError> {
        let outcome = Outcome::new();
        channel
            .transmit(command, outcome.completion(self.context))
            .expect("transmit");
        self.outcome(&outcome)
    }
}
