//! Asynchronous secure element access
//!
//! This crate exposes smartcard readers, sessions, channels and presence
//! notifications without blocking the caller. Blocking native calls run on a
//! bounded worker pool; every result and every notification is delivered on
//! a single [`MainLoop`] after checking that the caller's context is still
//! alive.
//!
//! The native layer is consumed through the [`SeDriver`] family of traits.
//! [`sim::SimDriver`] is an in-memory implementation; `nexum-se-pcsc`
//! provides one backed by PC/SC.
//!
//! # Examples
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//!
//! use nexum_se_core::sim::{SimCard, SimDriver};
//! use nexum_se_core::{Completion, ContextRegistry, MainLoop, Reader, SeService, ServiceConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = SimDriver::new();
//! driver.insert_card("SIM1", SimCard::new(vec![0x3B, 0x00]));
//!
//! let main_loop = MainLoop::new();
//! let contexts = Arc::new(ContextRegistry::new());
//! let service = SeService::new(
//!     Arc::new(driver),
//!     contexts.clone(),
//!     main_loop.queue(),
//!     ServiceConfig::default(),
//! )?;
//!
//! let names = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&names);
//! service.get_readers(Completion::new(
//!     contexts.create(),
//!     move |readers: Vec<Reader>| {
//!         let mut names = sink.lock().unwrap();
//!         names.extend(readers.iter().map(|r| r.name().to_string()));
//!     },
//!     |error| eprintln!("{error}"),
//! ))?;
//!
//! main_loop.run_until(Duration::from_secs(2), || !names.lock().unwrap().is_empty());
//! assert_eq!(*names.lock().unwrap(), ["SIM1"]);
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod arena;
mod callback;
mod channel;
mod config;
mod context;
mod dispatch;
mod error;
mod executor;
mod listener;
mod native;
mod reader;
mod runner;
mod service;
mod session;
pub mod sim;

pub use arena::SlotKey;
pub use callback::{
    CallbackData, Completion, Delivery, GetReadersCallbackData, GetReadersParams,
    OpenChannelCallbackData, OpenChannelParams, OpenSessionCallbackData, OpenSessionParams,
    TransmitCallbackData, TransmitParams,
};
pub use channel::{Channel, ChannelId};
pub use config::{PendingPolicy, ServiceConfig};
pub use context::{ContextId, ContextLiveness, ContextRegistry};
pub use dispatch::{DispatchError, DispatchQueue, MainLoop};
pub use error::{ErrorKind, NativeError, NativeErrorCode, SeError};
pub use executor::{CancellationToken, SubmitError};
pub use listener::{ListenerId, SeChangeListener};
pub use native::{
    NativeChannel, NativeConnection, NativeEventHandler, NativeReader, NativeSession,
    PresenceKind, SeDriver,
};
pub use reader::{Reader, ReaderId};
pub use service::SeService;
pub use session::{MAX_AID_LEN, MIN_AID_LEN, Session, SessionId};
