//! PC/SC driver for the secure element service
//!
//! [`PcscDriver`] implements [`nexum_se_core::SeDriver`] on top of the system
//! PC/SC service (pcsclite, WinSCard or CryptoTokenKit). A monitor thread
//! reports card insertion and removal; logical channels are opened with
//! MANAGE CHANNEL and addressed through the class byte.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nexum_se_core::{ContextRegistry, MainLoop, SeService, ServiceConfig};
//! use nexum_se_pcsc::{PcscConfig, PcscDriver, ShareMode};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = PcscDriver::with_config(PcscConfig::new().with_share_mode(ShareMode::Exclusive));
//! let main_loop = MainLoop::new();
//! let contexts = Arc::new(ContextRegistry::new());
//! let service = SeService::new(
//!     Arc::new(driver),
//!     contexts,
//!     main_loop.queue(),
//!     ServiceConfig::default(),
//! )?;
//! # drop(service);
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod apdu;
mod channel;
mod config;
mod driver;
mod error;
mod monitor;
mod reader;
mod session;

pub use config::{PcscConfig, ShareMode};
pub use driver::PcscDriver;
pub use error::PcscError;
