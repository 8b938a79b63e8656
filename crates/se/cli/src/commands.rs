//! Subcommand implementations

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use eyre::{OptionExt, bail, eyre};
use nexum_se_core::sim::{SimApplet, SimCard, SimDriver};
use nexum_se_core::{
    Completion, ContextId, ContextRegistry, MainLoop, PresenceKind, Reader, SeDriver, SeError,
    SeService,
};
use nexum_se_pcsc::PcscDriver;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::Config;

/// Name of the reader exposed by `--simulate`
pub(crate) const SIM_READER: &str = "SIM1";

/// Applet installed on the simulated card
pub(crate) const SIM_AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x01, 0x51, 0x00, 0x00];

/// Everything needed to drive the service from `main`
pub(crate) struct Shell {
    main_loop: MainLoop,
    context: ContextId,
    service: SeService,
    timeout: Duration,
}

impl Shell {
    pub(crate) fn new(config: &Config, simulate: bool) -> eyre::Result<Self> {
        let driver: Arc<dyn SeDriver> = if simulate {
            Arc::new(simulated_driver())
        } else {
            Arc::new(PcscDriver::with_config(config.pcsc()))
        };

        let main_loop = MainLoop::new();
        let contexts = Arc::new(ContextRegistry::new());
        let context = contexts.create();
        let service = SeService::new(
            driver,
            contexts,
            main_loop.queue(),
            config.service(),
        )?;

        Ok(Self {
            main_loop,
            context,
            service,
            timeout: config.timeout(),
        })
    }

    /// Start an operation and run the loop until it completes
    fn wait<T, F>(&self, start: F) -> eyre::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Completion<T>) -> Result<(), SeError>,
    {
        let slot: Arc<Mutex<Option<Result<T, SeError>>>> = Arc::default();
        let ok = Arc::clone(&slot);
        let err = Arc::clone(&slot);
        start(Completion::new(
            self.context,
            move |value| *ok.lock() = Some(Ok(value)),
            move |error| *err.lock() = Some(Err(error)),
        ))?;

        if !self
            .main_loop
            .run_until(self.timeout, || slot.lock().is_some())
        {
            bail!("operation timed out after {:?}", self.timeout);
        }
        let result = slot.lock().take().ok_or_eyre("operation produced no result")?;
        Ok(result?)
    }

    fn readers(&self) -> eyre::Result<Vec<Reader>> {
        self.wait(|completion| self.service.get_readers(completion))
    }

    /// The named reader, or the first one holding a card
    fn reader(&self, name: Option<&str>) -> eyre::Result<Reader> {
        let readers = self.readers()?;
        let reader = match name {
            Some(name) => readers.into_iter().find(|reader| reader.name() == name),
            None => readers
                .into_iter()
                .find(|reader| reader.is_present().unwrap_or(false)),
        };
        reader.ok_or_else(|| match name {
            Some(name) => eyre!("reader {name} not found"),
            None => eyre!("no reader with a card present"),
        })
    }

    pub(crate) fn list(&self) -> eyre::Result<()> {
        let readers = self.readers()?;
        if readers.is_empty() {
            println!("No readers found");
            return Ok(());
        }
        for reader in readers {
            let present = reader.is_present().unwrap_or(false);
            println!(
                "{}: {}",
                reader.name(),
                if present { "card present" } else { "empty" }
            );
        }
        Ok(())
    }

    pub(crate) fn atr(&self, reader: Option<&str>) -> eyre::Result<()> {
        let reader = self.reader(reader)?;
        let session = self.wait(|completion| reader.open_session(completion))?;
        let atr = session.atr()?;
        println!("{}", hex::encode_upper(&atr));
        session.close()?;
        Ok(())
    }

    pub(crate) fn transmit(
        &self,
        reader: Option<&str>,
        aid: &[u8],
        logical: bool,
        command: &[u8],
    ) -> eyre::Result<()> {
        let reader = self.reader(reader)?;
        info!(reader = reader.name(), "Using reader");

        let session = self.wait(|completion| reader.open_session(completion))?;
        let channel = self.wait(|completion| session.open_channel(aid, !logical, completion))?;
        let select_response = channel.select_response()?;
        debug!(select_response = %hex::encode(&select_response), "Selected applet");

        let response: Bytes = self.wait(|completion| channel.transmit(command, completion))?;
        println!("{}", hex::encode_upper(&response));

        channel.close()?;
        session.close()?;
        Ok(())
    }

    /// Print presence changes for `duration`, or until the process is killed
    pub(crate) fn monitor(&self, duration: Option<Duration>) -> eyre::Result<()> {
        let listener = self.service.register_listener(
            self.context,
            |kind: PresenceKind, reader: Reader| match kind {
                PresenceKind::Present => println!("{}: card inserted", reader.name()),
                PresenceKind::Absent => println!("{}: card removed", reader.name()),
            },
        );

        // Enumerating once connects and populates the known readers
        for reader in self.readers()? {
            println!("Watching {}", reader.name());
        }

        match duration {
            Some(duration) => {
                self.main_loop.run_for(duration);
            }
            None => self.main_loop.run(),
        }
        self.service.unregister_listener(listener)?;
        Ok(())
    }
}

/// A reader holding a card whose applet answers every command with `90 00`
fn simulated_driver() -> SimDriver {
    let driver = SimDriver::new();
    driver.insert_card(
        SIM_READER,
        SimCard::new(vec![0x3B, 0x80, 0x80, 0x01, 0x01]).with_applet(
            SimApplet::new(SIM_AID.to_vec()).with_responder(|_| Bytes::from_static(&[0x90, 0x00])),
        ),
    );
    driver
}
