//! PC/SC driver and connection

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nexum_se_core::{
    NativeConnection, NativeError, NativeEventHandler, NativeReader, SeDriver,
};
use parking_lot::Mutex;
use pcsc::{Context, Scope};
use tracing::{debug, info};

use crate::config::PcscConfig;
use crate::error::PcscError;
use crate::monitor::PcscMonitor;
use crate::reader::PcscReader;

/// [`SeDriver`] backed by the system PC/SC service
#[derive(Debug, Clone, Default)]
pub struct PcscDriver {
    config: PcscConfig,
}

impl PcscDriver {
    /// Create a driver with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a driver with custom configuration
    pub const fn with_config(config: PcscConfig) -> Self {
        Self { config }
    }

    /// Current configuration
    pub const fn config(&self) -> &PcscConfig {
        &self.config
    }
}

impl SeDriver for PcscDriver {
    fn connect(
        &self,
        events: Arc<dyn NativeEventHandler>,
    ) -> Result<Arc<dyn NativeConnection>, NativeError> {
        let context = Context::establish(Scope::User).map_err(PcscError::from)?;
        let monitor = PcscMonitor::start(context.clone(), events, self.config.poll_interval)?;
        info!("Connected to PC/SC service");

        Ok(Arc::new(PcscConnection {
            context,
            config: self.config.clone(),
            monitor,
            readers: Mutex::new(HashMap::new()),
        }))
    }
}

/// An established PC/SC context
struct PcscConnection {
    context: Context,
    config: PcscConfig,
    monitor: PcscMonitor,
    /// Reader objects handed out so far, by name
    readers: Mutex<HashMap<String, Arc<PcscReader>>>,
}

impl fmt::Debug for PcscConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscConnection")
            .field("config", &self.config)
            .field("monitor", &self.monitor)
            .field("readers", &self.readers.lock().len())
            .finish_non_exhaustive()
    }
}

impl NativeConnection for PcscConnection {
    fn readers(&self) -> Result<Vec<Arc<dyn NativeReader>>, NativeError> {
        let names = match self.context.list_readers_owned() {
            Ok(names) => names,
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(error) => return Err(PcscError::from(error).into()),
        };

        let names: Vec<String> = names
            .into_iter()
            .map(|name| name.to_string_lossy().into_owned())
            .collect();

        let mut known = self.readers.lock();
        retain_listed(&mut known, &names);
        let readers = names
            .into_iter()
            .map(|name| {
                let reader = known.entry(name.clone()).or_insert_with(|| {
                    debug!(reader = %name, "Found reader");
                    Arc::new(PcscReader::new(
                        self.context.clone(),
                        name,
                        self.config.clone(),
                    ))
                });
                Arc::clone(reader) as Arc<dyn NativeReader>
            })
            .collect();
        Ok(readers)
    }

    fn shutdown(&self) -> Result<(), NativeError> {
        self.monitor.stop();

        let readers: Vec<_> = self.readers.lock().drain().map(|(_, reader)| reader).collect();
        let mut result = Ok(());
        for reader in readers {
            if let Err(error) = reader.close_all() {
                result = Err(error);
            }
        }
        info!("Disconnected from PC/SC service");
        result
    }
}

/// Forget readers that are no longer listed
fn retain_listed<T>(known: &mut HashMap<String, T>, names: &[String]) {
    known.retain(|name, _| {
        let listed = names.contains(name);
        if !listed {
            debug!(reader = %name, "Reader removed");
        }
        listed
    });
}
