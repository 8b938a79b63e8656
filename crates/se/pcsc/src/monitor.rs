//! Presence monitor for PC/SC readers

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nexum_se_core::{NativeEventHandler, PresenceKind};
use parking_lot::Mutex;
use pcsc::{Context, ReaderState, State};
use tracing::{debug, trace, warn};

use crate::error::PcscError;

/// Background thread reporting card insertion and removal
pub(crate) struct PcscMonitor {
    context: Context,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PcscMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcscMonitor")
            .field("running", &self.running.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl PcscMonitor {
    /// Start monitoring
    ///
    /// The thread reports the connection as ready before waiting for the
    /// first change.
    pub(crate) fn start(
        context: Context,
        events: Arc<dyn NativeEventHandler>,
        poll_interval: Duration,
    ) -> Result<Self, PcscError> {
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let context = context.clone();
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("se-pcsc-monitor".to_string())
                .spawn(move || {
                    events.service_connected();
                    watch(&context, events.as_ref(), &running, poll_interval);
                    debug!("Presence monitor stopped");
                })
                .map_err(PcscError::Thread)?
        };

        Ok(Self {
            context,
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the thread and wait for it to exit
    pub(crate) fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(error) = self.context.cancel() {
            trace!(%error, "Failed to cancel status wait");
        }
        if let Some(handle) = self.handle.lock().take()
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!("Presence monitor panicked");
        }
    }
}

impl Drop for PcscMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Whether a card was present at the last observation, per reader
type Presence = HashMap<String, bool>;

fn watch(
    context: &Context,
    events: &dyn NativeEventHandler,
    running: &AtomicBool,
    poll_interval: Duration,
) {
    let mut states = vec![ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE)];
    let mut presence = Presence::new();

    while running.load(Ordering::Acquire) {
        match context.list_readers_owned() {
            Ok(names) => refresh(&mut states, &mut presence, &names, events),
            Err(pcsc::Error::NoReadersAvailable) => {
                refresh(&mut states, &mut presence, &[], events);
            }
            Err(error) => {
                events.service_error(PcscError::from(error).into());
                thread::sleep(poll_interval);
                continue;
            }
        }

        for state in &mut states {
            state.sync_current_state();
        }

        match context.get_status_change(Some(poll_interval), &mut states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => continue,
            Err(pcsc::Error::Cancelled) => break,
            Err(error) => {
                warn!(%error, "Failed to wait for reader state changes");
                thread::sleep(poll_interval);
                continue;
            }
        }

        for state in &states {
            if is_pnp(state) {
                continue;
            }
            let name = state.name().to_string_lossy().into_owned();
            let present = state.event_state().contains(State::PRESENT);
            report(&mut presence, name, present, events);
        }
    }
}

/// Track the current reader list, reporting removal of readers holding a
/// card
fn refresh(
    states: &mut Vec<ReaderState>,
    presence: &mut Presence,
    names: &[CString],
    events: &dyn NativeEventHandler,
) {
    states.retain(|state| is_pnp(state) || names.iter().any(|name| name.as_c_str() == state.name()));
    for name in names {
        if !states.iter().any(|state| state.name() == name.as_c_str()) {
            states.push(ReaderState::new(name.clone(), State::UNAWARE));
        }
    }

    let gone: Vec<String> = presence
        .keys()
        .filter(|known| !names.iter().any(|name| name.to_string_lossy() == known.as_str()))
        .cloned()
        .collect();
    for name in gone {
        if presence.remove(&name) == Some(true) {
            events.presence_changed(&name, PresenceKind::Absent);
        }
    }
}

/// Report `present` for `name` when it differs from the last observation
///
/// A reader seen for the first time only reports a card already inserted.
fn report(presence: &mut Presence, name: String, present: bool, events: &dyn NativeEventHandler) {
    let previous = presence.insert(name.clone(), present).unwrap_or(false);
    if previous == present {
        return;
    }
    let kind = if present {
        PresenceKind::Present
    } else {
        PresenceKind::Absent
    };
    debug!(reader = %name, %kind, "Presence changed");
    events.presence_changed(&name, kind);
}

fn is_pnp(state: &ReaderState) -> bool {
    state.name() == pcsc::PNP_NOTIFICATION()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, PresenceKind)>>,
    }

    impl NativeEventHandler for Recorder {
        fn service_connected(&self) {}

        fn presence_changed(&self, reader: &str, kind: PresenceKind) {
            self.events.lock().push((reader.to_string(), kind));
        }
    }

    #[test]
    fn test_report_only_changes() {
        let recorder = Recorder::default();
        let mut presence = Presence::new();

        report(&mut presence, "A".to_string(), false, &recorder);
        report(&mut presence, "B".to_string(), true, &recorder);
        report(&mut presence, "B".to_string(), true, &recorder);
        report(&mut presence, "B".to_string(), false, &recorder);

        assert_eq!(
            *recorder.events.lock(),
            vec![
                ("B".to_string(), PresenceKind::Present),
                ("B".to_string(), PresenceKind::Absent),
            ]
        );
    }

    #[test]
    fn test_removed_reader_with_card_reports_absent() {
        let recorder = Recorder::default();
        let mut presence = Presence::new();
        let mut states = vec![ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE)];
        let names = vec![
            CString::new("A").unwrap(),
            CString::new("B").unwrap(),
        ];

        refresh(&mut states, &mut presence, &names, &recorder);
        assert_eq!(states.len(), 3);
        report(&mut presence, "A".to_string(), true, &recorder);
        report(&mut presence, "B".to_string(), false, &recorder);

        refresh(&mut states, &mut presence, &[], &recorder);
        assert_eq!(states.len(), 1);
        assert_eq!(
            *recorder.events.lock(),
            vec![
                ("A".to_string(), PresenceKind::Present),
                ("A".to_string(), PresenceKind::Absent),
            ]
        );
    }
}
