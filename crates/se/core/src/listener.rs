//! Presence change subscriptions
//!
//! Each registration gets an id that is never handed out twice. Hardware
//! events are fanned out as one queued dispatch per active listener; a
//! dispatch re-checks the listener's `active` flag and the liveness of its
//! context right before calling into it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::Reader;
use crate::context::{ContextId, ContextLiveness};
use crate::error::SeError;
use crate::native::PresenceKind;

/// Identifier of a registered change listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("{_0}")]
pub struct ListenerId(u64);

impl ListenerId {
    /// The raw id value
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Receiver of secure element presence changes
pub trait SeChangeListener: Send + Sync {
    /// A secure element became present in `reader`
    fn on_ready(&self, reader: Reader);

    /// The secure element was removed from `reader`
    fn on_not_ready(&self, reader: Reader);
}

impl<F> SeChangeListener for F
where
    F: Fn(PresenceKind, Reader) + Send + Sync,
{
    fn on_ready(&self, reader: Reader) {
        self(PresenceKind::Present, reader);
    }

    fn on_not_ready(&self, reader: Reader) {
        self(PresenceKind::Absent, reader);
    }
}

struct Registration {
    context: ContextId,
    listener: Arc<dyn SeChangeListener>,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<ListenerId, Registration>,
}

/// Registered change listeners of one service
pub(crate) struct ChangeListenerRegistry {
    inner: Mutex<Registry>,
}

impl fmt::Debug for ChangeListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ChangeListenerRegistry")
            .field("next_id", &inner.next_id)
            .field("listeners", &inner.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ChangeListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Registry {
                next_id: 1,
                listeners: BTreeMap::new(),
            }),
        }
    }

    pub(crate) fn register(
        &self,
        context: ContextId,
        listener: Arc<dyn SeChangeListener>,
    ) -> ListenerId {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.insert(
            id,
            Registration {
                context,
                listener,
                active: Arc::new(AtomicBool::new(true)),
            },
        );
        debug!(%id, %context, "Registered change listener");
        id
    }

    pub(crate) fn unregister(&self, id: ListenerId) -> Result<(), SeError> {
        let registration = self
            .inner
            .lock()
            .listeners
            .remove(&id)
            .ok_or_else(|| SeError::invalid_values("no listener with this id"))?;
        registration.active.store(false, Ordering::Release);
        debug!(%id, "Unregistered change listener");
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().listeners.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Dispatches for every listener registered right now, in id order
    pub(crate) fn snapshot(&self) -> Vec<ListenerDispatch> {
        self.inner
            .lock()
            .listeners
            .iter()
            .map(|(id, registration)| ListenerDispatch {
                id: *id,
                context: registration.context,
                listener: Arc::clone(&registration.listener),
                active: Arc::clone(&registration.active),
            })
            .collect()
    }
}

/// One queued notification for one listener
pub(crate) struct ListenerDispatch {
    id: ListenerId,
    context: ContextId,
    listener: Arc<dyn SeChangeListener>,
    active: Arc<AtomicBool>,
}

impl fmt::Debug for ListenerDispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerDispatch")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ListenerDispatch {
    /// Invoke the listener; returns whether it was called
    pub(crate) fn deliver(
        self,
        kind: PresenceKind,
        reader: Reader,
        liveness: &dyn ContextLiveness,
    ) -> bool {
        if !self.active.load(Ordering::Acquire) {
            trace!(id = %self.id, "Listener unregistered, skipping dispatch");
            return false;
        }
        if !liveness.is_alive(self.context) {
            debug!(id = %self.id, context = %self.context, "Listener context was closed");
            return false;
        }

        trace!(id = %self.id, %kind, reader = reader.name(), "Notifying listener");
        match kind {
            PresenceKind::Present => self.listener.on_ready(reader),
            PresenceKind::Absent => self.listener.on_not_ready(reader),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn SeChangeListener> {
        Arc::new(|_: PresenceKind, _: Reader| {})
    }

    #[test]
    fn test_ids_start_at_one_and_never_repeat() {
        let registry = ChangeListenerRegistry::new();
        let context = ContextId::new(1);

        let first = registry.register(context, noop());
        let second = registry.register(context, noop());
        assert_eq!(first.get(), 1);
        assert_eq!(second.get(), 2);

        registry.unregister(second).unwrap();
        let third = registry.register(context, noop());
        assert_eq!(third.get(), 3);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unregister_unknown_id() {
        let registry = ChangeListenerRegistry::new();
        let id = registry.register(ContextId::new(1), noop());
        registry.unregister(id).unwrap();

        let err = registry.unregister(id).unwrap_err();
        assert_eq!(err.name(), "InvalidValuesError");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_deactivates_snapshot() {
        let registry = ChangeListenerRegistry::new();
        let id = registry.register(ContextId::new(1), noop());

        let dispatches = registry.snapshot();
        assert_eq!(dispatches.len(), 1);
        assert!(dispatches[0].active.load(Ordering::Acquire));

        registry.unregister(id).unwrap();
        assert!(!dispatches[0].active.load(Ordering::Acquire));
        assert!(registry.snapshot().is_empty());
    }
}
