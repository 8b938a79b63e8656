//! Consumer contexts and their liveness
//!
//! Every asynchronous call and every listener is bound to the context of the
//! caller that issued it. Before any caller code runs on the dispatch queue
//! the engine asks the boundary whether that context is still alive.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Handle of a caller context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("ctx#{_0}")]
pub struct ContextId(u64);

impl ContextId {
    /// Wrap a boundary supplied context value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw context value
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Liveness query supplied by the calling boundary
pub trait ContextLiveness: Send + Sync + fmt::Debug {
    /// Whether callbacks may still be delivered to `context`
    fn is_alive(&self, context: ContextId) -> bool;
}

/// Registry of live contexts
///
/// The boundary creates a context per caller and destroys it when the caller
/// goes away; pending completions for a destroyed context are dropped.
#[derive(Debug)]
pub struct ContextRegistry {
    next: AtomicU64,
    alive: RwLock<HashSet<ContextId>>,
}

impl ContextRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            alive: RwLock::new(HashSet::new()),
        }
    }

    /// Create a new live context
    pub fn create(&self) -> ContextId {
        let context = ContextId(self.next.fetch_add(1, Ordering::Relaxed));
        self.alive.write().insert(context);
        context
    }

    /// Mark `context` as destroyed; returns whether it was alive
    pub fn destroy(&self, context: ContextId) -> bool {
        self.alive.write().remove(&context)
    }

    /// Number of live contexts
    pub fn len(&self) -> usize {
        self.alive.read().len()
    }

    /// Whether no context is alive
    pub fn is_empty(&self) -> bool {
        self.alive.read().is_empty()
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextLiveness for ContextRegistry {
    fn is_alive(&self, context: ContextId) -> bool {
        self.alive.read().contains(&context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_destroy() {
        let registry = ContextRegistry::new();
        let a = registry.create();
        let b = registry.create();

        assert_ne!(a, b);
        assert!(registry.is_alive(a));
        assert!(registry.destroy(a));
        assert!(!registry.is_alive(a));
        assert!(!registry.destroy(a));
        assert!(registry.is_alive(b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_context_is_dead() {
        let registry = ContextRegistry::new();
        assert!(!registry.is_alive(ContextId::new(99)));
    }
}
