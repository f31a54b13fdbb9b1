//! Listener registry
//!
//! Thread-safe add/remove with snapshot iteration. Every registration owns a
//! dispatch [`Lane`], so removing a listener also retires its lane once the
//! queued notifications have drained.

use crate::dispatch::Lane;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

struct Registration<L: ?Sized> {
    listener: Arc<L>,
    lane: Lane,
}

/// Set of listeners of one kind
///
/// Duplicates are allowed; removal drops the first registration whose
/// listener is the same allocation as the argument.
pub struct ListenerRegistry<L: ?Sized> {
    kind: &'static str,
    next_id: AtomicU64,
    entries: RwLock<Vec<Registration<L>>>,
}

impl<L: ?Sized + Send + Sync + 'static> ListenerRegistry<L> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Arc<L>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lane = Lane::spawn(format!("{}-listener-{}", self.kind, id));

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration { listener, lane });
        debug!("Registered {} listener #{}", self.kind, id);
    }

    /// Remove one registration of `listener`; returns false if absent
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        match entries
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.listener, listener))
        {
            Some(index) => {
                let removed = entries.remove(index);
                debug!("Removed {} listener on lane {}", self.kind, removed.lane.name());
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current registrations for one dispatch pass
    pub(crate) fn snapshot(&self) -> Vec<(Arc<L>, Lane)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| (Arc::clone(&entry.listener), entry.lane.clone()))
            .collect()
    }
}
