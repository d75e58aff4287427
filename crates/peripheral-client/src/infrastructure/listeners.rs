//! Per-instance listener sets and the [`Subscription`] handle.
//!
//! # Why not call handlers while holding the lock? (for beginners)
//!
//! Handlers are user code.  A scan handler might call `scanner.disable()`; a
//! result handler might try to start the next payment.  If the listener list
//! were still locked while those handlers ran, the nested call would try to
//! lock it again and deadlock.  So [`ListenerSet`] copies the list of
//! `Arc`-wrapped handlers under a short lock, releases the lock, and only
//! then calls each handler in registration order.
//!
//! Each transport and facade owns its own sets.  Nothing here is global, so
//! two clients in one process (or two tests running in parallel) never see
//! each other's handlers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Handle returned by every `subscribe`/`on_*` call.
///
/// Call [`unsubscribe`](Self::unsubscribe) to remove the handler.  Dropping
/// the handle leaves the handler registered until its owner is torn down.
#[must_use = "dropping a Subscription keeps the handler registered; call unsubscribe() to remove it"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle whose `unsubscribe` does nothing.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Removes the handler.  Runs at most once.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// ── ListenerSet ───────────────────────────────────────────────────────────────

struct Entry<T: ?Sized> {
    id: u64,
    listener: Arc<T>,
}

/// An ordered set of listeners of type `T` (usually a `dyn Fn(&E)`).
pub struct ListenerSet<T: ?Sized> {
    entries: Arc<Mutex<Vec<Entry<T>>>>,
    next_id: AtomicU64,
}

impl<T: ?Sized + Send + Sync + 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Appends `listener` and returns a handle that removes it again.
    pub fn add(&self, listener: Arc<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Entry { id, listener });

        let entries: Weak<Mutex<Vec<Entry<T>>>> = Arc::downgrade(&self.entries);
        Subscription::new(move || {
            if let Some(entries) = entries.upgrade() {
                entries.lock().retain(|e| e.id != id);
            }
        })
    }

    /// Copies the current listeners, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .lock()
            .iter()
            .map(|e| Arc::clone(&e.listener))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Removes every listener.  Outstanding [`Subscription`]s become no-ops.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<E: ?Sized + 'static> ListenerSet<dyn Fn(&E) + Send + Sync> {
    /// Calls every listener with `event`, outside the lock.
    pub fn emit(&self, event: &E) {
        for listener in self.snapshot() {
            listener(event);
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
