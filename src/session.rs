//! Per-unit-of-work routing policy state.
//!
//! A [Session] belongs to exactly one logical unit of work (one web
//! request, one background job). It is created when the unit starts and
//! discarded when it ends; it is never shared between concurrent units.
//! The fields are atomics only so the owning task may migrate threads
//! between polls; there is no cross-session coordination.
//!
//! Scoped overrides are guards: entering a block pushes the override,
//! dropping the guard pops it. Because the pop happens in `Drop`, a panic
//! inside the block cannot leak routing policy into the rest of the
//! session.

use crate::host;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

/// Routing policy state scoped to one logical unit of work.
#[derive(Debug, Default)]
pub struct Session {
    performed_write: AtomicBool,
    primary_sticky: AtomicBool,
    stick_until: Mutex<Option<Instant>>,
    use_primary_depth: AtomicUsize,
    use_replicas_depth: AtomicUsize,
    fallback_depth: AtomicUsize,
    transaction_depth: AtomicUsize,
    replica_pin: Mutex<Option<host::Name>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the session as having performed a write, with or without an
    /// observed query. Every subsequent read or ambiguous query routes to
    /// the primary for the remainder of the session.
    pub fn mark_write(&self) {
        self.performed_write.store(true, Ordering::Relaxed);
    }

    pub fn performed_write(&self) -> bool {
        self.performed_write.load(Ordering::Relaxed)
    }

    /// Routes every subsequent read and ambiguous query in this session
    /// to the primary. Unlike [Session::use_primary], this is not scoped:
    /// it lasts until the session ends.
    pub fn use_primary_sticky(&self) {
        self.primary_sticky.store(true, Ordering::Relaxed);
    }

    /// Routes reads and ambiguous queries to the primary until the
    /// deadline passes, for callers that need read-your-writes across a
    /// short horizon without pinning the rest of the session.
    pub fn stick_to_primary_until(&self, deadline: Instant) {
        *self.stick_until.lock().unwrap() = Some(deadline);
    }

    pub fn primary_sticky(&self) -> bool {
        if self.primary_sticky.load(Ordering::Relaxed) {
            return true;
        }
        self.stick_until
            .lock()
            .unwrap()
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Routes reads and ambiguous queries to the primary while the
    /// returned guard is alive.
    #[must_use = "the override ends when the guard is dropped"]
    pub fn use_primary(&self) -> ScopeGuard<'_> {
        ScopeGuard::enter(&self.use_primary_depth)
    }

    /// Routes reads to a replica while the returned guard is alive, even
    /// after a write or [Session::use_primary_sticky]. Writes and
    /// ambiguous queries are unaffected.
    #[must_use = "the override ends when the guard is dropped"]
    pub fn use_replicas_for_read_queries(&self) -> ScopeGuard<'_> {
        ScopeGuard::enter(&self.use_replicas_depth)
    }

    /// Routes ambiguous queries to a replica while the returned guard is
    /// alive, provided no write has been performed and no primary
    /// override is active.
    #[must_use = "the override ends when the guard is dropped"]
    pub fn fallback_to_replicas_for_ambiguous_queries(&self) -> ScopeGuard<'_> {
        ScopeGuard::enter(&self.fallback_depth)
    }

    /// Tracks an open transaction. Nested guards flatten onto the same
    /// routing decision as the outermost one.
    #[must_use = "the transaction scope ends when the guard is dropped"]
    pub fn transaction(&self) -> TransactionGuard<'_> {
        TransactionGuard::enter(self)
    }

    pub fn use_primary_active(&self) -> bool {
        self.use_primary_depth.load(Ordering::Relaxed) > 0
    }

    pub fn use_replicas_active(&self) -> bool {
        self.use_replicas_depth.load(Ordering::Relaxed) > 0
    }

    pub fn fallback_active(&self) -> bool {
        self.fallback_depth.load(Ordering::Relaxed) > 0
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_depth.load(Ordering::Relaxed) > 0
    }

    // The replica serving a read-only replica transaction. Pinned on the
    // first routed query, cleared when the outermost transaction ends.
    pub(crate) fn pin_replica(&self, name: host::Name) {
        *self.replica_pin.lock().unwrap() = Some(name);
    }

    pub(crate) fn pinned_replica(&self) -> Option<host::Name> {
        self.replica_pin.lock().unwrap().clone()
    }
}

/// Restores the previous override depth when dropped.
pub struct ScopeGuard<'a> {
    depth: &'a AtomicUsize,
}

impl<'a> ScopeGuard<'a> {
    fn enter(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::Relaxed);
        Self { depth }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Closes the transaction scope when dropped; the outermost close also
/// releases the replica pin.
pub struct TransactionGuard<'a> {
    session: &'a Session,
}

impl<'a> TransactionGuard<'a> {
    fn enter(session: &'a Session) -> Self {
        session.transaction_depth.fetch_add(1, Ordering::Relaxed);
        Self { session }
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        let was = self.session.transaction_depth.fetch_sub(1, Ordering::Relaxed);
        if was == 1 {
            self.session.replica_pin.lock().unwrap().take();
        }
    }
}
