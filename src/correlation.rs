//! Correlation identifiers and pending synchronous calls.
//!
//! `CorrelatableFrame` abstracts over packets that carry an optional
//! correlation identifier (the "sync sequence"). [`Connection::call`] stamps
//! a fresh identifier on the request and parks a waiter in
//! [`PendingCalls`]; dispatch resolves the waiter when a packet carrying the
//! same identifier arrives.
//!
//! [`Connection::call`]: crate::Connection::call

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

/// Access and mutate correlation identifiers on packets.
pub trait CorrelatableFrame {
    /// Return the correlation identifier associated with this packet, if any.
    fn correlation_id(&self) -> Option<u64>;

    /// Set or clear the correlation identifier.
    fn set_correlation_id(&mut self, correlation_id: Option<u64>);
}

/// Waiters for correlated responses, keyed by correlation identifier.
pub(crate) struct PendingCalls<P> {
    next: AtomicU64,
    waiters: DashMap<u64, oneshot::Sender<P>>,
}

impl<P> Default for PendingCalls<P> {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
            waiters: DashMap::new(),
        }
    }
}

impl<P> PendingCalls<P> {
    /// Allocate an identifier and register a waiter for it.
    pub(crate) fn register(&self) -> (u64, oneshot::Receiver<P>) {
        let mut id = self.next.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            id = self.next.fetch_add(1, Ordering::Relaxed);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        (id, rx)
    }

    /// Hand `packet` to the waiter registered under `id`.
    ///
    /// Returns the packet back when nobody waits for it.
    pub(crate) fn resolve(&self, id: u64, packet: P) -> Result<(), P> {
        match self.waiters.remove(&id) {
            Some((_, tx)) => tx.send(packet),
            None => Err(packet),
        }
    }

    /// Whether a waiter is registered under `id`.
    pub(crate) fn is_pending(&self, id: u64) -> bool { self.waiters.contains_key(&id) }

    /// Drop the waiter registered under `id`.
    pub(crate) fn cancel(&self, id: u64) { self.waiters.remove(&id); }

    pub(crate) fn len(&self) -> usize { self.waiters.len() }
}

#[cfg(test)]
mod tests {
    use super::PendingCalls;

    #[tokio::test]
    async fn resolves_registered_waiter() {
        let calls = PendingCalls::<u32>::default();
        let (id, rx) = calls.register();
        assert!(calls.is_pending(id));
        assert!(calls.resolve(id, 7).is_ok());
        assert_eq!(rx.await.ok(), Some(7));
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn unknown_identifier_returns_packet() {
        let calls = PendingCalls::<u32>::default();
        assert_eq!(calls.resolve(42, 9), Err(9));
    }

    #[test]
    fn identifiers_are_unique_and_non_zero() {
        let calls = PendingCalls::<u32>::default();
        let (a, _ra) = calls.register();
        let (b, _rb) = calls.register();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        calls.cancel(a);
        assert!(!calls.is_pending(a));
        assert!(calls.is_pending(b));
    }
}
