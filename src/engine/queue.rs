//! Admission control for operations against the shared session.
//!
//! Mutating operations take the gate exclusively; read-only operations share it.
//! Tokio's `RwLock` queues waiters first-in first-out, so a read submitted behind a
//! mutation is admitted only after that mutation has committed, and mutations run
//! strictly one after another in submission order.

use crate::model::{OperationId, OperationKind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct RequestQueue {
    gate: RwLock<()>,
    next_id: AtomicU64,
    mutations_in_flight: AtomicUsize,
}

enum Gate<'a> {
    Exclusive { _guard: RwLockWriteGuard<'a, ()> },
    Shared { _guard: RwLockReadGuard<'a, ()> },
}

/// Held for the whole lifetime of an admitted operation.
pub struct Admission<'a> {
    gate: Gate<'a>,
    counter: Option<&'a AtomicUsize>,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.counter {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Admission<'_> {
    pub fn is_exclusive(&self) -> bool {
        matches!(self.gate, Gate::Exclusive { .. })
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve_id(&self) -> OperationId {
        OperationId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Wait until an operation of `kind` may run.
    pub async fn admit(&self, kind: OperationKind) -> Admission<'_> {
        if kind.mutates() {
            let guard = self.gate.write().await;
            let prev = self.mutations_in_flight.fetch_add(1, Ordering::SeqCst);
            debug_assert_eq!(prev, 0, "two mutations admitted at once");
            Admission {
                gate: Gate::Exclusive { _guard: guard },
                counter: Some(&self.mutations_in_flight),
            }
        } else {
            Admission {
                gate: Gate::Shared {
                    _guard: self.gate.read().await,
                },
                counter: None,
            }
        }
    }

    pub fn mutations_in_flight(&self) -> usize {
        self.mutations_in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn ids_are_monotonic() {
        let q = RequestQueue::new();
        let a = q.reserve_id();
        let b = q.reserve_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn reads_share_the_gate() {
        let q = RequestQueue::new();
        let a = q.admit(OperationKind::Discovery).await;
        let b = tokio::time::timeout(Duration::from_millis(50), q.admit(OperationKind::Download))
            .await
            .expect("second read should not wait");
        assert!(!a.is_exclusive() && !b.is_exclusive());
    }

    #[tokio::test]
    async fn read_waits_for_in_flight_mutation() {
        let q = Arc::new(RequestQueue::new());
        let write = q.admit(OperationKind::Treatment).await;
        assert_eq!(q.mutations_in_flight(), 1);

        let blocked = tokio::time::timeout(Duration::from_millis(30), q.admit(OperationKind::Discovery)).await;
        assert!(blocked.is_err());

        drop(write);
        assert_eq!(q.mutations_in_flight(), 0);
        let read = tokio::time::timeout(Duration::from_millis(50), q.admit(OperationKind::Discovery)).await;
        assert!(read.is_ok());
    }

    #[tokio::test]
    async fn read_queued_behind_waiting_mutation_is_not_admitted_first() {
        let q = Arc::new(RequestQueue::new());
        let first_read = q.admit(OperationKind::Discovery).await;

        let q2 = q.clone();
        let writer = tokio::spawn(async move {
            let _w = q2.admit(OperationKind::FeatureGeneration).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The mutation is queued; a later read has to wait behind it.
        let late = tokio::time::timeout(Duration::from_millis(20), q.admit(OperationKind::Discovery)).await;
        assert!(late.is_err());

        drop(first_read);
        writer.await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), q.admit(OperationKind::Discovery))
            .await
            .is_ok());
    }
}
