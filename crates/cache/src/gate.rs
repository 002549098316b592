//! Admission control for workers.

use exn::ResultExt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{ErrorKind, Result};

/// Caps the number of concurrently running workers.
///
/// Admission is pure counting: a request beyond the cap waits (without
/// spinning) until a running worker finishes and drops its [`Admission`], or
/// until the gate is closed, in which case it fails with
/// [`ErrorKind::Busy`].
#[derive(Debug)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// Proof of admission; the slot is given back when this is dropped.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { permits: Arc::new(Semaphore::new(capacity)), capacity }
    }

    /// Wait for a free slot.
    pub async fn admit(&self) -> Result<Admission> {
        if self.permits.available_permits() == 0 {
            debug!(capacity = self.capacity, "admission gate full, waiting for a slot");
        }
        let permit = Arc::clone(&self.permits).acquire_owned().await.or_raise(|| ErrorKind::Busy)?;
        Ok(Admission { _permit: permit })
    }

    /// Refuse all further admissions; pending and future `admit` calls fail.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.capacity - self.permits.available_permits().min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_admission_counts() {
        let gate = AdmissionGate::new(2);
        let a = gate.admit().await.unwrap();
        let b = gate.admit().await.unwrap();
        assert_eq!(gate.active(), 2);
        drop(a);
        assert_eq!(gate.active(), 1);
        drop(b);
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_still_admits_one() {
        let gate = AdmissionGate::new(0);
        assert_eq!(gate.capacity(), 1);
        let _slot = gate.admit().await.unwrap();
    }

    #[tokio::test]
    async fn test_waits_until_slot_frees() {
        let gate = Arc::new(AdmissionGate::new(1));
        let held = gate.admit().await.unwrap();
        let waiter = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.admit().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_pending_admissions() {
        let gate = Arc::new(AdmissionGate::new(1));
        let _held = gate.admit().await.unwrap();
        let waiter = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.admit().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.close();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Busy));
        assert!(gate.is_closed());
        assert!(gate.admit().await.is_err());
    }
}
