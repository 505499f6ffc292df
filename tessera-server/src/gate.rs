use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Admits at most one generation run at a time, process-wide.
#[derive(Clone)]
pub struct SingleFlightGate {
    semaphore: Arc<Semaphore>,
}

/// Proof of holding the gate. Dropping it releases the gate, including on unwind.
#[must_use = "the gate is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl Default for SingleFlightGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFlightGate {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Returns immediately; `None` means another run holds the gate.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(GatePermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    /// Waits until the current holder finishes.
    pub async fn acquire(&self) -> Result<GatePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .context("generation gate closed")?;
        Ok(GatePermit { _permit: permit })
    }

    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn second_try_acquire_is_refused_until_release() {
        let gate = SingleFlightGate::new();
        let permit = gate.try_acquire().unwrap();
        assert!(gate.is_busy());
        assert!(gate.try_acquire().is_none());
        assert!(gate.clone().try_acquire().is_none());

        drop(permit);
        assert!(!gate.is_busy());
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn acquire_waits_for_the_holder() {
        let gate = SingleFlightGate::new();
        let permit = gate.try_acquire().unwrap();

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.acquire().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be admitted")
            .unwrap()
            .unwrap();
    }
}
