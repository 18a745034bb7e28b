//! Worker capacity shared by the scanners and the worker pool.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// A semaphore that knows its capacity. Permits travel with work messages
/// and are returned when the worker drops them.
#[derive(Debug, Clone)]
pub struct TrackingSemaphore {
    inner: Arc<Semaphore>,
    capacity: usize,
}

impl TrackingSemaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        match self.inner.clone().try_acquire_owned() {
            Ok(p) => Some(p),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_are_returned_on_drop() {
        let s = TrackingSemaphore::new(2);
        let a = s.try_acquire().unwrap();
        let _b = s.try_acquire().unwrap();
        assert!(s.try_acquire().is_none());
        assert_eq!(s.in_use(), 2);
        drop(a);
        assert_eq!(s.available(), 1);
        assert!(s.try_acquire().is_some());
    }
}
