//! Single-flight guard for scheduled phases.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Ensures one task at a time runs a given phase. Acquiring while a run is
/// in flight fails instead of waiting; the caller skips that invocation.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
    rejected: AtomicU64,
}

/// Held for the duration of a run; releases the guard on drop.
#[derive(Debug)]
pub struct FlightPermit {
    guard: Arc<SingleFlight>,
}

impl SingleFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<FlightPermit> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(FlightPermit {
                guard: Arc::clone(self),
            })
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn in_flight(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Acquisitions refused because a run was already in flight.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let guard = SingleFlight::new();
        let permit = guard.try_acquire().unwrap();
        assert!(guard.in_flight());
        assert!(guard.try_acquire().is_none());
        assert_eq!(guard.rejected(), 1);
        drop(permit);
        assert!(!guard.in_flight());
        assert!(guard.try_acquire().is_some());
    }

    #[tokio::test]
    async fn permit_survives_await_points() {
        let guard = SingleFlight::new();
        let g = Arc::clone(&guard);
        let handle = tokio::spawn(async move {
            let _permit = g.try_acquire().unwrap();
            tokio::task::yield_now().await;
            g.in_flight()
        });
        assert!(handle.await.unwrap());
        assert!(!guard.in_flight());
    }
}
