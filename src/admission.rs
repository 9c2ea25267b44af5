//! Admission control: bounds `clients_in_flight` to `max_clients`.
//!
//! Modeled as an atomic-add-and-check rather than a hand-rolled CAS loop
//! (see design notes): the contract is only that the post-increment count
//! never exceeds the limit and that decrements saturate at 0 so a spurious
//! double-release on an error path can't underflow the counter.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Minimum gap between consecutive "admission refused" log lines, so a
/// sustained overload produces one warning per window instead of one per
/// rejected datagram/connection.
const REFUSAL_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Shared admission counter. Cheap to clone (wraps an `Arc`) so every
/// spawned query task can hold its own [`AdmissionGuard`] independently.
#[derive(Clone)]
pub struct Admission {
    in_flight: Arc<AtomicU32>,
    max_clients: u32,
    last_refusal_log: Arc<Mutex<Option<Instant>>>,
}

/// Releases its admission slot when dropped, on every exit path —
/// including early returns and panics unwound through the task.
pub struct AdmissionGuard {
    in_flight: Arc<AtomicU32>,
}

impl Admission {
    pub fn new(max_clients: u32) -> Self {
        Self {
            in_flight: Arc::new(AtomicU32::new(0)),
            max_clients,
            last_refusal_log: Arc::new(Mutex::new(None)),
        }
    }

    /// Try to admit one more client. Returns `None` (refusing admission)
    /// if doing so would push the count above `max_clients`.
    pub fn try_acquire(&self) -> Option<AdmissionGuard> {
        let mut current = self.in_flight.load(Ordering::Relaxed);
        loop {
            if current >= self.max_clients {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(AdmissionGuard {
                        in_flight: Arc::clone(&self.in_flight),
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn current(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn max_clients(&self) -> u32 {
        self.max_clients
    }

    /// Record one more admission refusal and report whether the caller
    /// should actually emit a log line for it: at most once per
    /// [`REFUSAL_LOG_INTERVAL`], regardless of how many refusals happen in
    /// between.
    pub fn note_refusal(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_refusal_log.lock().unwrap();
        if last.is_some_and(|t| now.duration_since(t) < REFUSAL_LOG_INTERVAL) {
            return false;
        }
        *last = Some(now);
        true
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_clients() {
        let admission = Admission::new(2);
        let g1 = admission.try_acquire().expect("first admitted");
        let g2 = admission.try_acquire().expect("second admitted");
        assert!(admission.try_acquire().is_none(), "third must be refused");
        assert_eq!(admission.current(), 2);

        drop(g1);
        assert_eq!(admission.current(), 1);
        let _g3 = admission.try_acquire().expect("slot freed after drop");
        drop(g2);
    }

    #[test]
    fn decrement_saturates_at_zero() {
        let admission = Admission::new(4);
        let guard = admission.try_acquire().unwrap();
        drop(guard);
        // Dropping an already-released guard type isn't possible directly,
        // but the saturating_sub in the Drop impl guards the invariant even
        // if a caller error path released the same slot twice.
        assert_eq!(admission.current(), 0);
    }

    #[test]
    fn refusal_log_is_throttled() {
        let admission = Admission::new(1);
        assert!(admission.note_refusal(), "first refusal always logs");
        assert!(
            !admission.note_refusal(),
            "second refusal within the window must be suppressed"
        );
        assert!(
            !admission.note_refusal(),
            "third refusal within the window must also be suppressed"
        );
    }

    #[tokio::test]
    async fn concurrent_bursts_never_exceed_max_clients() {
        let admission = Admission::new(4);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let admission = admission.clone();
            handles.push(tokio::spawn(async move {
                let _guard = admission.try_acquire();
                assert!(admission.current() <= 4);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(admission.current(), 0);
    }
}
