//! Capacity gate: the backpressure primitive guarding every stage boundary.
//!
//! A gate tracks occupancy (bytes or counts, decided by the owning queue) against two
//! watermarks. Reaching the high watermark suspends producers; they park until the
//! consumer drains to the low watermark. The gate never drops anything.

use std::sync::{Condvar, Mutex, MutexGuard};

use media_player_types::BufferingState;

use crate::cancel::{CANCEL_POLL, CancelToken};

/// Outcome of a non-blocking reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reservation {
    Granted,
    Full,
}

/// Why a blocking reservation did not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateError {
    /// The caller's cancellation token fired while parked.
    Cancelled,
    /// The gate was closed; no further production is accepted.
    Closed,
}

/// Bounded occupancy counter with hysteresis between a low and a high watermark.
pub struct CapacityGate {
    low: usize,
    high: usize,
    inner: Mutex<GateState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    occupancy: usize,
    suspended: bool,
    closed: bool,
}

impl CapacityGate {
    /// Create a gate. `low` is clamped to `high`, and `high` to at least 1.
    pub fn new(low: usize, high: usize) -> Self {
        let high = high.max(1);
        Self {
            low: low.min(high),
            high,
            inner: Mutex::new(GateState::default()),
            cv: Condvar::new(),
        }
    }

    pub fn low_watermark(&self) -> usize {
        self.low
    }

    pub fn high_watermark(&self) -> usize {
        self.high
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission rule shared by the blocking and non-blocking paths.
    ///
    /// An item larger than the whole budget is admitted into an empty gate so that a
    /// single oversized packet cannot wedge the pipeline.
    fn admit(&self, st: &mut GateState, n: usize) -> bool {
        if st.suspended {
            return false;
        }
        if st.occupancy > 0 && st.occupancy.saturating_add(n) > self.high {
            st.suspended = true;
            return false;
        }
        st.occupancy = st.occupancy.saturating_add(n);
        if st.occupancy >= self.high {
            st.suspended = true;
        }
        true
    }

    /// Reserve `n` units without blocking.
    pub fn try_reserve(&self, n: usize) -> Reservation {
        let mut st = self.lock();
        if st.closed || !self.admit(&mut st, n) {
            return Reservation::Full;
        }
        Reservation::Granted
    }

    /// Reserve `n` units, parking while the gate is suspended.
    ///
    /// Parked callers re-check `cancel` at least every [`CANCEL_POLL`].
    pub fn reserve(&self, n: usize, cancel: &CancelToken) -> Result<(), GateError> {
        let mut st = self.lock();
        loop {
            if st.closed {
                return Err(GateError::Closed);
            }
            if cancel.is_cancelled() {
                return Err(GateError::Cancelled);
            }
            if self.admit(&mut st, n) {
                return Ok(());
            }
            let (g, _timeout) = self
                .cv
                .wait_timeout(st, CANCEL_POLL)
                .unwrap_or_else(|e| e.into_inner());
            st = g;
        }
    }

    /// Return `n` units. Resumes producers once occupancy falls to the low watermark.
    ///
    /// Releasing more than is held means the owner's bookkeeping is broken; the gate
    /// resets to zero and reports the discrepancy.
    pub fn release(&self, n: usize) -> Result<(), usize> {
        let mut st = self.lock();
        let result = if n > st.occupancy {
            let held = st.occupancy;
            st.occupancy = 0;
            Err(held)
        } else {
            st.occupancy -= n;
            Ok(())
        };
        if st.suspended && st.occupancy <= self.low {
            st.suspended = false;
        }
        drop(st);
        self.cv.notify_all();
        result
    }

    pub fn occupancy(&self) -> usize {
        self.lock().occupancy
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    pub fn level(&self) -> BufferingState {
        let st = self.lock();
        if st.occupancy == 0 {
            BufferingState::Empty
        } else if st.suspended || st.occupancy >= self.high {
            BufferingState::Full
        } else if st.occupancy < self.low {
            BufferingState::Low
        } else {
            BufferingState::Normal
        }
    }

    /// Drop all accounting, returning the occupancy that was held.
    pub fn reset(&self) -> usize {
        let mut st = self.lock();
        let held = st.occupancy;
        st.occupancy = 0;
        st.suspended = false;
        drop(st);
        self.cv.notify_all();
        held
    }

    /// Refuse further reservations and wake every parked producer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cv.notify_all();
    }

    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn suspends_at_high_and_resumes_at_low() {
        let gate = CapacityGate::new(2, 4);
        assert_eq!(gate.try_reserve(2), Reservation::Granted);
        assert_eq!(gate.try_reserve(2), Reservation::Granted);
        assert!(gate.is_suspended());
        assert_eq!(gate.level(), BufferingState::Full);
        assert_eq!(gate.try_reserve(1), Reservation::Full);

        // Draining above the low watermark keeps producers parked.
        gate.release(1).unwrap();
        assert_eq!(gate.try_reserve(1), Reservation::Full);

        gate.release(1).unwrap();
        assert!(!gate.is_suspended());
        assert_eq!(gate.try_reserve(1), Reservation::Granted);
    }

    #[test]
    fn oversized_item_is_admitted_into_empty_gate() {
        let gate = CapacityGate::new(1, 4);
        assert_eq!(gate.try_reserve(10), Reservation::Granted);
        assert_eq!(gate.occupancy(), 10);
        assert_eq!(gate.try_reserve(1), Reservation::Full);
    }

    #[test]
    fn blocked_reserve_wakes_on_release() {
        let gate = Arc::new(CapacityGate::new(0, 1));
        gate.try_reserve(1);
        let producer_gate = gate.clone();
        let handle = thread::spawn(move || producer_gate.reserve(1, &CancelToken::new()));

        thread::sleep(Duration::from_millis(30));
        gate.release(1).unwrap();
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(gate.occupancy(), 1);
    }

    #[test]
    fn blocked_reserve_observes_cancel() {
        let gate = Arc::new(CapacityGate::new(0, 1));
        gate.try_reserve(1);
        let cancel = CancelToken::new();
        let c = cancel.clone();
        let g = gate.clone();
        let handle = thread::spawn(move || g.reserve(1, &c));
        cancel.cancel();
        assert_eq!(handle.join().unwrap(), Err(GateError::Cancelled));
    }

    #[test]
    fn close_wakes_parked_producer() {
        let gate = Arc::new(CapacityGate::new(0, 1));
        gate.try_reserve(1);
        let g = gate.clone();
        let handle = thread::spawn(move || g.reserve(1, &CancelToken::new()));
        thread::sleep(Duration::from_millis(10));
        gate.close();
        assert_eq!(handle.join().unwrap(), Err(GateError::Closed));
    }

    #[test]
    fn over_release_is_reported() {
        let gate = CapacityGate::new(1, 4);
        gate.try_reserve(2);
        assert_eq!(gate.release(3), Err(2));
        assert_eq!(gate.occupancy(), 0);
    }

    #[test]
    fn levels_follow_watermarks() {
        let gate = CapacityGate::new(4, 8);
        assert_eq!(gate.level(), BufferingState::Empty);
        gate.try_reserve(2);
        assert_eq!(gate.level(), BufferingState::Low);
        gate.try_reserve(3);
        assert_eq!(gate.level(), BufferingState::Normal);
        assert_eq!(gate.reset(), 5);
        assert_eq!(gate.level(), BufferingState::Empty);
    }
}
