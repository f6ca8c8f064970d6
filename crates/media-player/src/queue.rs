//! Thread-safe bounded queues between pipeline stages.
//!
//! Every stage boundary is a [`StageQueue`]:
//! - demux thread → per-track packet queue → decode thread
//! - decode thread → per-track frame queue → process thread
//! - process thread → output queue → render thread (or frame reader)
//!
//! Capacity is accounted by a [`CapacityGate`] using each item's [`Weighted::cost`],
//! so packet queues budget bytes while frame queues budget sample frames or counts.
//! Shutdown is deterministic: `close()` lets consumers drain what is left, while
//! `flush()` discards everything for a seek.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use media_player_types::BufferingState;

use crate::cancel::{CANCEL_POLL, CancelToken};
use crate::capacity::{CapacityGate, GateError, Reservation};
use crate::error::PlayerError;

/// Budget units an item occupies in a queue.
pub trait Weighted {
    fn cost(&self) -> usize;
}

/// Result of a blocking pop.
#[derive(Debug)]
pub enum Popped<T> {
    Item(T),
    /// Closed by the producer and fully drained.
    Closed,
    Cancelled,
    /// Only returned by [`StageQueue::pop_timeout`].
    TimedOut,
}

/// Bounded FIFO guarded by a capacity gate.
///
/// Items and the closed flag live under one mutex; the gate is only touched while
/// that mutex is held on the consumer side, so `flush()` can verify that the gate
/// agrees with what is actually queued.
pub struct StageQueue<T> {
    name: &'static str,
    gate: CapacityGate,
    inner: Mutex<Inner<T>>,
    cv: Condvar,
    low_watermark_ms: AtomicU64,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Compute a conservative budget in sample frames for `seconds` of audio at `rate_hz`.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub fn calc_max_buffered_frames(rate_hz: u32, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };
    (rate_hz as f32 * secs).ceil() as usize
}

impl<T: Weighted> StageQueue<T> {
    pub fn new(name: &'static str, low: usize, high: usize) -> Self {
        Self {
            name,
            gate: CapacityGate::new(low, high),
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push one item, parking while the gate is suspended.
    ///
    /// Fails with [`GateError::Closed`] once the queue is closed; the item is dropped.
    pub fn push(&self, item: T, cancel: &CancelToken) -> Result<(), GateError> {
        let cost = item.cost();
        self.gate.reserve(cost, cancel)?;
        let mut g = self.lock();
        if g.closed {
            drop(g);
            self.give_back(cost);
            return Err(GateError::Closed);
        }
        g.items.push_back(item);
        drop(g);
        self.cv.notify_all();
        Ok(())
    }

    /// Push without waiting; hands the item back when the gate is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let cost = item.cost();
        if self.gate.try_reserve(cost) == Reservation::Full {
            return Err(item);
        }
        let mut g = self.lock();
        if g.closed {
            drop(g);
            self.give_back(cost);
            return Err(item);
        }
        g.items.push_back(item);
        drop(g);
        self.cv.notify_all();
        Ok(())
    }

    fn take_front(&self, g: &mut Inner<T>) -> Option<T> {
        let item = g.items.pop_front()?;
        self.give_back(item.cost());
        Some(item)
    }

    /// Return `cost` units to the gate. `false` when the gate held less than that.
    fn give_back(&self, cost: usize) -> bool {
        match self.gate.release(cost) {
            Ok(()) => true,
            Err(held) => {
                tracing::error!(
                    queue = self.name,
                    held,
                    released = cost,
                    "capacity gate under-run"
                );
                false
            }
        }
    }

    /// Pop the next item, blocking until one arrives, the queue closes, or `cancel` fires.
    pub fn pop(&self, cancel: &CancelToken) -> Popped<T> {
        let mut g = self.lock();
        loop {
            if let Some(item) = self.take_front(&mut g) {
                drop(g);
                self.log_low_watermark();
                return Popped::Item(item);
            }
            if g.closed {
                return Popped::Closed;
            }
            if cancel.is_cancelled() {
                return Popped::Cancelled;
            }
            let (ng, _timeout) = self
                .cv
                .wait_timeout(g, CANCEL_POLL)
                .unwrap_or_else(|e| e.into_inner());
            g = ng;
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration, cancel: &CancelToken) -> Popped<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut g = self.lock();
        loop {
            if let Some(item) = self.take_front(&mut g) {
                drop(g);
                self.log_low_watermark();
                return Popped::Item(item);
            }
            if g.closed {
                return Popped::Closed;
            }
            if cancel.is_cancelled() {
                return Popped::Cancelled;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Popped::TimedOut;
            }
            let wait = (deadline - now).min(CANCEL_POLL);
            let (ng, _timeout) = self
                .cv
                .wait_timeout(g, wait)
                .unwrap_or_else(|e| e.into_inner());
            g = ng;
        }
    }

    /// Pop immediately if something is queued.
    pub fn try_pop(&self) -> Option<T> {
        let mut g = self.lock();
        let item = self.take_front(&mut g);
        drop(g);
        if item.is_some() {
            self.log_low_watermark();
        }
        item
    }

    /// Run `f` on the head item without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let g = self.lock();
        g.items.front().map(f)
    }

    /// Mark the queue finished and wake all waiters.
    ///
    /// Consumers drain remaining items and then observe [`Popped::Closed`]; parked
    /// producers return [`GateError::Closed`]. Idempotent.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        self.gate.close();
        drop(g);
        self.cv.notify_all();
    }

    /// Accept items again after a flush.
    pub fn reopen(&self) {
        let mut g = self.lock();
        g.closed = false;
        self.gate.reopen();
        drop(g);
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closed and empty: nothing more will ever be popped.
    pub fn is_drained(&self) -> bool {
        let g = self.lock();
        g.closed && g.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Gate occupancy in cost units.
    pub fn occupancy(&self) -> usize {
        self.gate.occupancy()
    }

    pub fn level(&self) -> BufferingState {
        self.gate.level()
    }

    pub fn capacity(&self) -> usize {
        self.gate.high_watermark()
    }

    /// Discard every queued item and reset the gate.
    ///
    /// Callers must have stopped all producers first. A gate that disagrees with the
    /// discarded contents means accounting is broken and is reported as
    /// [`PlayerError::Inconsistent`].
    pub fn flush(&self) -> Result<usize, PlayerError> {
        let mut g = self.lock();
        let dropped = g.items.len();
        let expected: usize = g.items.iter().map(Weighted::cost).sum();
        g.items.clear();
        let held = self.gate.reset();
        drop(g);
        self.cv.notify_all();
        if held != expected {
            return Err(PlayerError::Inconsistent(format!(
                "queue {} held {held} units in its gate but {expected} in items",
                self.name
            )));
        }
        if dropped > 0 {
            tracing::debug!(queue = self.name, dropped, "queue flushed");
        }
        Ok(dropped)
    }

    /// Wait briefly for any item to appear; `true` if one is queued before `timeout`.
    pub fn wait_for_any(&self, timeout: Duration) -> bool {
        let g = self.lock();
        if !g.items.is_empty() {
            return true;
        }
        let (g, _timeout) = self
            .cv
            .wait_timeout(g, timeout)
            .unwrap_or_else(|e| e.into_inner());
        !g.items.is_empty()
    }

    /// Block until the queue is closed and drained, or `cancel` fires.
    ///
    /// Returns `true` if the queue drained normally.
    pub fn wait_until_drained_or_cancel(&self, cancel: &CancelToken) -> bool {
        let mut g = self.lock();
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if g.closed && g.items.is_empty() {
                return true;
            }
            let (ng, _timeout) = self
                .cv
                .wait_timeout(g, CANCEL_POLL)
                .unwrap_or_else(|e| e.into_inner());
            g = ng;
        }
    }

    fn log_low_watermark(&self) {
        let occupancy = self.gate.occupancy();
        let threshold = self.gate.low_watermark();
        if occupancy > 0 && occupancy < threshold {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_millis(0))
                .as_millis() as u64;
            let last = self.low_watermark_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) > 1000 {
                self.low_watermark_ms.store(now, Ordering::Relaxed);
                tracing::debug!(
                    queue = self.name,
                    occupancy,
                    threshold,
                    "queue below low watermark"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug, PartialEq)]
    struct Blob(usize);

    impl Weighted for Blob {
        fn cost(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn calc_max_buffered_frames_fallbacks() {
        assert_eq!(calc_max_buffered_frames(48_000, 2.0), 96_000);
        assert_eq!(calc_max_buffered_frames(48_000, -1.0), 96_000);
        assert_eq!(calc_max_buffered_frames(48_000, f32::NAN), 96_000);
        assert_eq!(calc_max_buffered_frames(48_000, 0.5), 24_000);
    }

    #[test]
    fn try_pop_empty() {
        let q: StageQueue<Blob> = StageQueue::new("t", 1, 4);
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn fifo_order_and_occupancy() {
        let q = StageQueue::new("t", 2, 16);
        let cancel = CancelToken::new();
        q.push(Blob(3), &cancel).unwrap();
        q.push(Blob(5), &cancel).unwrap();
        assert_eq!(q.occupancy(), 8);
        assert_eq!(q.try_pop(), Some(Blob(3)));
        assert_eq!(q.occupancy(), 5);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn producer_parks_until_consumer_drains_to_low_watermark() {
        let q = Arc::new(StageQueue::new("t", 1, 3));
        let cancel = CancelToken::new();
        for _ in 0..3 {
            q.push(Blob(1), &cancel).unwrap();
        }
        let producer = q.clone();
        let handle = thread::spawn(move || producer.push(Blob(1), &CancelToken::new()));

        thread::sleep(Duration::from_millis(30));
        assert_eq!(q.len(), 3);
        q.try_pop();
        thread::sleep(Duration::from_millis(30));
        // Still above the low watermark: producer stays parked.
        assert_eq!(q.len(), 2);
        q.try_pop();
        handle.join().unwrap().unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = Arc::new(StageQueue::new("t", 1, 8));
        let consumer = q.clone();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let start = barrier.clone();
        let handle = thread::spawn(move || {
            start.wait();
            match consumer.pop(&CancelToken::new()) {
                Popped::Item(b) => b,
                other => panic!("unexpected {other:?}"),
            }
        });
        barrier.wait();
        q.push(Blob(2), &CancelToken::new()).unwrap();
        assert_eq!(handle.join().unwrap(), Blob(2));
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let q = StageQueue::new("t", 1, 8);
        q.push(Blob(1), &CancelToken::new()).unwrap();
        q.close();
        assert!(matches!(q.pop(&CancelToken::new()), Popped::Item(Blob(1))));
        assert!(matches!(q.pop(&CancelToken::new()), Popped::Closed));
        assert!(q.is_drained());
        assert_eq!(q.push(Blob(1), &CancelToken::new()), Err(GateError::Closed));
    }

    #[test]
    fn pop_observes_cancel() {
        let q: StageQueue<Blob> = StageQueue::new("t", 1, 8);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(q.pop(&cancel), Popped::Cancelled));
    }

    #[test]
    fn pop_timeout_times_out() {
        let q: StageQueue<Blob> = StageQueue::new("t", 1, 8);
        let res = q.pop_timeout(Duration::from_millis(5), &CancelToken::new());
        assert!(matches!(res, Popped::TimedOut));
    }

    #[test]
    fn flush_empties_queue_and_gate() {
        let q = StageQueue::new("t", 1, 8);
        q.push(Blob(2), &CancelToken::new()).unwrap();
        q.push(Blob(3), &CancelToken::new()).unwrap();
        assert_eq!(q.flush().unwrap(), 2);
        assert_eq!(q.occupancy(), 0);
        assert!(q.is_empty());
        assert_eq!(q.level(), BufferingState::Empty);
    }

    #[test]
    fn flush_detects_gate_desync() {
        let q = StageQueue::new("t", 1, 8);
        q.push(Blob(2), &CancelToken::new()).unwrap();
        // Simulate a producer that reserved but never enqueued.
        q.gate.try_reserve(1);
        assert!(matches!(q.flush(), Err(PlayerError::Inconsistent(_))));
        assert_eq!(q.occupancy(), 0);
    }

    #[test]
    fn rejected_push_returns_its_reservation() {
        let q = StageQueue::new("t", 1, 8);
        q.close();
        assert_eq!(q.push(Blob(3), &CancelToken::new()), Err(GateError::Closed));
        assert_eq!(q.try_push(Blob(2)), Err(Blob(2)));
        assert_eq!(q.occupancy(), 0);
        assert!(q.give_back(0));
        // Nothing is reserved, so returning units is a desync.
        assert!(!q.give_back(3));
        assert_eq!(q.occupancy(), 0);
    }

    #[test]
    fn reopen_accepts_items_again() {
        let q = StageQueue::new("t", 1, 8);
        q.close();
        q.reopen();
        q.push(Blob(1), &CancelToken::new()).unwrap();
        assert!(!q.is_closed());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn wait_until_drained_or_cancel_respects_cancel() {
        let q: StageQueue<Blob> = StageQueue::new("t", 1, 8);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(!q.wait_until_drained_or_cancel(&cancel));
        q.close();
        assert!(q.wait_until_drained_or_cancel(&CancelToken::new()));
    }
}
