//! Deadline-ordered timers, processed once per loop tick.
//!
//! Timers live in a set keyed by `(deadline, sequence)`. The sequence number
//! is monotonically assigned so two timers with equal deadlines stay totally
//! ordered and distinguishable; a second index maps sequence to the current
//! deadline so cancellation erases both entries in one critical section.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

type TimerCallback = Box<dyn FnMut() + Send>;

/// Identifies a timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    callback: TimerCallback,
    /// Zero means one-shot.
    interval: Duration,
}

struct TimerInner {
    timers: BTreeMap<(Instant, u64), TimerEntry>,
    deadlines: HashMap<u64, Instant>,
    /// Sequence numbers cancelled from inside their own callback this tick;
    /// a periodic timer on this list must not be re-armed.
    cancelling: HashSet<u64>,
    next_seq: u64,
    processing: bool,
}

pub struct TimerManager {
    inner: Mutex<TimerInner>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            inner: Mutex::new(TimerInner {
                timers: BTreeMap::new(),
                deadlines: HashMap::new(),
                cancelling: HashSet::new(),
                next_seq: 0,
                processing: false,
            }),
        }
    }

    /// Register `callback` to run at `when`, and every `interval` after that
    /// when the interval is non-zero.
    pub fn add(
        &self,
        callback: impl FnMut() + Send + 'static,
        when: Instant,
        interval: Duration,
    ) -> TimerId {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.timers.insert(
            (when, seq),
            TimerEntry {
                callback: Box::new(callback),
                interval,
            },
        );
        inner.deadlines.insert(seq, when);
        TimerId(seq)
    }

    /// Cancel a timer. Both the deadline-ordered set and the sequence index
    /// are erased atomically; cancelling a timer that already expired this
    /// tick stops it from re-arming.
    pub fn cancel(&self, id: TimerId) {
        let mut inner = self.inner.lock();
        if let Some(when) = inner.deadlines.remove(&id.0) {
            inner.timers.remove(&(when, id.0));
        } else if inner.processing {
            inner.cancelling.insert(id.0);
        }
    }

    /// Run every timer whose deadline has passed, in deadline order, then
    /// re-arm periodic timers at `now + interval`. Callbacks run outside the
    /// lock so they may add or cancel timers freely. The event loop calls
    /// this once per tick.
    pub fn process(&self) {
        let now = Instant::now();

        let expired: Vec<(u64, TimerEntry)> = {
            let mut inner = self.inner.lock();
            match inner.timers.keys().next() {
                Some(first) if first.0 <= now => {}
                _ => return,
            }
            let remaining = inner.timers.split_off(&(now, u64::MAX));
            let expired_map = std::mem::replace(&mut inner.timers, remaining);
            let mut expired = Vec::with_capacity(expired_map.len());
            for ((_, seq), entry) in expired_map {
                inner.deadlines.remove(&seq);
                expired.push((seq, entry));
            }
            inner.processing = true;
            inner.cancelling.clear();
            expired
        };

        let mut finished = Vec::with_capacity(expired.len());
        for (seq, mut entry) in expired {
            (entry.callback)();
            crate::metrics::TIMERS_FIRED.increment();
            finished.push((seq, entry));
        }

        let mut inner = self.inner.lock();
        inner.processing = false;
        for (seq, entry) in finished {
            if !entry.interval.is_zero() && !inner.cancelling.contains(&seq) {
                let when = now + entry.interval;
                inner.timers.insert((when, seq), entry);
                inner.deadlines.insert(seq, when);
            }
        }
        inner.cancelling.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_in_deadline_order() {
        let manager = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        for (label, offset_ms) in [(2u32, 20u64), (0, 40), (1, 30)] {
            let order = order.clone();
            manager.add(
                move || order.lock().push(label),
                now - Duration::from_millis(offset_ms),
                Duration::ZERO,
            );
        }

        manager.process();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn equal_deadlines_fire_in_registration_order() {
        let manager = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let when = Instant::now() - Duration::from_millis(1);

        for label in 0..4u32 {
            let order = order.clone();
            manager.add(move || order.lock().push(label), when, Duration::ZERO);
        }

        manager.process();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn future_timers_do_not_fire() {
        let manager = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        manager.add(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            Instant::now() + Duration::from_secs(60),
            Duration::ZERO,
        );
        manager.process();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let manager = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = manager.add(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            Instant::now() - Duration::from_millis(1),
            Duration::ZERO,
        );
        manager.cancel(id);
        manager.process();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn periodic_timer_rearms() {
        let manager = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        manager.add(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            Instant::now() - Duration::from_millis(1),
            Duration::from_millis(5),
        );

        manager.process();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        std::thread::sleep(Duration::from_millis(10));
        manager.process();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn periodic_timer_can_cancel_itself() {
        let manager = Arc::new(TimerManager::new());
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

        let id = {
            let manager = manager.clone();
            let count = count.clone();
            let slot = slot.clone();
            manager.clone().add(
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                    if let Some(id) = *slot.lock() {
                        manager.cancel(id);
                    }
                },
                Instant::now() - Duration::from_millis(1),
                Duration::from_millis(1),
            )
        };
        *slot.lock() = Some(id);

        manager.process();
        std::thread::sleep(Duration::from_millis(5));
        manager.process();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
