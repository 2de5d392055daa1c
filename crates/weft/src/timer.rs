//! Deadline-ordered timer set
//!
//! Timers are kept in an ordered map keyed by (absolute deadline in ms,
//! insertion sequence), so simultaneous deadlines fire in insertion order.
//! Recurring timers re-insert themselves on expiry; condition timers fire
//! only while their weak witness is still alive.
//!
//! The owner polls [`TimerSet::expire`] with the current monotonic time;
//! mutators report whether the earliest deadline changed so the owner can
//! cut short a poll that now waits too long.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Callback type fired by an expired timer. `Fn` (not `FnOnce`) because a
/// recurring timer fires many times; shared so expiry can hand it to a
/// scheduler while the set keeps the recurring entry.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Monotonic milliseconds. The absolute value is meaningless; only
/// differences are used.
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct TimerKey {
    deadline: u64,
    seq: u64,
}

struct TimerData {
    /// Current position in the set; only read or written under the set's
    /// write lock.
    deadline: AtomicU64,
    seq: AtomicU64,
    /// Delay in ms; doubles as the recurrence period. `reset` rewrites it.
    delay: AtomicU64,
    recurring: bool,
    cb: TimerCallback,
    cancelled: AtomicBool,
}

impl TimerData {
    fn key(&self) -> TimerKey {
        TimerKey {
            deadline: self.deadline.load(Ordering::Relaxed),
            seq: self.seq.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a timer in a [`TimerSet`]; pass back to `cancel` / `reset`.
#[derive(Clone)]
pub struct TimerHandle(Arc<TimerData>);

/// Thread-safe set of deadline-ordered timers.
pub struct TimerSet {
    inner: RwLock<TimerInner>,
}

struct TimerInner {
    set: BTreeMap<TimerKey, Arc<TimerData>>,
    next_seq: u64,
    /// Last time observed by `expire`, for clock-rollback detection.
    prev_now: u64,
}

impl TimerSet {
    pub fn new() -> TimerSet {
        TimerSet {
            inner: RwLock::new(TimerInner {
                set: BTreeMap::new(),
                next_seq: 0,
                prev_now: 0,
            }),
        }
    }

    /// Insert a timer firing `delay_ms` from now. Returns the handle and
    /// whether the new timer became the earliest in the set.
    pub fn add_timer<F>(&self, delay_ms: u64, cb: F, recurring: bool) -> (TimerHandle, bool)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(delay_ms, Arc::new(cb), recurring)
    }

    fn add_timer_cb(&self, delay_ms: u64, cb: TimerCallback, recurring: bool) -> (TimerHandle, bool) {
        let deadline = now_ms().saturating_add(delay_ms);
        let mut inner = self.inner.write().unwrap();

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let data = Arc::new(TimerData {
            deadline: AtomicU64::new(deadline),
            seq: AtomicU64::new(seq),
            delay: AtomicU64::new(delay_ms),
            recurring,
            cb,
            cancelled: AtomicBool::new(false),
        });
        let key = data.key();
        inner.set.insert(key, data.clone());
        let at_front = inner.set.keys().next() == Some(&key);
        (TimerHandle(data), at_front)
    }

    /// Insert a one-shot timer gated on `witness`: if the witness has been
    /// dropped by the time the deadline passes, the callback does not run.
    pub fn add_condition_timer<F, T>(
        &self,
        delay_ms: u64,
        cb: F,
        witness: &Arc<T>,
    ) -> (TimerHandle, bool)
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let weak: Weak<T> = Arc::downgrade(witness);
        self.add_timer(
            delay_ms,
            move || {
                if weak.upgrade().is_some() {
                    cb();
                }
            },
            false,
        )
    }

    /// Cancel a timer. Idempotent; returns whether the timer was still
    /// pending.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let mut inner = self.inner.write().unwrap();
        if handle.0.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        inner.set.remove(&handle.0.key()).is_some()
    }

    /// Move a pending timer to a new deadline. With `from_now` the delay is
    /// taken from the current time, otherwise from the timer's previous
    /// deadline. Returns whether the timer was still pending, and whether
    /// the set's earliest deadline changed.
    pub fn reset(&self, handle: &TimerHandle, delay_ms: u64, from_now: bool) -> (bool, bool) {
        let mut inner = self.inner.write().unwrap();
        if handle.0.cancelled.load(Ordering::Acquire) {
            return (false, false);
        }
        let old_key = handle.0.key();
        if inner.set.remove(&old_key).is_none() {
            return (false, false);
        }

        let base = if from_now {
            now_ms()
        } else {
            old_key.deadline.saturating_sub(handle.0.delay.load(Ordering::Relaxed))
        };
        let deadline = base.saturating_add(delay_ms);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        handle.0.delay.store(delay_ms, Ordering::Relaxed);
        handle.0.deadline.store(deadline, Ordering::Relaxed);
        handle.0.seq.store(seq, Ordering::Relaxed);
        let key = handle.0.key();
        inner.set.insert(key, handle.0.clone());
        let at_front = inner.set.keys().next() == Some(&key);
        (true, at_front)
    }

    /// Milliseconds until the earliest pending timer (0 if already due),
    /// or None when the set is empty.
    pub fn next_timeout(&self) -> Option<u64> {
        let inner = self.inner.read().unwrap();
        let first = inner.set.keys().next()?;
        Some(first.deadline.saturating_sub(now_ms()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().set.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().set.len()
    }

    /// Extract the callbacks of every timer due at `now`, re-inserting
    /// recurring ones at `deadline + period`.
    ///
    /// If `now` is earlier than the previous call's `now`, the clock went
    /// backwards and every outstanding timer is treated as due.
    pub fn expire(&self, now: u64) -> Vec<TimerCallback> {
        let mut inner = self.inner.write().unwrap();

        let rolled_back = now < inner.prev_now;
        inner.prev_now = now;
        if rolled_back {
            log::warn!("monotonic clock went backwards, expiring all timers");
        }

        let mut fired = Vec::new();
        let mut requeue = Vec::new();
        loop {
            let Some((&key, _)) = inner.set.iter().next() else { break };
            if !rolled_back && key.deadline > now {
                break;
            }
            let data = inner.set.remove(&key).unwrap();
            if data.cancelled.load(Ordering::Acquire) {
                continue;
            }
            if data.recurring {
                requeue.push(data.clone());
            }
            fired.push(data.cb.clone());
        }

        for data in requeue {
            let deadline = data
                .deadline
                .load(Ordering::Relaxed)
                .saturating_add(data.delay.load(Ordering::Relaxed));
            let seq = inner.next_seq;
            inner.next_seq += 1;
            data.deadline.store(deadline, Ordering::Relaxed);
            data.seq.store(seq, Ordering::Relaxed);
            inner.set.insert(data.key(), data);
        }

        fired
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + Clone) {
        let c = Arc::new(AtomicUsize::new(0));
        let c2 = c.clone();
        (c, move || {
            c2.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fire_in_deadline_order() {
        let set = TimerSet::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for (delay, tag) in [(30u64, 3u32), (10, 1), (20, 2)] {
            let o = order.clone();
            set.add_timer(delay, move || o.lock().unwrap().push(tag), false);
        }
        let fired = set.expire(now_ms() + 100);
        assert_eq!(fired.len(), 3);
        for cb in fired {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_ties_fire_in_insertion_order() {
        let set = TimerSet::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in 0..4u32 {
            let o = order.clone();
            set.add_timer(50, move || o.lock().unwrap().push(tag), false);
        }
        for cb in set.expire(now_ms() + 100) {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_not_due_not_fired() {
        let set = TimerSet::new();
        let (hits, cb) = counter();
        set.add_timer(10_000, cb, false);
        assert!(set.expire(now_ms()).is_empty());
        assert_eq!(set.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let set = TimerSet::new();
        let (hits, cb) = counter();
        let (handle, at_front) = set.add_timer(10_000, cb, false);
        assert!(at_front);
        assert!(set.cancel(&handle));
        assert!(!set.cancel(&handle));
        assert!(set.expire(now_ms() + 20_000).is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recurring_reinserts() {
        let set = TimerSet::new();
        let (hits, cb) = counter();
        let (handle, _) = set.add_timer(10, cb, true);

        for cb in set.expire(now_ms() + 50) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 1, "recurring timer must be re-inserted");

        set.cancel(&handle);
        assert!(set.is_empty());
    }

    #[test]
    fn test_reset_moves_deadline() {
        let set = TimerSet::new();
        let (hits, cb) = counter();
        let (handle, _) = set.add_timer(10, cb, false);

        let (found, _) = set.reset(&handle, 60_000, true);
        assert!(found);

        // Old deadline passes, timer must not fire.
        assert!(set.expire(now_ms() + 1000).is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_next_timeout() {
        let set = TimerSet::new();
        assert_eq!(set.next_timeout(), None);
        set.add_timer(5000, || {}, false);
        let t = set.next_timeout().unwrap();
        assert!(t <= 5000 && t > 4000, "next_timeout = {}", t);
    }

    #[test]
    fn test_condition_timer_dead_witness() {
        let set = TimerSet::new();
        let (hits, cb) = counter();
        let witness = Arc::new(1u32);
        set.add_condition_timer(10, cb, &witness);
        drop(witness);
        for cb in set.expire(now_ms() + 100) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0, "dead witness must gate the fire");
    }

    #[test]
    fn test_condition_timer_live_witness() {
        let set = TimerSet::new();
        let (hits, cb) = counter();
        let witness = Arc::new(1u32);
        set.add_condition_timer(10, cb, &witness);
        for cb in set.expire(now_ms() + 100) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(witness);
    }

    #[test]
    fn test_clock_rollback_expires_all() {
        let set = TimerSet::new();
        let (hits, cb) = counter();
        let cb2 = cb.clone();
        set.add_timer(60_000, cb, false);
        set.add_timer(120_000, cb2, false);

        let now = now_ms();
        assert!(set.expire(now).is_empty());

        // Clock goes backwards: everything is declared due.
        let fired = set.expire(now - 5000);
        assert_eq!(fired.len(), 2);
        for cb in fired {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(set.is_empty());
    }
}
