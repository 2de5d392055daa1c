//! Timers through the io manager: recurrence, reset, cancellation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use weft::{IoManager, TimerHandle};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct LoopState {
    fires: AtomicUsize,
    stamps: Mutex<Vec<Instant>>,
    handle: Mutex<Option<TimerHandle>>,
}

/// A recurring timer that re-times itself after the 3rd fire and cancels
/// itself after the 6th: fires land at ~50,100,150 then ~350,550,750 ms.
#[test]
fn test_recurring_reset_cancel_pattern() {
    init_logs();
    let iom = IoManager::new(1, true, "t-timerloop");

    let state = Arc::new(LoopState {
        fires: AtomicUsize::new(0),
        stamps: Mutex::new(Vec::new()),
        handle: Mutex::new(None),
    });

    let t0 = Instant::now();
    let iom2 = iom.clone();
    let st = state.clone();
    let handle = iom.add_timer(
        50,
        move || {
            let n = st.fires.fetch_add(1, Ordering::SeqCst) + 1;
            st.stamps.lock().unwrap().push(Instant::now());
            let guard = st.handle.lock().unwrap();
            let handle = guard.as_ref().expect("handle published before first fire");
            if n == 3 {
                assert!(iom2.reset_timer(handle, 200, true));
            } else if n == 6 {
                assert!(iom2.cancel_timer(handle));
            }
        },
        true,
    );
    *state.handle.lock().unwrap() = Some(handle);

    iom.stop();
    let total = t0.elapsed();

    assert_eq!(state.fires.load(Ordering::SeqCst), 6, "exactly six fires");
    assert!(
        total >= Duration::from_millis(650) && total < Duration::from_secs(4),
        "pattern took {:?}",
        total
    );

    let stamps = state.stamps.lock().unwrap();
    // The reset stretches the cadence: gap 3→4 is the new 200ms period,
    // clearly longer than the original 50ms one.
    let short = stamps[1].duration_since(stamps[0]);
    let long = stamps[3].duration_since(stamps[2]);
    assert!(
        long > short + Duration::from_millis(80),
        "reset did not stretch the period: {:?} vs {:?}",
        short,
        long
    );
}

#[test]
fn test_one_shot_fires_once_and_drains() {
    init_logs();
    let iom = IoManager::new(1, true, "t-oneshot");
    let fires = Arc::new(AtomicUsize::new(0));
    let f = fires.clone();
    iom.add_timer(
        30,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    iom.stop();
    assert_eq!(fires.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancel_before_fire() {
    init_logs();
    let iom = IoManager::new(1, true, "t-cancel");
    let fires = Arc::new(AtomicUsize::new(0));
    let f = fires.clone();
    let handle = iom.add_timer(
        60_000,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    assert!(iom.cancel_timer(&handle));

    // With the timer gone the stop is immediate, not a minute away.
    let t0 = Instant::now();
    iom.stop();
    assert!(t0.elapsed() < Duration::from_secs(5));
    assert_eq!(fires.load(Ordering::SeqCst), 0);
}

#[test]
fn test_condition_timer_with_dead_witness() {
    init_logs();
    let iom = IoManager::new(1, true, "t-witness");
    let fires = Arc::new(AtomicUsize::new(0));
    let f = fires.clone();
    let witness = Arc::new(0u8);
    iom.add_condition_timer(
        30,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        &witness,
    );
    drop(witness);
    iom.stop();
    assert_eq!(fires.load(Ordering::SeqCst), 0, "gated fire must not run");
}
