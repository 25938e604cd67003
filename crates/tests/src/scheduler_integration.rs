//! Scheduler tests against the real timer thread

use soundscape_core::domain::{
    Scheduler, SchedulerError, TaskContext, TaskState, PIT_CLOCK_HZ,
};
use soundscape_infra::ThreadTimingSource;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn counter() -> (Arc<AtomicUsize>, impl FnMut(&TaskContext) + Send + 'static) {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    (hits, move |_: &TaskContext| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn test_fast_and_slow_tasks_share_one_timer() {
    let mut scheduler = Scheduler::new(ThreadTimingSource::new());
    let (slow_hits, slow) = counter();
    let (fast_hits, fast) = counter();

    scheduler.schedule_at_rate(slow, 50, 0).unwrap();
    scheduler.schedule_at_rate(fast, 500, 0).unwrap();
    scheduler.dispatch().unwrap();
    assert_eq!(scheduler.service_rate(), PIT_CLOCK_HZ / (PIT_CLOCK_HZ / 500));

    thread::sleep(Duration::from_millis(300));
    scheduler.shutdown();

    let slow = slow_hits.load(Ordering::SeqCst);
    let fast = fast_hits.load(Ordering::SeqCst);
    assert!(slow > 0);
    // Both ride the same interrupt, so the ratio holds regardless of jitter.
    assert!(fast >= slow * 9, "fast={} slow={}", fast, slow);
}

#[test]
fn test_no_callback_after_terminate() {
    let mut scheduler = Scheduler::new(ThreadTimingSource::new());
    let (hits, callback) = counter();

    let handle = scheduler.schedule_at_rate(callback, 1000, 0).unwrap();
    scheduler.dispatch().unwrap();
    thread::sleep(Duration::from_millis(50));

    assert!(scheduler.terminate(&handle));
    let after = hits.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));

    assert_eq!(hits.load(Ordering::SeqCst), after);
    assert_eq!(handle.state(), TaskState::Terminated);
    assert!(!scheduler.terminate(&handle));
}

#[test]
fn test_task_terminates_itself() {
    let mut scheduler = Scheduler::new(ThreadTimingSource::new());
    let fired = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&fired);

    let handle = scheduler
        .schedule_at_rate(
            move |ctx: &TaskContext| {
                if seen.fetch_add(1, Ordering::SeqCst) == 2 {
                    ctx.defer_terminate_self();
                }
            },
            1000,
            0,
        )
        .unwrap();
    scheduler.dispatch().unwrap();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(scheduler.service_deferred(), 1);
    assert_eq!(handle.state(), TaskState::Terminated);
    scheduler.shutdown();
}

#[test]
fn test_capacity_is_enforced() {
    let mut scheduler = Scheduler::with_capacity(ThreadTimingSource::new(), 2);
    for _ in 0..2 {
        let (_hits, callback) = counter();
        scheduler.schedule_at_rate(callback, 35, 0).unwrap();
    }
    let (_hits, callback) = counter();

    assert_eq!(
        scheduler.schedule_at_rate(callback, 35, 0).unwrap_err(),
        SchedulerError::SchedulerExhausted { capacity: 2 }
    );
}

#[test]
fn test_shutdown_stops_timer_thread() {
    let mut scheduler = Scheduler::new(ThreadTimingSource::new());
    let (hits, callback) = counter();
    let handle = scheduler.schedule_at_rate(callback, 200, 0).unwrap();
    scheduler.dispatch().unwrap();
    assert!(scheduler.source().is_installed());

    thread::sleep(Duration::from_millis(30));
    scheduler.shutdown();
    let after = hits.load(Ordering::SeqCst);

    assert!(!scheduler.source().is_installed());
    assert_eq!(handle.state(), TaskState::Terminated);
    assert!(matches!(scheduler.dispatch(), Err(SchedulerError::ShutDown)));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(hits.load(Ordering::SeqCst), after);
}
