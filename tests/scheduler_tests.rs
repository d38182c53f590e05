use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tilepool::{Priority, Scheduler};

#[test]
fn workers_run_every_task() {
    let scheduler = Scheduler::new(3);
    assert_eq!(scheduler.worker_count(), 3);
    let batch = scheduler.batch();
    let counter = Arc::new(AtomicUsize::new(0));

    for i in 0..200 {
        let counter = Arc::clone(&counter);
        let priority = match i % 3 {
            0 => Priority::Now,
            1 => Priority::Next,
            _ => Priority::Idle,
        };
        scheduler.submit(&batch, priority, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    scheduler.wait_idle();
    assert_eq!(counter.load(Ordering::SeqCst), 200);
    assert!(scheduler.is_idle());
}

#[test]
fn panicking_task_does_not_stop_workers() {
    let scheduler = Scheduler::new(1);
    let batch = scheduler.batch();
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler.submit(&batch, Priority::Now, || panic!("tile exploded"));
    for _ in 0..5 {
        let counter = Arc::clone(&counter);
        scheduler.submit(&batch, Priority::Next, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    scheduler.wait_idle();
    assert_eq!(counter.load(Ordering::SeqCst), 5);
}

#[test]
fn cooperative_order_follows_priority_then_promotion() {
    let scheduler = Scheduler::cooperative();
    let background = scheduler.batch();
    let visible = scheduler.batch();
    let order = Arc::new(Mutex::new(Vec::new()));

    let push = |tag: &'static str| {
        let order = Arc::clone(&order);
        move || order.lock().unwrap().push(tag)
    };
    scheduler.submit(&background, Priority::Idle, push("idle"));
    scheduler.submit(&background, Priority::Next, push("next"));
    scheduler.submit(&visible, Priority::Next, push("visible"));
    scheduler.submit(&background, Priority::Now, push("now"));

    assert_eq!(scheduler.promote(visible.id()), 1);
    assert_eq!(scheduler.pending(), [2, 1, 1]);

    scheduler.wait_idle();
    assert_eq!(
        *order.lock().unwrap(),
        ["visible", "now", "next", "idle"]
    );
}

#[test]
fn cancelled_batch_is_skipped() {
    let scheduler = Scheduler::cooperative();
    let doomed = scheduler.batch();
    let kept = scheduler.batch();
    let counter = Arc::new(AtomicUsize::new(0));

    for batch in [&doomed, &kept] {
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            scheduler.submit(batch, Priority::Now, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
    }
    assert_eq!(scheduler.cancel(&doomed), 4);
    assert!(doomed.is_cancelled());
    assert_eq!(scheduler.run_until_idle(), 4);
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}
