use weft::{Fiber, Scheduler, Task};

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn test_all_scheduled_callables_run_before_stop_returns() {
    let scheduler = Scheduler::new("sched", 5, false);
    scheduler.start().expect("Failed to start scheduler");

    let counter = Arc::new(Mutex::new(0));
    for _ in 0..100 {
        let counter = counter.clone();
        scheduler.schedule(move || {
            *counter.lock().unwrap() += 1;
        });
    }

    scheduler.stop();
    assert_eq!(*counter.lock().unwrap(), 100);
}

#[test]
fn test_fifo_order_on_a_single_worker() {
    let scheduler = Scheduler::new("fifo", 1, false);
    scheduler.start().expect("Failed to start scheduler");

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..20 {
        let order = order.clone();
        scheduler.schedule(move || order.lock().unwrap().push(i));
    }

    scheduler.stop();
    assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
}

#[test]
fn test_schedule_from_inside_a_running_fiber() {
    let scheduler = Arc::new(Scheduler::new("nested", 2, false));
    scheduler.start().expect("Failed to start scheduler");

    let (tx, rx) = mpsc::channel();
    let inner_scheduler = scheduler.clone();
    scheduler.schedule(move || {
        let tx = tx.clone();
        inner_scheduler.schedule(move || {
            tx.send(42).expect("Failed to send result");
        });
    });

    let value = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Nested task never ran");
    assert_eq!(value, 42);
    scheduler.stop();
}

#[test]
fn test_pinned_tasks_run_on_the_chosen_worker() {
    let scheduler = Scheduler::new("pin", 3, false);
    scheduler.start().expect("Failed to start scheduler");

    let (tx, rx) = mpsc::channel();
    for _ in 0..5 {
        let tx = tx.clone();
        scheduler.schedule_pinned(
            Task::call(move || {
                tx.send(weft::thread::current_thread_name())
                    .expect("Failed to send thread name");
            }),
            1,
        );
    }

    for _ in 0..5 {
        let name = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("Pinned task never ran");
        assert_eq!(name, "pin-1");
    }
    scheduler.stop();
}

#[test]
fn test_yielding_ready_reenqueues_behind_waiting_work() {
    let scheduler = Scheduler::new("yield", 1, false);

    let order = Arc::new(Mutex::new(Vec::new()));
    let yielder_order = order.clone();
    scheduler.schedule(move || {
        yielder_order.lock().unwrap().push(0);
        Fiber::yield_ready();
        yielder_order.lock().unwrap().push(2);
        Fiber::yield_ready();
        yielder_order.lock().unwrap().push(3);
    });
    let other_order = order.clone();
    scheduler.schedule(move || {
        other_order.lock().unwrap().push(1);
    });

    // Start after both are queued so the single worker sees them in order.
    scheduler.start().expect("Failed to start scheduler");
    scheduler.stop();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn test_panicking_task_does_not_kill_the_worker() {
    let scheduler = Scheduler::new("fault", 1, false);
    scheduler.start().expect("Failed to start scheduler");

    scheduler.schedule(|| panic!("task failure"));

    let (tx, rx) = mpsc::channel();
    scheduler.schedule(move || {
        tx.send(()).expect("Failed to send completion");
    });

    rx.recv_timeout(Duration::from_secs(5))
        .expect("Worker did not survive the panicking task");
    scheduler.stop();
}

#[test]
fn test_scheduling_an_existing_fiber() {
    let scheduler = Scheduler::new("fiber", 2, false);
    scheduler.start().expect("Failed to start scheduler");

    let (tx, rx) = mpsc::channel();
    let fiber = Fiber::spawn(
        move || {
            tx.send(()).expect("Failed to send completion");
        },
        weft::DEFAULT_STACK_SIZE,
    )
    .expect("Failed to spawn fiber");

    scheduler.schedule_fiber(fiber);
    rx.recv_timeout(Duration::from_secs(5))
        .expect("Fiber never ran");
    scheduler.stop();
}

#[test]
fn test_use_caller_runs_pending_work_on_stop() {
    let scheduler = Scheduler::new("caller", 1, true);
    scheduler.start().expect("Failed to start scheduler");

    let counter = Arc::new(Mutex::new(0));
    for _ in 0..5 {
        let counter = counter.clone();
        scheduler.schedule(move || {
            *counter.lock().unwrap() += 1;
        });
    }

    // No worker threads were spawned; the constructing thread runs the
    // dispatch loop inside stop.
    scheduler.stop();
    assert_eq!(*counter.lock().unwrap(), 5);
}

#[test]
fn test_stop_is_idempotent() {
    let scheduler = Scheduler::new("twice", 2, false);
    scheduler.start().expect("Failed to start scheduler");
    scheduler.stop();
    scheduler.stop();
}

#[test]
#[should_panic(expected = "threads must be > 0")]
fn test_zero_workers_panics() {
    let _ = Scheduler::new("zero", 0, false);
}
