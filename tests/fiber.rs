use weft::{DEFAULT_STACK_SIZE, Fiber, FiberError, FiberState, Resumption};

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

#[test]
fn test_fiber_runs_to_completion() {
    let ran = Arc::new(Mutex::new(false));
    let ran_clone = ran.clone();

    let fiber = Fiber::spawn(
        move || {
            *ran_clone.lock().unwrap() = true;
        },
        DEFAULT_STACK_SIZE,
    )
    .expect("Failed to spawn fiber");

    assert_eq!(fiber.state(), FiberState::Init);
    let outcome = fiber.resume().expect("Failed to resume fiber");
    assert_eq!(outcome, Resumption::Terminated);
    assert_eq!(fiber.state(), FiberState::Terminated);
    assert!(*ran.lock().unwrap());
}

#[test]
fn test_yield_roundtrip_preserves_stack_state() {
    let steps = Arc::new(Mutex::new(Vec::new()));
    let steps_clone = steps.clone();

    let fiber = Fiber::spawn(
        move || {
            let local = 41;
            steps_clone.lock().unwrap().push(1);
            Fiber::yield_ready();
            steps_clone.lock().unwrap().push(local + 1);
        },
        DEFAULT_STACK_SIZE,
    )
    .expect("Failed to spawn fiber");

    let outcome = fiber.resume().expect("Failed to resume fiber");
    assert_eq!(outcome, Resumption::Yielded { reschedule: true });
    assert_eq!(fiber.state(), FiberState::Ready);

    let outcome = fiber.resume().expect("Failed to resume fiber");
    assert_eq!(outcome, Resumption::Terminated);
    assert_eq!(*steps.lock().unwrap(), vec![1, 42]);
}

#[test]
fn test_yield_suspended_does_not_request_reschedule() {
    let fiber = Fiber::spawn(Fiber::yield_suspended, DEFAULT_STACK_SIZE)
        .expect("Failed to spawn fiber");

    let outcome = fiber.resume().expect("Failed to resume fiber");
    assert_eq!(outcome, Resumption::Yielded { reschedule: false });

    let outcome = fiber.resume().expect("Failed to resume fiber");
    assert_eq!(outcome, Resumption::Terminated);
}

#[test]
fn test_resume_terminated_fiber_is_rejected() {
    let fiber = Fiber::spawn(|| {}, DEFAULT_STACK_SIZE).expect("Failed to spawn fiber");
    fiber.resume().expect("Failed to resume fiber");

    match fiber.resume() {
        Err(FiberError::NotResumable {
            state: FiberState::Terminated,
            ..
        }) => {}
        other => panic!("expected NotResumable, got {other:?}"),
    }
}

#[test]
fn test_concurrent_resume_is_rejected() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let fiber = Fiber::spawn(
        move || {
            entered_tx.send(()).expect("Failed to signal entry");
            release_rx.recv().expect("Failed to receive release");
        },
        DEFAULT_STACK_SIZE,
    )
    .expect("Failed to spawn fiber");

    let runner = {
        let fiber = fiber.clone();
        thread::spawn(move || {
            fiber.resume().expect("Failed to resume fiber");
        })
    };

    // The fiber is now running on the other thread, blocked in its body.
    entered_rx.recv().expect("Fiber never started");
    match fiber.resume() {
        Err(FiberError::NotResumable {
            state: FiberState::Running,
            ..
        }) => {}
        other => panic!("expected NotResumable while running, got {other:?}"),
    }

    release_tx.send(()).expect("Failed to release fiber");
    runner.join().expect("Thread panicked");
    assert_eq!(fiber.state(), FiberState::Terminated);
}

#[test]
fn test_suspended_fiber_migrates_between_threads() {
    let fiber = Fiber::spawn(Fiber::yield_ready, DEFAULT_STACK_SIZE)
        .expect("Failed to spawn fiber");

    let outcome = fiber.resume().expect("Failed to resume fiber");
    assert_eq!(outcome, Resumption::Yielded { reschedule: true });

    let mover = {
        let fiber = fiber.clone();
        thread::spawn(move || fiber.resume().expect("Failed to resume fiber"))
    };
    let outcome = mover.join().expect("Thread panicked");
    assert_eq!(outcome, Resumption::Terminated);
}

#[test]
fn test_panic_in_body_is_captured() {
    let fiber =
        Fiber::spawn(|| panic!("boom"), DEFAULT_STACK_SIZE).expect("Failed to spawn fiber");

    let outcome = fiber.resume().expect("Failed to resume fiber");
    assert_eq!(outcome, Resumption::Faulted);
    assert_eq!(fiber.state(), FiberState::Faulted);

    let payload = fiber.take_fault().expect("Fault payload missing");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
}

#[test]
fn test_every_thread_has_a_current_fiber() {
    assert!(!Fiber::in_fiber());
    let current = Fiber::current();
    assert_eq!(current.state(), FiberState::Running);
}

#[test]
fn test_in_fiber_inside_body() {
    let fiber = Fiber::spawn(
        || assert!(Fiber::in_fiber()),
        DEFAULT_STACK_SIZE,
    )
    .expect("Failed to spawn fiber");

    let outcome = fiber.resume().expect("Failed to resume fiber");
    assert_eq!(outcome, Resumption::Terminated);
}

#[test]
#[should_panic(expected = "yield called outside of a spawned fiber")]
fn test_yield_outside_fiber_panics() {
    Fiber::yield_ready();
}
