use weft::{EventError, EventKind, IoManager, Trigger, Waiter};

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

#[test]
fn test_readiness_fires_the_registered_callback() {
    let manager = IoManager::new("ready", 2).expect("Failed to start manager");
    let (reader, mut writer) = UnixStream::pair().expect("Failed to create socket pair");
    reader
        .set_nonblocking(true)
        .expect("Failed to set non-blocking");

    let (tx, rx) = mpsc::channel();
    manager
        .add_event(
            reader.as_raw_fd(),
            EventKind::Read,
            Waiter::Callback(Box::new(move |trigger| {
                tx.send(trigger).expect("Failed to send trigger");
            })),
        )
        .expect("Failed to register read interest");

    writer.write_all(b"x").expect("Failed to write");

    let trigger = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Readiness callback never fired");
    assert_eq!(trigger, Trigger::Ready);
    assert!(!manager.has_registration(reader.as_raw_fd()));
    manager.stop();
}

#[test]
fn test_duplicate_directional_registration_is_an_error() {
    let manager = IoManager::new("dup", 2).expect("Failed to start manager");
    let (reader, _writer) = UnixStream::pair().expect("Failed to create socket pair");
    let fd = reader.as_raw_fd();

    manager
        .add_event(fd, EventKind::Read, Waiter::Callback(Box::new(|_| {})))
        .expect("Failed to register read interest");

    match manager.add_event(fd, EventKind::Read, Waiter::Callback(Box::new(|_| {}))) {
        Err(EventError::AlreadyRegistered {
            kind: EventKind::Read,
            ..
        }) => {}
        other => panic!("expected AlreadyRegistered, got {:?}", other.err()),
    }

    assert!(manager.del_event(fd, EventKind::Read));
    manager.stop();
}

#[test]
fn test_del_event_without_registration_returns_false() {
    let manager = IoManager::new("del", 2).expect("Failed to start manager");
    let (reader, _writer) = UnixStream::pair().expect("Failed to create socket pair");

    assert!(!manager.del_event(reader.as_raw_fd(), EventKind::Read));
    assert!(!manager.del_event(reader.as_raw_fd(), EventKind::Write));
    manager.stop();
}

#[test]
fn test_cancel_event_fires_callback_with_cancellation() {
    let manager = IoManager::new("cancel-ev", 2).expect("Failed to start manager");
    let (reader, _writer) = UnixStream::pair().expect("Failed to create socket pair");
    let fd = reader.as_raw_fd();

    let (tx, rx) = mpsc::channel();
    manager
        .add_event(
            fd,
            EventKind::Read,
            Waiter::Callback(Box::new(move |trigger| {
                tx.send(trigger).expect("Failed to send trigger");
            })),
        )
        .expect("Failed to register read interest");

    assert!(manager.cancel_event(fd, EventKind::Read));
    let trigger = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Cancelled callback never ran");
    assert_eq!(trigger, Trigger::Cancelled);

    // Cancelling again finds nothing.
    assert!(!manager.cancel_event(fd, EventKind::Read));
    manager.stop();
}

#[test]
fn test_taken_waiter_observes_stores_made_before_scheduling() {
    let manager = IoManager::new("take", 2).expect("Failed to start manager");
    let (reader, _writer) = UnixStream::pair().expect("Failed to create socket pair");
    let fd = reader.as_raw_fd();

    // Mirrors the hook layer's timeout path: the timed-out flag must be
    // published between claiming the waiter and scheduling it, or the
    // resumed waiter can miss it.
    let flag = Arc::new(AtomicBool::new(false));
    let seen = flag.clone();
    let (tx, rx) = mpsc::channel();
    manager
        .add_event(
            fd,
            EventKind::Read,
            Waiter::Callback(Box::new(move |_| {
                tx.send(seen.load(Ordering::Acquire))
                    .expect("Failed to send observation");
            })),
        )
        .expect("Failed to register read interest");

    let waiter = manager
        .take_event(fd, EventKind::Read)
        .expect("No waiter to take");
    flag.store(true, Ordering::Release);
    manager.schedule_waiter(waiter);

    let observed = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Taken waiter never ran");
    assert!(observed, "waiter ran before the store was published");
    assert!(!manager.has_registration(fd));

    // Taking again finds nothing; the claim consumed the registration.
    assert!(manager.take_event(fd, EventKind::Read).is_none());
    manager.stop();
}

#[test]
fn test_registration_table_introspection() {
    let manager = IoManager::new("table", 2).expect("Failed to start manager");
    let (reader, _writer) = UnixStream::pair().expect("Failed to create socket pair");
    let fd = reader.as_raw_fd();

    assert_eq!(manager.pending_events(), 0);
    assert!(!manager.has_registration(fd));

    manager
        .add_event(fd, EventKind::Read, Waiter::Callback(Box::new(|_| {})))
        .expect("Failed to register read interest");
    manager
        .add_event(fd, EventKind::Write, Waiter::Callback(Box::new(|_| {})))
        .expect("Failed to register write interest");

    assert_eq!(manager.pending_events(), 2);
    assert!(manager.has_registration(fd));

    assert!(manager.del_event(fd, EventKind::Write));
    assert_eq!(manager.pending_events(), 1);
    assert!(manager.has_registration(fd));

    assert!(manager.del_event(fd, EventKind::Read));
    assert_eq!(manager.pending_events(), 0);
    assert!(!manager.has_registration(fd));
    manager.stop();
}

#[test]
fn test_cancel_all_releases_both_directions() {
    let manager = IoManager::new("cancel-all", 2).expect("Failed to start manager");
    let (reader, _writer) = UnixStream::pair().expect("Failed to create socket pair");
    let fd = reader.as_raw_fd();

    let (tx, rx) = mpsc::channel();
    for kind in [EventKind::Read, EventKind::Write] {
        let tx = tx.clone();
        manager
            .add_event(
                fd,
                kind,
                Waiter::Callback(Box::new(move |trigger| {
                    tx.send(trigger).expect("Failed to send trigger");
                })),
            )
            .expect("Failed to register interest");
    }

    assert!(manager.cancel_all(fd));
    for _ in 0..2 {
        let trigger = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("Cancelled callback never ran");
        assert_eq!(trigger, Trigger::Cancelled);
    }
    assert!(!manager.has_registration(fd));
    manager.stop();
}

#[test]
fn test_stop_cancels_outstanding_registrations() {
    let manager = IoManager::new("teardown", 2).expect("Failed to start manager");
    let (reader, _writer) = UnixStream::pair().expect("Failed to create socket pair");

    let (tx, rx) = mpsc::channel();
    manager
        .add_event(
            reader.as_raw_fd(),
            EventKind::Read,
            Waiter::Callback(Box::new(move |trigger| {
                tx.send(trigger).expect("Failed to send trigger");
            })),
        )
        .expect("Failed to register read interest");

    manager.stop();
    let trigger = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("Teardown callback never ran");
    assert_eq!(trigger, Trigger::Cancelled);
}

#[test]
fn test_registration_rejected_after_stop() {
    let manager = IoManager::new("late", 2).expect("Failed to start manager");
    let (reader, _writer) = UnixStream::pair().expect("Failed to create socket pair");

    manager.stop();
    match manager.add_event(
        reader.as_raw_fd(),
        EventKind::Read,
        Waiter::Callback(Box::new(|_| {})),
    ) {
        Err(EventError::ShuttingDown) => {}
        other => panic!("expected ShuttingDown, got {:?}", other.err()),
    }
}
