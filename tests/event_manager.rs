// tests/event_manager.rs

//! Event manager behavior: turn ordering, cancellation, and the OS-event
//! primitives.

mod common;

use std::cell::{Cell, RefCell};
use std::os::fd::AsRawFd;
use std::rc::Rc;

use probuild::event::{EventManager, Executor};
use probuild::promise::Promise;

#[test]
fn yields_run_in_fifo_order_one_per_turn() {
    let em = EventManager::new();
    let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    let mut handles = Vec::new();
    for n in 1..=3 {
        let order = order.clone();
        handles.push(em.run_later(Box::new(move || {
            order.borrow_mut().push(n);
        })));
    }

    assert_eq!(em.pending_turns(), 3);
    assert!(em.turn_once());
    assert_eq!(*order.borrow(), vec![1]);
    assert!(em.turn_once());
    assert!(em.turn_once());
    assert!(!em.turn_once());
    assert_eq!(*order.borrow(), vec![1, 2, 3]);
}

#[test]
fn callbacks_registered_during_a_turn_wait_for_later_turns() {
    let em = EventManager::new();
    let ran_inner = Rc::new(Cell::new(false));

    let inner_flag = ran_inner.clone();
    let em2 = em.clone();
    let keep: Rc<RefCell<Vec<_>>> = Rc::new(RefCell::new(Vec::new()));
    let keep2 = keep.clone();
    let _outer = em.run_later(Box::new(move || {
        let inner_flag = inner_flag.clone();
        let handle = em2.run_later(Box::new(move || {
            inner_flag.set(true);
        }));
        keep2.borrow_mut().push(handle);
    }));

    assert!(em.turn_once());
    assert!(!ran_inner.get());
    assert!(em.turn_once());
    assert!(ran_inner.get());
}

#[test]
fn dropping_a_pending_runnable_cancels_it() {
    let em = EventManager::new();
    let ran = Rc::new(Cell::new(false));

    let flag = ran.clone();
    let handle = em.run_later(Box::new(move || {
        flag.set(true);
    }));
    assert_eq!(em.pending_turns(), 1);

    drop(handle);
    assert_eq!(em.pending_turns(), 0);
    assert!(!em.turn_once());
    assert!(!ran.get());
}

#[test]
fn loop_exits_when_nothing_is_pending() {
    common::run_local(async {
        let em = EventManager::new();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        em.run_detached(move || flag.set(true));
        em.run().await.expect("run");
        assert!(ran.get());
    });
}

#[test]
fn on_process_exit_reports_the_exit_code() {
    common::run_local(async {
        let em = EventManager::new();
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg("exit 7");
        let child = command.spawn().expect("spawning child");

        let (promise, fulfiller) = Promise::<i32>::pending();
        let op = em.on_process_exit(child, move |status| fulfiller.fulfill(status));
        let promise = promise.attach(op);

        let status = common::with_timeout(em.run_until(promise))
            .await
            .expect("run_until");
        assert_eq!(status, 7);
    });
}

#[test]
fn on_process_exit_reports_signals_as_negative_status() {
    common::run_local(async {
        let em = EventManager::new();
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg("kill -TERM $$");
        let child = command.spawn().expect("spawning child");

        let (promise, fulfiller) = Promise::<i32>::pending();
        let op = em.on_process_exit(child, move |status| fulfiller.fulfill(status));
        let promise = promise.attach(op);

        let status = common::with_timeout(em.run_until(promise))
            .await
            .expect("run_until");
        assert_eq!(status, -15);
    });
}

#[test]
fn on_readable_fires_when_data_arrives() {
    common::run_local(async {
        let em = EventManager::new();
        let (ours, theirs) = std::os::unix::net::UnixStream::pair().expect("socket pair");

        let (promise, fulfiller) = Promise::<()>::pending();
        let op = em.on_readable(ours.as_raw_fd(), move || fulfiller.fulfill(()));
        let promise = promise.attach(op);

        use std::io::Write;
        (&theirs).write_all(b"x").expect("writing");

        common::with_timeout(em.run_until(promise))
            .await
            .expect("run_until");
        drop(ours);
    });
}

#[test]
fn on_file_change_fires_on_modification() {
    common::run_local(async {
        let tree = common::TempTree::new(&[("watched.txt", "before")]);
        let em = EventManager::new();
        let path = tree.path().join("watched.txt");

        let (promise, fulfiller) = Promise::<()>::pending();
        let op = em
            .on_file_change(&path, move || fulfiller.fulfill(()))
            .expect("watching file");
        let promise = promise.attach(op);

        tree.write("watched.txt", "after");

        common::with_timeout(em.run_until(promise))
            .await
            .expect("run_until");
    });
}

#[test]
fn dropped_file_watch_does_not_fire() {
    common::run_local(async {
        let tree = common::TempTree::new(&[("watched.txt", "before")]);
        let em = EventManager::new();
        let path = tree.path().join("watched.txt");

        let cancelled_fired = Rc::new(Cell::new(false));
        let flag = cancelled_fired.clone();
        let dropped = em
            .on_file_change(&path, move || flag.set(true))
            .expect("watching file");
        drop(dropped);

        // A second watch on the same path proves the event was delivered
        // while the first subscription stayed silent.
        let (promise, fulfiller) = Promise::<()>::pending();
        let op = em
            .on_file_change(&path, move || fulfiller.fulfill(()))
            .expect("watching file");
        let promise = promise.attach(op);

        tree.write("watched.txt", "after");

        common::with_timeout(em.run_until(promise))
            .await
            .expect("run_until");
        assert!(!cancelled_fired.get());
    });
}
