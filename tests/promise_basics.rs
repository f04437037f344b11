// tests/promise_basics.rs

//! Single-promise behavior: deferred continuations, pre-fulfilled values,
//! cancellation by drop, move-only values.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::MockExecutor;
use probuild::promise::{self, Promise};

#[test]
fn continuation_runs_one_turn_after_fulfill() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (promise, fulfiller) = Promise::<i32>::pending();
    let triggered = Rc::new(Cell::new(false));

    let flag = triggered.clone();
    let doubled = promise::when(&exec, promise).then(move |value: i32| {
        assert_eq!(value, 5);
        flag.set(true);
        value + 118
    });

    let result = Rc::new(Cell::new(0));
    let sink = result.clone();
    let _done = promise::when(&exec, doubled).then(move |value: i32| {
        sink.set(value);
    });

    assert!(!triggered.get());
    assert!(fulfiller.is_waiting());

    fulfiller.fulfill(5);
    assert!(!triggered.get());

    mock.run_next();
    assert!(triggered.get());
    assert_eq!(result.get(), 0);

    mock.run_next();
    assert_eq!(result.get(), 123);
    assert!(mock.is_empty());
}

#[test]
fn pre_fulfilled_promise_still_defers_its_continuation() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let triggered = Rc::new(Cell::new(false));
    let flag = triggered.clone();
    let _out = promise::when(&exec, Promise::fulfilled(5)).then(move |value: i32| {
        assert_eq!(value, 5);
        flag.set(true);
    });

    assert!(!triggered.get());
    mock.run_next();
    assert!(triggered.get());
}

#[test]
fn unit_promise_flows_like_any_other() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (promise, fulfiller) = Promise::<()>::pending();
    let triggered = Rc::new(Cell::new(false));
    let flag = triggered.clone();
    let _out = promise::when(&exec, promise).then(move |()| {
        flag.set(true);
    });

    assert!(!triggered.get());
    fulfiller.fulfill(());
    assert!(!triggered.get());
    mock.run_next();
    assert!(triggered.get());
}

#[test]
fn dropping_the_output_cancels_the_queued_continuation() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (promise, fulfiller) = Promise::<i32>::pending();
    let out = promise::when(&exec, promise).then(|_value: i32| -> () {
        panic!("continuation ran after cancellation");
    });

    assert!(mock.is_empty());
    fulfiller.fulfill(5);
    assert_eq!(mock.len(), 1);

    drop(out);
    assert_eq!(mock.len(), 0);
    assert!(!mock.run_next_if_any());
}

#[test]
fn fulfilling_a_dropped_promise_is_a_quiet_no_op() {
    let (promise, fulfiller) = Promise::<i32>::pending();
    assert!(fulfiller.is_waiting());
    drop(promise);
    assert!(!fulfiller.is_waiting());
    fulfiller.fulfill(5);
}

#[test]
fn move_only_values_transfer_ownership_through_joins() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (promise, fulfiller) = Promise::<Box<i32>>::pending();
    let result = Rc::new(Cell::new(0));
    let sink = result.clone();
    let _out = promise::when2(&exec, promise, Box::new(12)).then(
        move |a: Box<i32>, b: Box<i32>| {
            sink.set(*a + *b);
        },
    );

    fulfiller.fulfill(Box::new(34));
    mock.run_next();
    assert_eq!(result.get(), 46);
}
