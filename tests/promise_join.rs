// tests/promise_join.rs

//! Joins, chaining, and error propagation through `when*`.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use common::MockExecutor;
use probuild::errors::BuildError;
use probuild::promise::{self, MaybeException, Promise, PromiseFulfiller};

#[test]
fn join_schedules_only_after_every_input() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (p1, f1) = Promise::<i32>::pending();
    let (p2, f2) = Promise::<i32>::pending();

    let sum = promise::when2(&exec, p1, p2).then(|a: i32, b: i32| a + b);

    let result = Rc::new(Cell::new(0));
    let sink = result.clone();
    let _done = promise::when(&exec, sum).then(move |value: i32| {
        sink.set(value);
    });

    assert!(mock.is_empty());
    f1.fulfill(12);
    assert!(mock.is_empty());
    f2.fulfill(34);
    assert_eq!(mock.len(), 1);

    mock.run_next();
    assert_eq!(mock.len(), 1);
    mock.run_next();
    assert_eq!(result.get(), 46);
}

#[test]
fn fulfilling_with_an_inner_promise_chains() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (inner, inner_fulfiller) = Promise::<i32>::pending();
    let (outer, outer_fulfiller) = Promise::<i32>::pending();

    let result = Rc::new(Cell::new(0));
    let sink = result.clone();
    let _done = promise::when(&exec, outer).then(move |value: i32| {
        sink.set(value);
    });

    assert!(mock.is_empty());
    outer_fulfiller.fulfill_with(inner);
    assert!(mock.is_empty());
    assert_eq!(result.get(), 0);

    inner_fulfiller.fulfill(123);
    assert_eq!(mock.len(), 1);
    mock.run_next();
    assert_eq!(result.get(), 123);
}

#[test]
fn chaining_works_for_unit_promises() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (inner, inner_fulfiller) = Promise::<()>::pending();
    let (outer, outer_fulfiller) = Promise::<()>::pending();

    let triggered = Rc::new(Cell::new(false));
    let flag = triggered.clone();
    let _done = promise::when(&exec, outer).then(move |()| {
        flag.set(true);
    });

    outer_fulfiller.fulfill_with(inner);
    assert!(mock.is_empty());
    assert!(!triggered.get());

    inner_fulfiller.fulfill(());
    assert_eq!(mock.len(), 1);
    mock.run_next();
    assert!(triggered.get());
}

#[test]
fn continuation_returning_a_promise_defers_the_outer_one() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (first, first_fulfiller) = Promise::<()>::pending();
    let stashed: Rc<RefCell<Option<PromiseFulfiller<()>>>> = Rc::new(RefCell::new(None));

    let stash = stashed.clone();
    let middle = promise::when(&exec, first).then(move |()| -> Promise<()> {
        let (inner, inner_fulfiller) = Promise::<()>::pending();
        *stash.borrow_mut() = Some(inner_fulfiller);
        inner
    });

    let triggered = Rc::new(Cell::new(false));
    let flag = triggered.clone();
    let _done = promise::when(&exec, middle).then(move |()| {
        flag.set(true);
    });

    assert!(mock.is_empty());
    first_fulfiller.fulfill(());
    assert_eq!(mock.len(), 1);
    assert!(stashed.borrow().is_none());

    mock.run_next();
    assert!(stashed.borrow().is_some());
    assert!(mock.is_empty());
    assert!(!triggered.get());

    stashed.borrow_mut().take().expect("stashed fulfiller").fulfill(());
    assert_eq!(mock.len(), 1);
    mock.run_next();
    assert!(triggered.get());
}

#[test]
fn chaining_to_a_pre_fulfilled_promise_schedules_immediately() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (outer, outer_fulfiller) = Promise::<i32>::pending();
    let result = Rc::new(Cell::new(0));
    let sink = result.clone();
    let _done = promise::when(&exec, outer).then(move |value: i32| {
        sink.set(value);
    });

    assert!(mock.is_empty());
    outer_fulfiller.fulfill_with(Promise::fulfilled(123));
    assert_eq!(mock.len(), 1);
    mock.run_next();
    assert_eq!(result.get(), 123);
}

#[test]
fn failure_continuation_sees_each_input_as_value_or_exception() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (p1, f1) = Promise::<i32>::pending();
    let (p2, f2) = Promise::<i32>::pending();

    let triggered = Rc::new(Cell::new(false));
    let flag = triggered.clone();
    let _done = promise::when3(&exec, p1, p2, 123).then_catch(
        |_a: i32, _b: i32, _c: i32| -> () {
            panic!("success continuation must not run");
        },
        move |a: MaybeException<i32>, b: MaybeException<i32>, c: MaybeException<i32>| {
            flag.set(true);

            assert!(a.is_exception());
            assert!(!b.is_exception());
            assert_eq!(b.get().expect("b holds a value"), 456);
            assert_eq!(c.get().expect("c holds a value"), 123);

            let error = a.get().expect_err("a re-raises");
            assert!(error.to_string().contains("action failed: test"));
        },
    );

    f1.reject(BuildError::ActionFailed("test".to_string()));
    f2.fulfill(456);
    assert!(!triggered.get());

    mock.run_next();
    assert!(triggered.get());
}

#[test]
fn error_returned_by_a_continuation_is_captured_downstream() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (p1, f1) = Promise::<i32>::pending();

    let middle = promise::when(&exec, p1).then(|_value: i32| -> Result<i32, BuildError> {
        Err(BuildError::ActionFailed("test".to_string()))
    });

    let triggered = Rc::new(Cell::new(false));
    let flag = triggered.clone();
    let _done = promise::when(&exec, middle).then_catch(
        |_value: i32| -> () {
            panic!("success continuation must not run");
        },
        move |error: MaybeException<i32>| {
            flag.set(true);
            assert!(error.is_exception());
            let error = error.get().expect_err("re-raises");
            assert!(error.to_string().contains("action failed: test"));
        },
    );

    assert!(mock.is_empty());
    f1.fulfill(12);
    assert_eq!(mock.len(), 1);
    mock.run_next();
    assert_eq!(mock.len(), 1);
    mock.run_next();
    assert!(triggered.get());
}

#[test]
fn errors_propagate_through_handlerless_joins() {
    let mock = MockExecutor::new();
    let exec = common::as_executor(&mock);

    let (p1, f1) = Promise::<i32>::pending();

    let middle = promise::when(&exec, p1).then(|_value: i32| -> () {
        panic!("success continuation must not run");
    });

    let triggered = Rc::new(Cell::new(false));
    let flag = triggered.clone();
    let _done = promise::when(&exec, middle).then_catch(
        |()| -> () {
            panic!("success continuation must not run");
        },
        move |error: MaybeException<()>| {
            flag.set(true);
            assert!(error.is_exception());
        },
    );

    assert!(mock.is_empty());
    f1.reject(BuildError::ActionFailed("test".to_string()));
    assert_eq!(mock.len(), 1);
    mock.run_next();
    assert_eq!(mock.len(), 1);
    mock.run_next();
    assert!(triggered.get());
}
