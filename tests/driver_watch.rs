// tests/driver_watch.rs

//! Watch mode: changed inputs re-run their actions, new files are picked
//! up without a restart.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use common::{build_driver, FakeFactory, TempTree};
use probuild::action::{BuildContext, Priority};
use probuild::event::EventManager;
use probuild::promise::{Promise, PromiseFulfiller};
use probuild::tags::Tag;

/// Modify the tree from outside the loop thread after a delay, the way a
/// developer saving a file would.
fn write_later(path: std::path::PathBuf, contents: &'static str) {
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(400));
        std::fs::write(path, contents).expect("writing from helper thread");
    });
}

#[test]
fn a_changed_trigger_file_reruns_its_action() {
    common::run_local(async {
        let tree = TempTree::new(&[("input.x", "one")]);
        let em = EventManager::new();
        let (driver, _log) = build_driver(&em, &tree, true);

        let (second_run, second_run_fulfiller) = Promise::<()>::pending();
        let fulfiller: Rc<RefCell<Option<PromiseFulfiller<()>>>> =
            Rc::new(RefCell::new(Some(second_run_fulfiller)));
        let runs = Rc::new(Cell::new(0u32));

        let input_path = tree.path().join("input.x");
        driver.add_factory(FakeFactory::new(
            Tag::filetype(".x"),
            Priority::Rules,
            "build",
            move |_em, context| {
                let count = runs.get() + 1;
                runs.set(count);
                match count {
                    1 => write_later(input_path.clone(), "two"),
                    _ => {
                        if let Some(fulfiller) = fulfiller.borrow_mut().take() {
                            fulfiller.fulfill(());
                        }
                    }
                }
                context.passed();
                Promise::fulfilled(())
            },
        ));

        let _census = driver.run();
        common::with_timeout(em.run_until(second_run))
            .await
            .expect("second run");
    });
}

#[test]
fn a_new_file_is_offered_without_a_restart() {
    common::run_local(async {
        let tree = TempTree::new(&[("first.x", "")]);
        let em = EventManager::new();
        let (driver, _log) = build_driver(&em, &tree, true);

        let (both_seen, both_fulfiller) = Promise::<()>::pending();
        let fulfiller: Rc<RefCell<Option<PromiseFulfiller<()>>>> =
            Rc::new(RefCell::new(Some(both_fulfiller)));
        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

        let second_path = tree.path().join("second.x");
        driver.add_factory(FakeFactory::new(
            Tag::filetype(".x"),
            Priority::Rules,
            "build",
            move |_em, context| {
                // The trigger file is the only .x input this action reads.
                let name = match context.find_input("first.x") {
                    Some(_) => "known",
                    None => "unknown",
                };
                let mut seen = seen.borrow_mut();
                seen.push(name.to_string());
                if seen.len() == 1 {
                    write_later(second_path.clone(), "");
                } else if let Some(fulfiller) = fulfiller.borrow_mut().take() {
                    fulfiller.fulfill(());
                }
                context.passed();
                Promise::fulfilled(())
            },
        ));

        let _census = driver.run();
        common::with_timeout(em.run_until(both_seen))
            .await
            .expect("second action");
    });
}
