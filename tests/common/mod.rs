// tests/common/mod.rs

#![allow(dead_code)]

use std::cell::RefCell;
use std::future::Future;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use probuild::action::{Action, ActionFactory, BuildContext, Priority};
use probuild::dashboard::{Dashboard, DashboardTask, TaskState};
use probuild::driver::{Driver, DriverOptions};
use probuild::event::{EventManager, Executor, PendingRunnable, TurnQueue};
use probuild::fs::File;
use probuild::promise::Promise;
use probuild::tags::Tag;

/// Executor with hand-cranked turns, for deterministic promise tests.
pub struct MockExecutor {
    turns: TurnQueue,
}

impl MockExecutor {
    pub fn new() -> Rc<MockExecutor> {
        Rc::new(MockExecutor {
            turns: TurnQueue::new(),
        })
    }

    /// Run the next queued turn; panics if none is queued.
    pub fn run_next(&self) {
        assert!(self.turns.run_next(), "no turn queued");
    }

    /// Run the next queued turn if there is one.
    pub fn run_next_if_any(&self) -> bool {
        self.turns.run_next()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

impl Executor for MockExecutor {
    fn run_later(&self, runnable: Box<dyn FnOnce()>) -> PendingRunnable {
        self.turns.push(runnable)
    }
}

pub fn as_executor(mock: &Rc<MockExecutor>) -> Rc<dyn Executor> {
    mock.clone()
}

/// Run a future on a fresh current-thread runtime with a `LocalSet`, the
/// environment the event manager expects.
pub fn run_local<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building test runtime");
    tokio::task::LocalSet::new().block_on(&runtime, future)
}

pub async fn with_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(15), future)
        .await
        .expect("test timed out")
}

/// Dashboard that records every state transition for later assertions.
#[derive(Clone, Default)]
pub struct DashboardLog {
    events: Rc<RefCell<Vec<(String, TaskState)>>>,
    output: Rc<RefCell<Vec<(String, String)>>>,
}

impl DashboardLog {
    pub fn states_for(&self, verb: &str) -> Vec<TaskState> {
        self.events
            .borrow()
            .iter()
            .filter(|(v, _)| v == verb)
            .map(|(_, state)| *state)
            .collect()
    }

    pub fn last_state(&self, verb: &str) -> Option<TaskState> {
        self.states_for(verb).last().copied()
    }

    pub fn output_for(&self, verb: &str) -> String {
        self.output
            .borrow()
            .iter()
            .filter(|(v, _)| v == verb)
            .map(|(_, text)| text.as_str())
            .collect()
    }
}

pub struct FakeDashboard {
    pub log: DashboardLog,
}

impl FakeDashboard {
    pub fn new() -> (Rc<FakeDashboard>, DashboardLog) {
        let log = DashboardLog::default();
        (Rc::new(FakeDashboard { log: log.clone() }), log)
    }
}

impl Dashboard for FakeDashboard {
    fn begin_task(&self, verb: &str, _noun: &str, _silent: bool) -> Box<dyn DashboardTask> {
        Box::new(FakeTask {
            verb: verb.to_string(),
            log: self.log.clone(),
        })
    }
}

struct FakeTask {
    verb: String,
    log: DashboardLog,
}

impl DashboardTask for FakeTask {
    fn set_state(&mut self, state: TaskState) {
        self.log.events.borrow_mut().push((self.verb.clone(), state));
    }

    fn add_output(&mut self, text: &str) {
        self.log
            .output
            .borrow_mut()
            .push((self.verb.clone(), text.to_string()));
    }
}

/// Action whose behavior is a closure, so tests can script arbitrary
/// context interaction.
pub struct FakeAction {
    verb: String,
    behavior: Rc<dyn Fn(&EventManager, Rc<dyn BuildContext>) -> Promise<()>>,
}

impl Action for FakeAction {
    fn verb(&self) -> &str {
        &self.verb
    }

    fn start(&mut self, em: &EventManager, context: Rc<dyn BuildContext>) -> Promise<()> {
        (self.behavior)(em, context)
    }
}

pub struct FakeFactory {
    triggers: Vec<Tag>,
    priority: Priority,
    verb: String,
    behavior: Rc<dyn Fn(&EventManager, Rc<dyn BuildContext>) -> Promise<()>>,
}

impl FakeFactory {
    /// Factory with a single trigger tag whose actions all run `behavior`.
    pub fn new(
        trigger: Tag,
        priority: Priority,
        verb: &str,
        behavior: impl Fn(&EventManager, Rc<dyn BuildContext>) -> Promise<()> + 'static,
    ) -> Box<FakeFactory> {
        Box::new(FakeFactory {
            triggers: vec![trigger],
            priority,
            verb: verb.to_string(),
            behavior: Rc::new(behavior),
        })
    }
}

impl ActionFactory for FakeFactory {
    fn trigger_tags(&self) -> Vec<Tag> {
        self.triggers.clone()
    }

    fn try_make_action(&self, _tag: &Tag, _file: &File) -> Option<Box<dyn Action>> {
        Some(Box::new(FakeAction {
            verb: self.verb.clone(),
            behavior: self.behavior.clone(),
        }))
    }

    fn priority(&self) -> Priority {
        self.priority
    }
}

/// A scratch source tree on disk.
pub struct TempTree {
    pub dir: tempfile::TempDir,
}

impl TempTree {
    pub fn new(files: &[(&str, &str)]) -> TempTree {
        let dir = tempfile::tempdir().expect("creating temp dir");
        for (path, contents) in files {
            let full = dir.path().join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).expect("creating parent dirs");
            }
            std::fs::write(&full, contents).expect("writing fixture file");
        }
        TempTree { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, path: &str, contents: &str) {
        let full = self.dir.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("creating parent dirs");
        }
        std::fs::write(&full, contents).expect("writing file");
    }
}

/// A driver over the given tree with a fake dashboard, serialized to one
/// job so tests see deterministic ordering.
pub fn build_driver(em: &EventManager, tree: &TempTree, watch: bool) -> (Driver, DashboardLog) {
    let (dashboard, log) = FakeDashboard::new();
    let excludes = probuild::config::build_exclude_set(&Default::default()).expect("excludes");
    let driver = Driver::new(
        em.clone(),
        dashboard,
        tree.path(),
        &tree.path().join("probuild-out"),
        DriverOptions {
            jobs: 1,
            watch,
        },
        excludes,
    )
    .expect("building driver");
    (driver, log)
}
