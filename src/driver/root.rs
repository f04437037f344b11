// src/driver/root.rs

//! The driver: owns the factories, the tag index, and every action record.
//!
//! It walks the source roots, offers files to factories through their
//! trigger tags, runs matching actions under a concurrency cap, commits
//! provisions on success, and invalidates records whose recorded
//! dependencies change, converging on a fixed point where every record has
//! succeeded or is waiting on something that doesn't exist yet.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use globset::GlobSet;
use tracing::{debug, info, trace, warn};

use crate::action::{Action, ActionFactory, InstallLocation, Priority, INSTALL_LOCATIONS};
use crate::dashboard::{Dashboard, TaskState};
use crate::errors::{BuildError, Result};
use crate::event::{AsyncOp, EventManager, Executor, PendingRunnable};
use crate::fs::{File, RootDir, RootKind};
use crate::promise::{self, MaybeException, Promise, PromiseFulfiller};
use crate::tags::{RecordId, Tag, TagIndex};

use super::context::BuildContextImpl;
use super::queue::PendingQueues;
use super::record::{ActionRecord, RecordState};

/// Final pass/fail report when the driver reaches quiescence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Census {
    pub passed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl Census {
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.blocked == 0
    }
}

impl fmt::Display for Census {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} blocked",
            self.passed, self.failed, self.blocked
        )
    }
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Maximum number of simultaneously running actions.
    pub jobs: usize,
    /// Keep running after convergence and react to file changes.
    pub watch: bool,
}

impl Default for DriverOptions {
    fn default() -> DriverOptions {
        DriverOptions {
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            watch: false,
        }
    }
}

struct FactoryEntry {
    factory: Box<dyn ActionFactory>,
    triggers: Vec<Tag>,
    priority: Priority,
}

/// Shared handle to the driver; clones refer to the same state.
#[derive(Clone)]
pub struct Driver {
    shared: Rc<DriverShared>,
}

pub(crate) struct DriverShared {
    em: EventManager,
    exec: Rc<dyn Executor>,
    index: TagIndex,
    dashboard: Rc<dyn Dashboard>,
    source_root: File,
    output_tmp: File,
    install_roots: Vec<(InstallLocation, File)>,
    /// Skipped during tree walks so the derived tree never feeds back in.
    output_disk_root: PathBuf,
    options: DriverOptions,
    excludes: GlobSet,

    factories: RefCell<Vec<FactoryEntry>>,
    records: RefCell<Vec<Rc<RefCell<ActionRecord>>>>,
    queues: RefCell<PendingQueues>,
    running: Cell<usize>,
    /// (factory, tag, file) triples already offered; also the local guard
    /// against an action retriggering itself through its own output.
    offered: RefCell<HashSet<(usize, Tag, File)>>,
    known_files: RefCell<Vec<File>>,
    known_set: RefCell<HashSet<File>>,

    pump_scheduled: Cell<bool>,
    pump_handle: RefCell<Option<PendingRunnable>>,
    finish_check_scheduled: Cell<bool>,
    finish_check_handle: RefCell<Option<PendingRunnable>>,
    done: RefCell<Option<PromiseFulfiller<Census>>>,
    /// Watch-mode directory subscriptions, keyed so a re-arm replaces the
    /// previous one-shot.
    watched_dirs: RefCell<HashMap<File, AsyncOp>>,
}

impl Driver {
    pub fn new(
        em: EventManager,
        dashboard: Rc<dyn Dashboard>,
        source_dir: &std::path::Path,
        output_dir: &std::path::Path,
        options: DriverOptions,
        excludes: GlobSet,
    ) -> Result<Driver> {
        let source_canon = std::fs::canonicalize(source_dir)?;
        std::fs::create_dir_all(output_dir)?;
        let output_canon = std::fs::canonicalize(output_dir)?;

        let source_root = File::root(RootDir::new(RootKind::Source, source_canon));
        let output_root = File::root(RootDir::new(RootKind::Output, output_canon.clone()));
        let output_tmp = output_root.relative("tmp")?;
        output_tmp.create_directory()?;

        let mut install_roots = Vec::new();
        for location in INSTALL_LOCATIONS {
            let root = output_root.relative(location.dir_name())?;
            root.create_directory()?;
            install_roots.push((location, root));
        }

        let exec = em.executor();
        let index = TagIndex::new(em.clone());
        Ok(Driver {
            shared: Rc::new(DriverShared {
                em,
                exec,
                index,
                dashboard,
                source_root,
                output_tmp,
                install_roots,
                output_disk_root: output_canon,
                options,
                excludes,
                factories: RefCell::new(Vec::new()),
                records: RefCell::new(Vec::new()),
                queues: RefCell::new(PendingQueues::new()),
                running: Cell::new(0),
                offered: RefCell::new(HashSet::new()),
                known_files: RefCell::new(Vec::new()),
                known_set: RefCell::new(HashSet::new()),
                pump_scheduled: Cell::new(false),
                pump_handle: RefCell::new(None),
                finish_check_scheduled: Cell::new(false),
                finish_check_handle: RefCell::new(None),
                done: RefCell::new(None),
                watched_dirs: RefCell::new(HashMap::new()),
            }),
        })
    }

    /// Register a factory. Every known file (and committed provision) is
    /// offered to it, so registration order doesn't matter.
    pub fn add_factory(&self, factory: Box<dyn ActionFactory>) {
        DriverShared::register_factory(&self.shared, factory);
    }

    /// Scan the source tree and start converging. The returned promise
    /// fulfills with the final census once everything is quiescent (never,
    /// in watch mode, unless [`request_shutdown`](Self::request_shutdown)
    /// is called).
    pub fn run(&self) -> Promise<Census> {
        let (promise, fulfiller) = Promise::pending();
        *self.shared.done.borrow_mut() = Some(fulfiller);
        info!(
            root = %self.shared.source_root.disk_path().display(),
            jobs = self.shared.options.jobs,
            watch = self.shared.options.watch,
            "driver starting"
        );
        if self.shared.options.watch {
            DriverShared::watch_dir(&self.shared, self.shared.source_root.clone());
        }
        DriverShared::scan_tree(&self.shared, self.shared.source_root.clone());
        DriverShared::schedule_pump(&self.shared);
        promise
    }

    /// Report the census as it stands and settle the run promise.
    pub fn request_shutdown(&self) {
        DriverShared::finish(&self.shared);
    }
}

impl DriverShared {
    pub(crate) fn em(&self) -> &EventManager {
        &self.em
    }

    pub(crate) fn index(&self) -> &TagIndex {
        &self.index
    }

    pub(crate) fn source_root(&self) -> &File {
        &self.source_root
    }

    pub(crate) fn output_tmp(&self) -> &File {
        &self.output_tmp
    }

    fn install_root(&self, location: InstallLocation) -> &File {
        self.install_roots
            .iter()
            .find(|(candidate, _)| *candidate == location)
            .map(|(_, root)| root)
            .unwrap_or(&self.output_tmp)
    }

    fn intrinsic_tags(file: &File) -> Vec<Tag> {
        let mut tags = vec![Tag::canonical(file.canonical_name())];
        if let Some(extension) = file.extension() {
            tags.push(Tag::filetype(extension));
        }
        tags
    }

    fn register_factory(shared: &Rc<DriverShared>, factory: Box<dyn ActionFactory>) -> usize {
        let triggers = factory.trigger_tags();
        let priority = factory.priority();
        debug!(?triggers, ?priority, "factory registered");
        let index = {
            let mut factories = shared.factories.borrow_mut();
            factories.push(FactoryEntry {
                factory,
                triggers,
                priority,
            });
            factories.len() - 1
        };

        // Re-offer everything already known: source files through their
        // intrinsic tags, plus currently committed provisions. Outputs of
        // still-running actions arrive through the normal commit path.
        let files: Vec<File> = shared.known_files.borrow().clone();
        for file in files {
            for tag in Self::intrinsic_tags(&file) {
                Self::offer_to(shared, index, &tag, &file);
            }
        }
        for (tag, provision) in shared.index.all_provisions() {
            Self::offer_to(shared, index, &tag, &provision.file);
        }
        index
    }

    fn scan_tree(shared: &Rc<DriverShared>, dir: File) {
        let entries = match dir.list() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir, error = %err, "cannot list directory; skipping");
                return;
            }
        };
        for entry in entries {
            if shared.excludes.is_match(entry.canonical_name()) {
                trace!(entry = %entry, "excluded from scan");
                continue;
            }
            if entry.is_directory() {
                if entry.disk_path() == shared.output_disk_root {
                    continue;
                }
                if shared.options.watch {
                    Self::watch_dir(shared, entry.clone());
                }
                Self::scan_tree(shared, entry);
            } else {
                Self::note_file(shared, entry);
            }
        }
    }

    fn note_file(shared: &Rc<DriverShared>, file: File) {
        if !shared.known_set.borrow_mut().insert(file.clone()) {
            return;
        }
        trace!(file = %file, "file discovered");
        shared.known_files.borrow_mut().push(file.clone());
        for tag in Self::intrinsic_tags(&file) {
            Self::offer_all(shared, &tag, &file);
        }
    }

    fn offer_all(shared: &Rc<DriverShared>, tag: &Tag, file: &File) {
        let count = shared.factories.borrow().len();
        for index in 0..count {
            Self::offer_to(shared, index, tag, file);
        }
    }

    fn offer_to(shared: &Rc<DriverShared>, index: usize, tag: &Tag, file: &File) {
        let triggered = {
            let factories = shared.factories.borrow();
            factories[index].triggers.contains(tag)
        };
        if !triggered {
            return;
        }
        if !shared
            .offered
            .borrow_mut()
            .insert((index, tag.clone(), file.clone()))
        {
            return;
        }
        let action = {
            let factories = shared.factories.borrow();
            factories[index].factory.try_make_action(tag, file)
        };
        if let Some(action) = action {
            Self::create_record(shared, index, action, file.clone());
        }
    }

    fn create_record(
        shared: &Rc<DriverShared>,
        factory_index: usize,
        action: Box<dyn Action>,
        trigger_file: File,
    ) {
        let priority = shared.factories.borrow()[factory_index].priority;
        let verb = action.verb().to_string();
        let silent = action.is_silent();
        let noun = trigger_file.to_string();
        let id: RecordId = shared.records.borrow().len();

        let mut task = shared.dashboard.begin_task(&verb, &noun, silent);
        task.set_state(TaskState::Pending);
        debug!(id, verb = %verb, noun = %noun, ?priority, "action queued");

        let record = Rc::new(RefCell::new(ActionRecord {
            priority,
            verb,
            noun,
            trigger_file,
            state: RecordState::Pending,
            queued: true,
            missing_deps: false,
            action: Some(action),
            in_flight: None,
            context: None,
            task,
            tag_deps: Vec::new(),
            subscribed_tags: HashSet::new(),
            file_deps: Vec::new(),
            subscribed_paths: HashSet::new(),
        }));
        shared.records.borrow_mut().push(record);
        shared.queues.borrow_mut().push(priority, id);
        Self::schedule_pump(shared);
    }

    fn schedule_pump(shared: &Rc<DriverShared>) {
        if shared.pump_scheduled.replace(true) {
            return;
        }
        let weak = Rc::downgrade(shared);
        let handle = shared.exec.run_later(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.pump_scheduled.set(false);
                DriverShared::pump(&shared);
            }
        }));
        *shared.pump_handle.borrow_mut() = Some(handle);
    }

    fn pump(shared: &Rc<DriverShared>) {
        while shared.running.get() < shared.options.jobs {
            let next = shared.queues.borrow_mut().pop();
            match next {
                Some(id) => Self::start_record(shared, id),
                None => break,
            }
        }
        Self::maybe_finish(shared);
    }

    fn start_record(shared: &Rc<DriverShared>, id: RecordId) {
        let record = { shared.records.borrow()[id].clone() };
        let context = Rc::new(BuildContextImpl::new(
            Rc::downgrade(shared),
            Rc::downgrade(&record),
            id,
        ));
        let mut action = {
            let mut rec = record.borrow_mut();
            if rec.state != RecordState::Pending {
                rec.queued = false;
                return;
            }
            rec.queued = false;
            rec.state = RecordState::Running;
            rec.clear_deps();
            rec.task.set_state(TaskState::Running);
            rec.context = Some(context.clone());
            debug!(id, verb = %rec.verb, noun = %rec.noun, "action starting");
            match rec.action.take() {
                Some(action) => action,
                None => {
                    warn!(id, "record has no action; dropping");
                    rec.state = RecordState::Failed;
                    return;
                }
            }
        };

        // The record always depends on its own trigger file.
        {
            let trigger = record.borrow().trigger_file.clone();
            if trigger.root_kind() == RootKind::Source {
                let weak = Rc::downgrade(shared);
                match shared.em.on_file_change(&trigger.disk_path(), move || {
                    if let Some(shared) = weak.upgrade() {
                        DriverShared::dependency_changed(&shared, id);
                    }
                }) {
                    Ok(op) => {
                        let mut rec = record.borrow_mut();
                        rec.subscribed_paths.insert(trigger.disk_path());
                        rec.file_deps.push(op);
                    }
                    Err(err) => {
                        debug!(file = %trigger, error = %err, "cannot watch trigger file");
                    }
                }
            }
        }

        shared.running.set(shared.running.get() + 1);
        let start_promise = action.start(&shared.em, context);

        let weak_ok = Rc::downgrade(shared);
        let weak_err = Rc::downgrade(shared);
        let done = promise::when(&shared.exec, start_promise).then_catch(
            move |()| {
                if let Some(shared) = weak_ok.upgrade() {
                    DriverShared::record_finished(&shared, id, None);
                }
            },
            move |error: MaybeException<()>| {
                let error = match error {
                    MaybeException::Exception(captured) => BuildError::Captured(captured),
                    MaybeException::Value(()) => {
                        BuildError::Internal("failure continuation without error".to_string())
                    }
                };
                if let Some(shared) = weak_err.upgrade() {
                    DriverShared::record_finished(&shared, id, Some(error));
                }
            },
        );

        let mut rec = record.borrow_mut();
        rec.action = Some(action);
        rec.in_flight = Some(done);
    }

    fn record_finished(shared: &Rc<DriverShared>, id: RecordId, error: Option<BuildError>) {
        shared.running.set(shared.running.get().saturating_sub(1));
        let record = { shared.records.borrow()[id].clone() };
        let context = {
            let mut rec = record.borrow_mut();
            rec.in_flight = None;
            rec.context.take()
        };
        let Some(context) = context else {
            // Cancelled under us; the record was already requeued.
            Self::schedule_pump(shared);
            return;
        };

        match error {
            None if context.reported_failure() => {
                Self::mark_failed(
                    &record,
                    BuildError::ActionFailed("action reported failure".to_string()),
                );
            }
            None => match Self::apply_success(shared, id, &context) {
                Ok(()) => {
                    let mut rec = record.borrow_mut();
                    rec.state = RecordState::Succeeded;
                    let state = if context.reported_pass() {
                        TaskState::Passed
                    } else {
                        TaskState::Done
                    };
                    rec.task.set_state(state);
                    info!(id, verb = %rec.verb, noun = %rec.noun, "action succeeded");
                }
                Err(err) => Self::mark_failed(&record, err),
            },
            Some(error) => Self::mark_failed(&record, error),
        }
        Self::schedule_pump(shared);
    }

    fn apply_success(
        shared: &Rc<DriverShared>,
        id: RecordId,
        context: &BuildContextImpl,
    ) -> Result<()> {
        let provisions = context.take_provisions();
        let installs = context.take_installs();
        let factories = context.take_factories();

        // All-or-nothing: a conflict fails the action before anything else
        // takes effect.
        shared.index.commit(id, &provisions)?;

        for (file, location, name) in installs {
            let dest = shared.install_root(location).relative(&name)?;
            file.link_to(&dest)?;
            info!(file = %file, dest = %dest, "installed");
        }
        for factory in factories {
            Self::register_factory(shared, factory);
        }
        for (file, tags) in &provisions {
            for tag in tags {
                Self::offer_all(shared, tag, file);
            }
        }
        Ok(())
    }

    fn mark_failed(record: &Rc<RefCell<ActionRecord>>, error: BuildError) {
        let mut rec = record.borrow_mut();
        rec.state = RecordState::Failed;
        let blocked = rec.missing_deps;
        if !error.is_cancelled() {
            rec.task.add_output(&error.to_string());
        }
        rec.task.set_state(if blocked {
            TaskState::Blocked
        } else {
            TaskState::Failed
        });
        warn!(verb = %rec.verb, noun = %rec.noun, error = %error, blocked, "action failed");
    }

    /// A recorded dependency of `id` changed: retract, cancel in-flight
    /// work, and queue the record to run again.
    pub(crate) fn dependency_changed(shared: &Rc<DriverShared>, id: RecordId) {
        let record = { shared.records.borrow()[id].clone() };
        {
            let mut rec = record.borrow_mut();
            match rec.state {
                RecordState::Running => {
                    debug!(id, verb = %rec.verb, "dependency changed; cancelling run");
                    rec.in_flight = None;
                    rec.context = None;
                    shared.running.set(shared.running.get().saturating_sub(1));
                    rec.state = RecordState::Cancelled;
                    Self::requeue(shared, &mut rec, id);
                }
                RecordState::Succeeded => {
                    debug!(id, verb = %rec.verb, "dependency changed; invalidating");
                    shared.index.retract(id);
                    rec.state = RecordState::Cancelled;
                    Self::requeue(shared, &mut rec, id);
                }
                RecordState::Failed => {
                    debug!(id, verb = %rec.verb, "dependency changed; retrying");
                    Self::requeue(shared, &mut rec, id);
                }
                RecordState::Pending | RecordState::Cancelled => {}
            }
        }
        Self::schedule_pump(shared);
    }

    fn requeue(shared: &Rc<DriverShared>, rec: &mut ActionRecord, id: RecordId) {
        rec.state = RecordState::Pending;
        rec.task.set_state(TaskState::Pending);
        if !rec.queued {
            rec.queued = true;
            shared.queues.borrow_mut().push(rec.priority, id);
        }
    }

    fn maybe_finish(shared: &Rc<DriverShared>) {
        if shared.options.watch {
            return;
        }
        if shared.running.get() > 0 || !shared.queues.borrow().is_empty() {
            return;
        }
        // Looks quiescent, but queued tag notifications may still requeue a
        // record. Confirm only once the turn queue has drained.
        Self::schedule_finish_check(shared);
    }

    fn schedule_finish_check(shared: &Rc<DriverShared>) {
        if shared.finish_check_scheduled.replace(true) {
            return;
        }
        let weak = Rc::downgrade(shared);
        let handle = shared.exec.run_later(Box::new(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            shared.finish_check_scheduled.set(false);
            if shared.running.get() > 0 || !shared.queues.borrow().is_empty() {
                return;
            }
            if shared.em.pending_turns() > 0 {
                Self::schedule_finish_check(&shared);
                return;
            }
            Self::finish(&shared);
        }));
        *shared.finish_check_handle.borrow_mut() = Some(handle);
    }

    pub(crate) fn finish(shared: &Rc<DriverShared>) {
        let Some(fulfiller) = shared.done.borrow_mut().take() else {
            return;
        };
        let census = Self::census(shared);
        info!(%census, "driver finished");
        fulfiller.fulfill(census);
    }

    fn census(shared: &Rc<DriverShared>) -> Census {
        let mut census = Census {
            passed: 0,
            failed: 0,
            blocked: 0,
        };
        for record in shared.records.borrow().iter() {
            let rec = record.borrow();
            match rec.state {
                RecordState::Succeeded => census.passed += 1,
                RecordState::Failed if rec.missing_deps => census.blocked += 1,
                RecordState::Failed => census.failed += 1,
                // Interrupted mid-flight (shutdown request): not a pass.
                RecordState::Pending | RecordState::Running | RecordState::Cancelled => {
                    census.blocked += 1
                }
            }
        }
        census
    }

    fn watch_dir(shared: &Rc<DriverShared>, dir: File) {
        let weak = Rc::downgrade(shared);
        let rearm = dir.clone();
        match shared.em.on_file_change(&dir.disk_path(), move || {
            if let Some(shared) = weak.upgrade() {
                DriverShared::rescan_dir(&shared, rearm);
            }
        }) {
            Ok(op) => {
                shared.watched_dirs.borrow_mut().insert(dir, op);
            }
            Err(err) => {
                debug!(dir = %dir, error = %err, "cannot watch directory");
            }
        }
    }

    /// A watched directory changed: re-arm the one-shot watch and pick up
    /// anything new. Changed known files wake their records through the
    /// records' own subscriptions.
    fn rescan_dir(shared: &Rc<DriverShared>, dir: File) {
        if !dir.exists() {
            shared.watched_dirs.borrow_mut().remove(&dir);
            return;
        }
        Self::watch_dir(shared, dir.clone());
        let entries = match dir.list() {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir, error = %err, "cannot rescan directory");
                return;
            }
        };
        for entry in entries {
            if shared.excludes.is_match(entry.canonical_name()) {
                continue;
            }
            if entry.is_directory() {
                if entry.disk_path() == shared.output_disk_root {
                    continue;
                }
                let known = shared.watched_dirs.borrow().contains_key(&entry);
                if !known {
                    Self::watch_dir(shared, entry.clone());
                    Self::scan_tree(shared, entry);
                }
            } else {
                Self::note_file(shared, entry);
            }
        }
    }
}
