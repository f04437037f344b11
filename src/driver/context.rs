// src/driver/context.rs

//! The driver's implementation of the action capability object.
//!
//! Effects (provisions, installs, derived factories, pass/fail) accumulate
//! here and are applied by the driver only when the action's start promise
//! fulfills successfully. Lookups hit the live tag index snapshot and record
//! a dependency subscription whether or not they find anything.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::action::{ActionFactory, BuildContext, InstallLocation};
use crate::errors::{BuildError, Result};
use crate::fs::File;
use crate::tags::{RecordId, Tag};

use super::record::ActionRecord;
use super::root::DriverShared;

pub(crate) struct BuildContextImpl {
    shared: Weak<DriverShared>,
    record: Weak<RefCell<ActionRecord>>,
    id: RecordId,
    provisions: RefCell<Vec<(File, Vec<Tag>)>>,
    installs: RefCell<Vec<(File, InstallLocation, String)>>,
    factories: RefCell<Vec<Box<dyn ActionFactory>>>,
    /// Some(true) = explicit `passed`, Some(false) = explicit `failed`.
    outcome: Cell<Option<bool>>,
}

impl BuildContextImpl {
    pub(crate) fn new(
        shared: Weak<DriverShared>,
        record: Weak<RefCell<ActionRecord>>,
        id: RecordId,
    ) -> BuildContextImpl {
        BuildContextImpl {
            shared,
            record,
            id,
            provisions: RefCell::new(Vec::new()),
            installs: RefCell::new(Vec::new()),
            factories: RefCell::new(Vec::new()),
            outcome: Cell::new(None),
        }
    }

    pub(crate) fn take_provisions(&self) -> Vec<(File, Vec<Tag>)> {
        self.provisions.take()
    }

    pub(crate) fn take_installs(&self) -> Vec<(File, InstallLocation, String)> {
        self.installs.take()
    }

    pub(crate) fn take_factories(&self) -> Vec<Box<dyn ActionFactory>> {
        self.factories.take()
    }

    pub(crate) fn reported_failure(&self) -> bool {
        self.outcome.get() == Some(false)
    }

    pub(crate) fn reported_pass(&self) -> bool {
        self.outcome.get() == Some(true)
    }

    fn note_miss(&self) {
        if let Some(record) = self.record.upgrade() {
            record.borrow_mut().missing_deps = true;
        }
    }

    fn subscribe_tag(&self, shared: &Rc<DriverShared>, tag: &Tag) {
        let Some(record) = self.record.upgrade() else {
            return;
        };
        {
            let mut record = record.borrow_mut();
            if !record.subscribed_tags.insert(tag.clone()) {
                return;
            }
        }
        let weak = self.shared.clone();
        let id = self.id;
        let subscription = shared.index().subscribe(tag, Some(id), move || {
            if let Some(shared) = weak.upgrade() {
                DriverShared::dependency_changed(&shared, id);
            }
        });
        record.borrow_mut().tag_deps.push(subscription);
    }

    fn subscribe_file(&self, shared: &Rc<DriverShared>, file: &File) {
        let Some(record) = self.record.upgrade() else {
            return;
        };
        let path = file.disk_path();
        {
            let mut record = record.borrow_mut();
            if !record.subscribed_paths.insert(path.clone()) {
                return;
            }
        }
        let weak = self.shared.clone();
        let id = self.id;
        match shared.em().on_file_change(&path, move || {
            if let Some(shared) = weak.upgrade() {
                DriverShared::dependency_changed(&shared, id);
            }
        }) {
            Ok(op) => record.borrow_mut().file_deps.push(op),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "cannot watch input");
            }
        }
    }
}

impl BuildContext for BuildContextImpl {
    fn find_provider(&self, tag: &Tag) -> Option<File> {
        let shared = self.shared.upgrade()?;
        self.subscribe_tag(&shared, tag);
        match shared.index().provider(tag) {
            Some(provision) => Some(provision.file),
            None => {
                self.note_miss();
                None
            }
        }
    }

    fn find_input(&self, path: &str) -> Option<File> {
        let shared = self.shared.upgrade()?;
        let file = match shared.source_root().relative(path) {
            Ok(file) => file,
            Err(_) => {
                self.note_miss();
                return None;
            }
        };
        self.subscribe_file(&shared, &file);
        if file.exists() {
            Some(file)
        } else {
            self.note_miss();
            None
        }
    }

    fn provide(&self, file: &File, tags: Vec<Tag>) {
        self.provisions.borrow_mut().push((file.clone(), tags));
    }

    fn install(&self, file: &File, location: InstallLocation, name: &str) {
        self.installs
            .borrow_mut()
            .push((file.clone(), location, name.to_string()));
    }

    fn log(&self, text: &str) {
        if let Some(record) = self.record.upgrade() {
            let mut record = record.borrow_mut();
            debug!(verb = %record.verb, noun = %record.noun, "{}", text.trim_end());
            record.task.add_output(text);
        }
    }

    fn new_output(&self, path: &str) -> Result<File> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| BuildError::Internal("driver is gone".to_string()))?;
        let file = shared.output_tmp().relative(path)?;
        if let Some(parent) = file.parent() {
            parent.create_directory()?;
        }
        Ok(file)
    }

    fn add_action_type(&self, factory: Box<dyn ActionFactory>) {
        self.factories.borrow_mut().push(factory);
    }

    fn passed(&self) {
        if self.outcome.get().is_none() {
            self.outcome.set(Some(true));
        }
    }

    fn failed(&self) {
        self.outcome.set(Some(false));
    }
}
