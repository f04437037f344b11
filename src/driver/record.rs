// src/driver/record.rs

//! Per-action bookkeeping owned by the driver.

use std::collections::HashSet;
use std::path::PathBuf;
use std::rc::Rc;

use crate::action::{Action, Priority};
use crate::dashboard::DashboardTask;
use crate::event::AsyncOp;
use crate::fs::File;
use crate::promise::Promise;
use crate::tags::{Tag, TagSubscription};

use super::context::BuildContextImpl;

/// Lifecycle of an action record.
///
/// `Cancelled` is transient: an invalidated record passes through it on the
/// way back to `Pending` within the same turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

pub(crate) struct ActionRecord {
    pub(crate) priority: Priority,
    pub(crate) verb: String,
    pub(crate) noun: String,
    pub(crate) trigger_file: File,
    pub(crate) state: RecordState,
    /// Guards against a record sitting in a pending queue twice.
    pub(crate) queued: bool,
    /// Whether the last run saw a `find_provider`/`find_input` miss.
    pub(crate) missing_deps: bool,

    /// The action itself; taken out transiently while `start` is invoked.
    pub(crate) action: Option<Box<dyn Action>>,
    /// Owns the whole in-flight chain while Running. Dropping it is how a
    /// run is cancelled.
    pub(crate) in_flight: Option<Promise<()>>,
    pub(crate) context: Option<Rc<BuildContextImpl>>,
    pub(crate) task: Box<dyn DashboardTask>,

    /// Dependencies recorded during the current or last run.
    pub(crate) tag_deps: Vec<TagSubscription>,
    pub(crate) subscribed_tags: HashSet<Tag>,
    pub(crate) file_deps: Vec<AsyncOp>,
    pub(crate) subscribed_paths: HashSet<PathBuf>,
}

impl ActionRecord {
    pub(crate) fn clear_deps(&mut self) {
        self.tag_deps.clear();
        self.subscribed_tags.clear();
        self.file_deps.clear();
        self.subscribed_paths.clear();
        self.missing_deps = false;
    }
}
