// src/action.rs

//! The contract between the driver and the things it runs: actions, the
//! factories that recognise files, and the capability object an action uses
//! to talk back.

use std::rc::Rc;

use crate::errors::Result;
use crate::event::EventManager;
use crate::fs::File;
use crate::promise::Promise;
use crate::tags::Tag;

/// Factory priority. Lower runs earlier. This only orders initial queueing
/// to reduce wasted work on a cold start; correctness never depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    /// Learn all the rules before doing anything else.
    Rules = 0,
    /// Tools needed by code generators.
    HostCompilation,
    HostLink,
    /// Generated code is needed before ordinary compilation makes sense.
    CodeGen,
    Compilation,
    Link,
    /// Tests and whatever else is left.
    EverythingElse,
}

pub const NUM_PRIORITIES: usize = 7;

impl Priority {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallLocation {
    Bin,
    Lib,
    NodeModules,
}

pub const INSTALL_LOCATIONS: [InstallLocation; 3] = [
    InstallLocation::Bin,
    InstallLocation::Lib,
    InstallLocation::NodeModules,
];

impl InstallLocation {
    pub fn dir_name(self) -> &'static str {
        match self {
            InstallLocation::Bin => "bin",
            InstallLocation::Lib => "lib",
            InstallLocation::NodeModules => "node_modules",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<InstallLocation> {
        INSTALL_LOCATIONS
            .into_iter()
            .find(|location| location.dir_name() == name)
    }
}

/// The capability object handed to a running action. Every effect an action
/// has on the rest of the system goes through here.
///
/// `find_provider` and `find_input` calls are recorded as dependencies of
/// the calling action (including misses), so the action is re-run when the
/// answer changes.
pub trait BuildContext {
    fn find_provider(&self, tag: &Tag) -> Option<File>;
    fn find_input(&self, path: &str) -> Option<File>;

    /// Declare that `file` satisfies `tags` once this action succeeds.
    fn provide(&self, file: &File, tags: Vec<Tag>);

    /// Request installation of `file` under the given location on success.
    fn install(&self, file: &File, location: InstallLocation, name: &str);

    fn log(&self, text: &str);

    /// A fresh output file under the derived tree.
    fn new_output(&self, path: &str) -> Result<File>;

    /// Register a factory derived from this action's outputs; applied when
    /// the action succeeds.
    fn add_action_type(&self, factory: Box<dyn ActionFactory>);

    fn passed(&self);
    fn failed(&self);
}

/// A unit of work. `start` kicks the work off and returns a promise for its
/// completion; dropping that promise cancels the work.
pub trait Action {
    fn verb(&self) -> &str;

    fn is_silent(&self) -> bool {
        false
    }

    fn start(&mut self, em: &EventManager, context: Rc<dyn BuildContext>) -> Promise<()>;
}

/// Recognises files by trigger tag and produces actions for them.
pub trait ActionFactory {
    /// The tags this factory wants to be offered (tag, file) pairs for.
    fn trigger_tags(&self) -> Vec<Tag>;

    /// Offered a matching pair; return an action or refuse.
    fn try_make_action(&self, tag: &Tag, file: &File) -> Option<Box<dyn Action>>;

    fn priority(&self) -> Priority;
}
