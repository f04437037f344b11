// src/tags/mod.rs

mod index;

pub use index::{Provision, RecordId, TagIndex, TagSubscription};

use std::fmt;
use std::sync::Arc;

/// Opaque symbolic identifier declaring "this file satisfies X". Tags are
/// the only currency for action-to-action dependencies.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(Arc<str>);

impl Tag {
    pub fn from_name(name: &str) -> Tag {
        Tag(Arc::from(name))
    }

    /// The intrinsic tag every file carries for its canonical name.
    pub fn canonical(name: &str) -> Tag {
        Tag(Arc::from(format!("canonical:{name}").as_str()))
    }

    /// The intrinsic tag for a file's extension (given with its leading
    /// dot, e.g. `".rs"`).
    pub fn filetype(extension: &str) -> Tag {
        Tag(Arc::from(format!("filetype:{extension}").as_str()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self.0)
    }
}
