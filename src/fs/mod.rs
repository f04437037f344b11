// src/fs/mod.rs

//! Canonical file handles over the source and output trees.
//!
//! A [`File`] is identity, not an open descriptor: two handles for the same
//! location compare equal and hash equally, whether or not anything exists
//! on disk yet. Handles are cheap to clone and do not own the backing disk
//! object.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::Read;
use std::path::PathBuf;
use std::rc::Rc;

use crate::errors::{BuildError, Result};

/// Which tree a file lives in. Source files come from the scanned project;
/// output files are produced by actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    Source,
    Output,
}

#[derive(Debug)]
pub struct RootDir {
    kind: RootKind,
    path: PathBuf,
}

impl RootDir {
    pub fn new(kind: RootKind, path: PathBuf) -> Rc<RootDir> {
        Rc::new(RootDir { kind, path })
    }
}

#[derive(Clone)]
pub struct File {
    root: Rc<RootDir>,
    /// Canonical name: `/`-separated path relative to the root, `""` for
    /// the root itself. Never contains `.` or `..` segments.
    rel: String,
}

impl PartialEq for File {
    fn eq(&self, other: &File) -> bool {
        self.root.path == other.root.path && self.rel == other.rel
    }
}

impl Eq for File {}

impl Hash for File {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root.path.hash(state);
        self.rel.hash(state);
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "File({:?}:{})", self.root.kind, self.rel)
    }
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rel.is_empty() {
            f.write_str(".")
        } else {
            f.write_str(&self.rel)
        }
    }
}

impl File {
    /// Handle for the root of a tree.
    pub fn root(root: Rc<RootDir>) -> File {
        File {
            root,
            rel: String::new(),
        }
    }

    pub fn canonical_name(&self) -> &str {
        &self.rel
    }

    pub fn root_kind(&self) -> RootKind {
        self.root.kind
    }

    /// Stable hash of the identity, for callers that want a number rather
    /// than a `Hash` impl.
    pub fn identity_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Where this handle points on disk.
    pub fn disk_path(&self) -> PathBuf {
        if self.rel.is_empty() {
            self.root.path.clone()
        } else {
            self.root.path.join(&self.rel)
        }
    }

    pub fn basename(&self) -> &str {
        match self.rel.rfind('/') {
            Some(idx) => &self.rel[idx + 1..],
            None => &self.rel,
        }
    }

    /// The extension including its leading dot (`".rs"`), if any.
    pub fn extension(&self) -> Option<&str> {
        let base = self.basename();
        match base.rfind('.') {
            Some(idx) if idx > 0 => Some(&base[idx..]),
            _ => None,
        }
    }

    pub fn has_parent(&self) -> bool {
        !self.rel.is_empty()
    }

    pub fn parent(&self) -> Option<File> {
        if self.rel.is_empty() {
            return None;
        }
        let rel = match self.rel.rfind('/') {
            Some(idx) => self.rel[..idx].to_string(),
            None => String::new(),
        };
        Some(File {
            root: self.root.clone(),
            rel,
        })
    }

    /// Resolve a `/`-separated path relative to this file (treated as a
    /// directory). `.` and `..` segments are folded; walking past the root
    /// is an error.
    pub fn relative(&self, path: &str) -> Result<File> {
        let mut segments: Vec<&str> = if self.rel.is_empty() {
            Vec::new()
        } else {
            self.rel.split('/').collect()
        };
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(BuildError::Internal(format!(
                            "path {path:?} escapes the tree root"
                        )));
                    }
                }
                other => segments.push(other),
            }
        }
        Ok(File {
            root: self.root.clone(),
            rel: segments.join("/"),
        })
    }

    pub fn exists(&self) -> bool {
        self.disk_path().exists()
    }

    pub fn is_directory(&self) -> bool {
        self.disk_path().is_dir()
    }

    /// List a directory's entries, sorted by name for determinism.
    pub fn list(&self) -> Result<Vec<File>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.disk_path())? {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => {
                    tracing::debug!(?name, "skipping non-utf8 directory entry");
                }
            }
        }
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| {
                let rel = if self.rel.is_empty() {
                    name
                } else {
                    format!("{}/{}", self.rel, name)
                };
                File {
                    root: self.root.clone(),
                    rel,
                }
            })
            .collect())
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.disk_path())?)
    }

    /// Write the full contents, creating parent directories as needed.
    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let path = self.disk_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Streaming blake3 hash of the contents, as lowercase hex.
    pub fn content_hash(&self) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        let mut file = std::fs::File::open(self.disk_path())?;
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    pub fn create_directory(&self) -> Result<()> {
        std::fs::create_dir_all(self.disk_path())?;
        Ok(())
    }

    /// Link this file's contents to `dest`, falling back to a copy when
    /// hard links are not possible (cross-device, existing target).
    pub fn link_to(&self, dest: &File) -> Result<()> {
        let from = self.disk_path();
        let to = dest.disk_path();
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if to.exists() {
            std::fs::remove_file(&to)?;
        }
        if std::fs::hard_link(&from, &to).is_err() {
            std::fs::copy(&from, &to)?;
        }
        Ok(())
    }

    pub fn unlink(&self) -> Result<()> {
        std::fs::remove_file(self.disk_path())?;
        Ok(())
    }
}
