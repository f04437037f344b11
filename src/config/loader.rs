// src/config/loader.rs

use std::path::Path;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::model::ConfigFile;

/// Patterns skipped during tree walks regardless of configuration: VCS
/// metadata and editor droppings never feed the build.
const BUILTIN_EXCLUDES: &[&str] = &[
    ".git",
    "**/.git",
    ".hg",
    "**/.hg",
    "*~",
    "**/*~",
    ".#*",
    "**/.#*",
];

/// Load configuration from `path`, or defaults when the file is absent.
/// A present-but-malformed file is an error.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file at {path:?}"))?;
    let config: ConfigFile =
        toml::from_str(&contents).with_context(|| format!("parsing TOML config from {path:?}"))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ConfigFile) -> Result<()> {
    if config.options.jobs == Some(0) {
        bail!("options.jobs must be at least 1");
    }
    for pattern in &config.walk.exclude {
        Glob::new(pattern).with_context(|| format!("invalid walk.exclude pattern {pattern:?}"))?;
    }
    Ok(())
}

/// Compile the effective exclude set: builtin patterns plus `walk.exclude`.
pub fn build_exclude_set(config: &ConfigFile) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in BUILTIN_EXCLUDES {
        builder.add(
            Glob::new(pattern)
                .with_context(|| format!("invalid builtin exclude pattern {pattern:?}"))?,
        );
    }
    for pattern in &config.walk.exclude {
        builder.add(
            Glob::new(pattern)
                .with_context(|| format!("invalid walk.exclude pattern {pattern:?}"))?,
        );
    }
    builder.build().context("compiling exclude globs")
}
