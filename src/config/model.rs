// src/config/model.rs

use serde::Deserialize;

/// Top-level configuration as read from `Probuild.toml`.
///
/// ```toml
/// [options]
/// jobs = 8
/// output_dir = "probuild-out"
///
/// [walk]
/// exclude = ["vendor/**", "*.generated"]
/// ```
///
/// All sections are optional; the CLI overrides anything set here. There is
/// deliberately nothing build-rule-shaped in this file: what to build is
/// discovered by probing, not declared.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub options: OptionsSection,

    #[serde(default)]
    pub walk: WalkSection,
}

/// `[options]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptionsSection {
    /// Maximum number of simultaneously running actions.
    /// Default: CPU count.
    #[serde(default)]
    pub jobs: Option<usize>,

    /// Where derived files, installed binaries and libraries land.
    #[serde(default)]
    pub output_dir: Option<String>,

    /// Keep running and rebuild on file changes.
    #[serde(default)]
    pub watch: Option<bool>,
}

/// `[walk]` section: glob patterns (relative to the source root) skipped
/// while scanning the tree.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalkSection {
    #[serde(default)]
    pub exclude: Vec<String>,
}
