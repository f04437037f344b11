// src/exec/mod.rs

mod subprocess;

pub use subprocess::{Subprocess, SubprocessPipes};
