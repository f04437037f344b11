// src/dashboard.rs

//! Progress reporting seam.
//!
//! The core drives any [`Dashboard`] implementation uniformly; this module
//! ships the plain-text one. A task is terminated by dropping it.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Passed,
    Failed,
    Blocked,
}

impl TaskState {
    fn label(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Done => " done  ",
            TaskState::Passed => "passed ",
            TaskState::Failed => "failed ",
            TaskState::Blocked => "blocked",
        }
    }
}

pub trait DashboardTask {
    fn set_state(&mut self, state: TaskState);
    fn add_output(&mut self, text: &str);
}

pub trait Dashboard {
    fn begin_task(&self, verb: &str, noun: &str, silent: bool) -> Box<dyn DashboardTask>;
}

/// One line per terminal state change, with the task's captured output
/// replayed when it fails. Silent tasks only surface on failure.
pub struct TextDashboard {
    out: Rc<RefCell<Box<dyn Write>>>,
}

impl TextDashboard {
    pub fn new(out: Box<dyn Write>) -> TextDashboard {
        TextDashboard {
            out: Rc::new(RefCell::new(out)),
        }
    }

    pub fn stdout() -> TextDashboard {
        TextDashboard::new(Box::new(std::io::stdout()))
    }
}

impl Dashboard for TextDashboard {
    fn begin_task(&self, verb: &str, noun: &str, silent: bool) -> Box<dyn DashboardTask> {
        Box::new(TextTask {
            out: self.out.clone(),
            verb: verb.to_string(),
            noun: noun.to_string(),
            silent,
            output: String::new(),
        })
    }
}

struct TextTask {
    out: Rc<RefCell<Box<dyn Write>>>,
    verb: String,
    noun: String,
    silent: bool,
    output: String,
}

impl TextTask {
    fn print_line(&self, state: TaskState) {
        let mut out = self.out.borrow_mut();
        let _ = writeln!(out, "[{}] {}: {}", state.label(), self.verb, self.noun);
    }

    fn print_output(&self) {
        if self.output.is_empty() {
            return;
        }
        let mut out = self.out.borrow_mut();
        for line in self.output.lines() {
            let _ = writeln!(out, "    {line}");
        }
    }
}

impl DashboardTask for TextTask {
    fn set_state(&mut self, state: TaskState) {
        match state {
            TaskState::Pending | TaskState::Running => {
                debug!(verb = %self.verb, noun = %self.noun, ?state, "task state");
                // A task re-entering the queue starts a fresh transcript.
                self.output.clear();
            }
            TaskState::Done | TaskState::Passed => {
                if !self.silent {
                    self.print_line(state);
                }
            }
            TaskState::Failed | TaskState::Blocked => {
                self.print_line(state);
                self.print_output();
            }
        }
    }

    fn add_output(&mut self, text: &str) {
        self.output.push_str(text);
        if !text.ends_with('\n') {
            self.output.push('\n');
        }
    }
}
