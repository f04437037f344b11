// src/exec/subprocess.rs

//! Child process ownership with graceful cancellation.
//!
//! A [`Subprocess`] is the kill-on-cancel guard for a spawned child; the
//! exit promise carries the raw status (negative = signal). Dropping the
//! guard while the child is alive sends SIGTERM, then SIGKILL after a grace
//! period. The event manager's wait task keeps running either way so the
//! child is always reaped.

use std::cell::Cell;
use std::process::Stdio;
use std::rc::Rc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::event::EventManager;
use crate::promise::Promise;

const KILL_GRACE: Duration = Duration::from_secs(5);

pub struct SubprocessPipes {
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

pub struct Subprocess {
    pid: Option<Pid>,
    exited: Rc<Cell<bool>>,
    terminated: Cell<bool>,
}

impl Subprocess {
    /// Spawn with all three stdio streams piped. Returns the guard, the
    /// pipes, and a promise for the raw exit status.
    ///
    /// The promise owns the exit registration: dropping it stops the status
    /// from being delivered, and dropping the guard terminates the child.
    pub fn spawn(
        em: &EventManager,
        mut command: Command,
    ) -> Result<(Subprocess, SubprocessPipes, Promise<i32>)> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id().map(|id| Pid::from_raw(id as i32));
        let pipes = SubprocessPipes {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        let exited = Rc::new(Cell::new(false));
        let (promise, fulfiller) = Promise::pending();
        let exit_flag = exited.clone();
        let op = em.on_process_exit(child, move |status| {
            exit_flag.set(true);
            debug!(status, "child exited");
            fulfiller.fulfill(status);
        });
        let promise = promise.attach(op);

        Ok((
            Subprocess {
                pid,
                exited,
                terminated: Cell::new(false),
            },
            pipes,
            promise,
        ))
    }

    /// Ask the child to stop: SIGTERM now, SIGKILL after a grace period if
    /// it is still around. Idempotent; a no-op once the child has exited.
    pub fn terminate(&self) {
        if self.exited.get() || self.terminated.replace(true) {
            return;
        }
        let Some(pid) = self.pid else {
            return;
        };
        debug!(pid = pid.as_raw(), "terminating child");
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            debug!(pid = pid.as_raw(), error = %err, "SIGTERM failed");
            return;
        }
        let exited = self.exited.clone();
        // Grace timer lives on the local set; if the whole runtime is being
        // torn down instead, tokio's kill_on_drop delivers the SIGKILL.
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::task::spawn_local(async move {
                tokio::time::sleep(KILL_GRACE).await;
                if !exited.get() {
                    warn!(pid = pid.as_raw(), "child ignored SIGTERM; killing");
                    let _ = kill(pid, Signal::SIGKILL);
                }
            });
        } else {
            let _ = kill(pid, Signal::SIGKILL);
        }
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        self.terminate();
    }
}
