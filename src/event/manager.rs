// src/event/manager.rs

//! The single-threaded event manager.
//!
//! All continuations, tag-index mutations, and driver state transitions run
//! on the loop thread, one handler per turn. The loop alternates between
//! popping one yielded callback and blocking on a unified wake channel fed
//! by the OS sources (fd readiness and child waits via tokio tasks, file
//! changes via a shared `notify` watcher).
//!
//! Each registered callback is tied to an [`AsyncOp`]; dropping the handle
//! removes the registration, and a wake that arrives for a removed
//! registration is ignored, so after drop the callback is guaranteed not to
//! fire.
//!
//! The manager expects to run inside a tokio current-thread runtime with a
//! `LocalSet` (sources use `spawn_local`).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::errors::{BuildError, Result};
use crate::promise::{Promise, PromiseResult};

use super::executor::{Executor, PendingRunnable, TurnQueue};

enum Wake {
    /// A one-shot source with the given registration id became ready.
    Fire(u64, Payload),
    /// Raw filesystem notification; mapped to registrations on the loop
    /// thread.
    Fs(notify::Event),
    /// An OS-level failure the loop cannot recover from.
    Fatal(String),
    /// A turn was queued; wake the loop so it drains the turn queue.
    Nudge,
}

enum Payload {
    Ready,
    /// Raw exit status: the exit code, or the negated signal number.
    Exit(i32),
}

enum Cleanup {
    /// Abort the source task when the registration goes away.
    Abort(tokio::task::JoinHandle<()>),
    /// Leave the source task running (process waits keep reaping).
    Detach,
    /// Release the file-change bookkeeping for this directory.
    Unwatch(PathBuf),
}

struct Registration {
    callback: Box<dyn FnOnce(Payload)>,
    cleanup: Cleanup,
}

struct FsWatches {
    watcher: Option<RecommendedWatcher>,
    /// Watched directories with registration refcounts.
    dirs: HashMap<PathBuf, usize>,
    /// Registration id -> absolute path the registration cares about.
    targets: HashMap<u64, PathBuf>,
}

struct Inner {
    next_id: Cell<u64>,
    turns: TurnQueue,
    registrations: RefCell<HashMap<u64, Registration>>,
    wake_tx: mpsc::UnboundedSender<Wake>,
    wake_rx: RefCell<Option<mpsc::UnboundedReceiver<Wake>>>,
    fs: RefCell<FsWatches>,
}

#[derive(Clone)]
pub struct EventManager {
    inner: Rc<Inner>,
}

/// Owned handle to a registered one-shot callback. Dropping it cancels the
/// registration; the callback will not fire afterwards.
pub struct AsyncOp {
    id: u64,
    inner: Weak<Inner>,
}

impl Drop for AsyncOp {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unregister(self.id);
        }
    }
}

/// Aborts a tokio task when dropped. Used to tie helper tasks (line readers
/// and the like) to the promise that consumes their result.
pub(crate) struct AbortOnDrop(pub(crate) tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct FdWatch(RawFd);

impl AsRawFd for FdWatch {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Executor for Inner {
    fn run_later(&self, runnable: Box<dyn FnOnce()>) -> PendingRunnable {
        let pending = self.turns.push(runnable);
        // The loop may be parked on the wake channel (sources fulfill
        // promises from their own tasks); make sure it notices the turn.
        let _ = self.wake_tx.send(Wake::Nudge);
        pending
    }
}

impl Executor for EventManager {
    fn run_later(&self, runnable: Box<dyn FnOnce()>) -> PendingRunnable {
        self.inner.run_later(runnable)
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn register(&self, id: u64, callback: Box<dyn FnOnce(Payload)>, cleanup: Cleanup) {
        self.registrations
            .borrow_mut()
            .insert(id, Registration { callback, cleanup });
    }

    /// Remove a registration, returning its callback. Idempotent.
    fn unregister(&self, id: u64) -> Option<Box<dyn FnOnce(Payload)>> {
        let registration = self.registrations.borrow_mut().remove(&id)?;
        match registration.cleanup {
            Cleanup::Abort(handle) => handle.abort(),
            Cleanup::Detach => {}
            Cleanup::Unwatch(dir) => self.unwatch_dir(id, &dir),
        }
        Some(registration.callback)
    }

    fn unwatch_dir(&self, id: u64, dir: &Path) {
        let mut fs = self.fs.borrow_mut();
        fs.targets.remove(&id);
        if let Some(count) = fs.dirs.get_mut(dir) {
            *count -= 1;
            if *count == 0 {
                fs.dirs.remove(dir);
                if let Some(watcher) = fs.watcher.as_mut() {
                    if let Err(err) = watcher.unwatch(dir) {
                        debug!(dir = %dir.display(), error = %err, "unwatch failed");
                    }
                }
            }
        }
    }

    /// Lazily create the shared watcher and add a refcounted non-recursive
    /// watch on `dir`.
    fn add_dir_watch(&self, dir: &Path) -> Result<()> {
        let mut fs = self.fs.borrow_mut();
        let fs = &mut *fs;
        if fs.watcher.is_none() {
            let wake_tx = self.wake_tx.clone();
            // Called from notify's own thread; only forwards into the wake
            // channel, mapping happens on the loop thread.
            let watcher = RecommendedWatcher::new(
                move |result: notify::Result<notify::Event>| match result {
                    Ok(event) => {
                        let _ = wake_tx.send(Wake::Fs(event));
                    }
                    Err(err) => {
                        let _ = wake_tx.send(Wake::Fatal(format!("file watch error: {err}")));
                    }
                },
                notify::Config::default(),
            )
            .map_err(|err| BuildError::Internal(format!("creating file watcher: {err}")))?;
            fs.watcher = Some(watcher);
        }
        let Some(watcher) = fs.watcher.as_mut() else {
            return Err(BuildError::Internal("file watcher unavailable".to_string()));
        };
        if fs.dirs.get(dir).copied().unwrap_or(0) == 0 {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|err| {
                    BuildError::Internal(format!("watching {}: {err}", dir.display()))
                })?;
        }
        *fs.dirs.entry(dir.to_path_buf()).or_insert(0) += 1;
        Ok(())
    }
}

impl EventManager {
    pub fn new() -> EventManager {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        EventManager {
            inner: Rc::new(Inner {
                next_id: Cell::new(1),
                turns: TurnQueue::new(),
                registrations: RefCell::new(HashMap::new()),
                wake_tx,
                wake_rx: RefCell::new(Some(wake_rx)),
                fs: RefCell::new(FsWatches {
                    watcher: None,
                    dirs: HashMap::new(),
                    targets: HashMap::new(),
                }),
            }),
        }
    }

    /// This manager as a shared executor for promise combinators.
    pub fn executor(&self) -> Rc<dyn Executor> {
        self.inner.clone()
    }

    /// Queue a callback with no cancellation handle.
    pub fn run_detached(&self, runnable: impl FnOnce() + 'static) {
        self.inner.turns.push_detached(Box::new(runnable));
        let _ = self.inner.wake_tx.send(Wake::Nudge);
    }

    /// One-shot: fires when `fd` becomes readable.
    pub fn on_readable(&self, fd: RawFd, callback: impl FnOnce() + 'static) -> AsyncOp {
        self.watch_fd(fd, Interest::READABLE, callback)
    }

    /// One-shot: fires when `fd` becomes writable.
    pub fn on_writable(&self, fd: RawFd, callback: impl FnOnce() + 'static) -> AsyncOp {
        self.watch_fd(fd, Interest::WRITABLE, callback)
    }

    fn watch_fd(&self, fd: RawFd, interest: Interest, callback: impl FnOnce() + 'static) -> AsyncOp {
        let id = self.inner.next_id();
        let wake_tx = self.inner.wake_tx.clone();
        let handle = tokio::task::spawn_local(async move {
            let watch = match AsyncFd::with_interest(FdWatch(fd), interest) {
                Ok(watch) => watch,
                Err(err) => {
                    let _ = wake_tx.send(Wake::Fatal(format!("watching fd {fd}: {err}")));
                    return;
                }
            };
            let ready = match interest {
                i if i.is_readable() => watch.readable().await.map(|_| ()),
                _ => watch.writable().await.map(|_| ()),
            };
            match ready {
                Ok(()) => {
                    let _ = wake_tx.send(Wake::Fire(id, Payload::Ready));
                }
                Err(err) => {
                    let _ = wake_tx.send(Wake::Fatal(format!("polling fd {fd}: {err}")));
                }
            }
        });
        self.inner.register(
            id,
            Box::new(move |_payload| callback()),
            Cleanup::Abort(handle),
        );
        AsyncOp {
            id,
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Fires when the child terminates. The callback receives the raw exit
    /// status: the exit code, or the negated signal number if the child was
    /// killed by a signal.
    ///
    /// The wait task keeps running after the handle is dropped so the child
    /// is still reaped; only the callback delivery is cancelled.
    pub fn on_process_exit(&self, mut child: Child, callback: impl FnOnce(i32) + 'static) -> AsyncOp {
        let id = self.inner.next_id();
        let wake_tx = self.inner.wake_tx.clone();
        tokio::task::spawn_local(async move {
            match child.wait().await {
                Ok(status) => {
                    let raw = status
                        .code()
                        .unwrap_or_else(|| -status.signal().unwrap_or(0));
                    let _ = wake_tx.send(Wake::Fire(id, Payload::Exit(raw)));
                }
                Err(err) => {
                    let _ = wake_tx.send(Wake::Fatal(format!("waiting for child: {err}")));
                }
            }
        });
        self.inner.register(
            id,
            Box::new(move |payload| {
                if let Payload::Exit(status) = payload {
                    callback(status);
                }
            }),
            Cleanup::Detach,
        );
        AsyncOp {
            id,
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// One-shot: fires when the path's contents, existence, or type
    /// changes. For a directory this covers its direct entries.
    pub fn on_file_change(&self, path: &Path, callback: impl FnOnce() + 'static) -> Result<AsyncOp> {
        let (dir, target) = if path.is_dir() {
            let dir = std::fs::canonicalize(path)?;
            (dir.clone(), dir)
        } else {
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let dir = std::fs::canonicalize(parent)?;
            let name = path.file_name().ok_or_else(|| {
                BuildError::Internal(format!("cannot watch path {}", path.display()))
            })?;
            (dir.clone(), dir.join(name))
        };

        self.inner.add_dir_watch(&dir)?;
        let id = self.inner.next_id();
        self.inner.fs.borrow_mut().targets.insert(id, target);
        self.inner.register(
            id,
            Box::new(move |_payload| callback()),
            Cleanup::Unwatch(dir),
        );
        Ok(AsyncOp {
            id,
            inner: Rc::downgrade(&self.inner),
        })
    }

    /// Run one yielded callback if any is queued. Returns whether one ran.
    pub fn turn_once(&self) -> bool {
        self.inner.turns.run_next()
    }

    /// Number of queued, uncancelled turns.
    pub fn pending_turns(&self) -> usize {
        self.inner.turns.len()
    }

    /// Number of live async-operation registrations.
    pub fn live_ops(&self) -> usize {
        self.inner.registrations.borrow().len()
    }

    /// Run until there are no live async operations and no pending turns.
    pub async fn run(&self) -> Result<()> {
        let mut rx = self.take_rx()?;
        let result = self.drive(&mut rx, &mut || false).await;
        *self.inner.wake_rx.borrow_mut() = Some(rx);
        result
    }

    /// Run until the given promise settles, returning its result. Fails
    /// with an internal error if the loop goes idle first.
    pub async fn run_until<T: 'static>(&self, promise: Promise<T>) -> Result<T> {
        let slot: Rc<RefCell<Option<PromiseResult<T>>>> = Rc::new(RefCell::new(None));
        let writer = slot.clone();
        let _cell = promise.subscribe(Box::new(move |result| {
            *writer.borrow_mut() = Some(result);
        }));

        let mut rx = self.take_rx()?;
        let mut outcome = None;
        let result = self
            .drive(&mut rx, &mut || {
                if let Some(result) = slot.borrow_mut().take() {
                    outcome = Some(result);
                    true
                } else {
                    false
                }
            })
            .await;
        *self.inner.wake_rx.borrow_mut() = Some(rx);

        result?;
        match outcome {
            Some(result) => result.map_err(BuildError::from),
            None => Err(BuildError::Internal(
                "event loop went idle before completion".to_string(),
            )),
        }
    }

    fn take_rx(&self) -> Result<mpsc::UnboundedReceiver<Wake>> {
        self.inner
            .wake_rx
            .borrow_mut()
            .take()
            .ok_or_else(|| BuildError::Internal("event loop is already running".to_string()))
    }

    async fn drive(
        &self,
        rx: &mut mpsc::UnboundedReceiver<Wake>,
        done: &mut dyn FnMut() -> bool,
    ) -> Result<()> {
        loop {
            if done() {
                return Ok(());
            }
            if self.turn_once() {
                continue;
            }
            if self.inner.registrations.borrow().is_empty() && self.inner.turns.is_empty() {
                return Ok(());
            }
            match rx.recv().await {
                Some(wake) => self.dispatch(wake)?,
                None => return Ok(()),
            }
        }
    }

    fn dispatch(&self, wake: Wake) -> Result<()> {
        match wake {
            Wake::Fire(id, payload) => {
                if let Some(callback) = self.inner.unregister(id) {
                    callback(payload);
                } else {
                    trace!(id, "wake for cancelled registration dropped");
                }
                Ok(())
            }
            Wake::Fs(event) => {
                self.dispatch_fs(event);
                Ok(())
            }
            Wake::Fatal(message) => {
                warn!(%message, "fatal event loop error");
                Err(BuildError::Internal(message))
            }
            Wake::Nudge => Ok(()),
        }
    }

    fn dispatch_fs(&self, event: notify::Event) {
        let fired: Vec<u64> = {
            let fs = self.inner.fs.borrow();
            fs.targets
                .iter()
                .filter(|(_, target)| {
                    event.paths.iter().any(|path| {
                        path == *target || path.parent() == Some(target.as_path())
                    })
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in fired {
            if let Some(callback) = self.inner.unregister(id) {
                callback(Payload::Ready);
            }
        }
    }
}

impl Default for EventManager {
    fn default() -> EventManager {
        EventManager::new()
    }
}
