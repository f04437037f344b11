// src/plugin/mod.rs

//! Executable rule plugins.
//!
//! A `.probuild-rule` executable teaches the system new behavior. Running it
//! with no arguments ("learn") announces its verb and trigger tags; a
//! derived factory then offers matching files, and each derived action runs
//! the executable with the trigger file's canonical name as its argument.
//!
//! The child talks a line-oriented protocol on stdout; requests that have
//! answers (`findProvider`, `findInput`, `newOutput`) are answered on its
//! stdin, one line per request, empty line for "no such file". Any line
//! that does not parse is a hard failure of the action. stderr becomes the
//! action's log output.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, Lines};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::action::{Action, ActionFactory, BuildContext, InstallLocation, Priority};
use crate::errors::{BuildError, Result};
use crate::event::{AbortOnDrop, EventManager, Executor};
use crate::exec::Subprocess;
use crate::fs::File;
use crate::promise::{self, MaybeException, Promise};
use crate::tags::Tag;

/// Bootstrap factory: claims rule executables and runs them in learn mode.
pub struct ExecRuleFactory;

impl ActionFactory for ExecRuleFactory {
    fn trigger_tags(&self) -> Vec<Tag> {
        vec![Tag::filetype(".probuild-rule")]
    }

    fn try_make_action(&self, _tag: &Tag, file: &File) -> Option<Box<dyn Action>> {
        Some(Box::new(PluginAction {
            executable: file.clone(),
            verb: "learn".to_string(),
            silent: false,
            input: None,
        }))
    }

    fn priority(&self) -> Priority {
        Priority::Rules
    }
}

/// Factory built from what a rule announced during its learn run.
struct PluginDerivedFactory {
    executable: File,
    verb: String,
    silent: bool,
    priority: Priority,
    triggers: Vec<Tag>,
}

impl ActionFactory for PluginDerivedFactory {
    fn trigger_tags(&self) -> Vec<Tag> {
        self.triggers.clone()
    }

    fn try_make_action(&self, _tag: &Tag, file: &File) -> Option<Box<dyn Action>> {
        Some(Box::new(PluginAction {
            executable: self.executable.clone(),
            verb: self.verb.clone(),
            silent: self.silent,
            input: Some(file.clone()),
        }))
    }

    fn priority(&self) -> Priority {
        self.priority
    }
}

struct PluginAction {
    executable: File,
    verb: String,
    silent: bool,
    /// None for the learn run.
    input: Option<File>,
}

impl Action for PluginAction {
    fn verb(&self) -> &str {
        &self.verb
    }

    fn is_silent(&self) -> bool {
        self.silent
    }

    fn start(&mut self, em: &EventManager, context: Rc<dyn BuildContext>) -> Promise<()> {
        let exec = em.executor();
        let mut command = Command::new(self.executable.disk_path());
        if let Some(input) = &self.input {
            command.arg(input.canonical_name());
        }

        let (subprocess, pipes, exit_promise) = match Subprocess::spawn(em, command) {
            Ok(parts) => parts,
            Err(err) => return Promise::rejected(err),
        };
        let subprocess = Rc::new(subprocess);

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (pipes.stdin, pipes.stdout, pipes.stderr)
        else {
            return Promise::rejected(BuildError::Internal(
                "child spawned without piped stdio".to_string(),
            ));
        };

        let (responses, writer_guard) = spawn_response_writer(stdin);
        let state = Rc::new(CommandState::new(
            context.clone(),
            self.executable.clone(),
            self.input.clone(),
            responses,
        ));

        let commands = drive_commands(exec.clone(), BufReader::new(stdout).lines(), state.clone());
        let terminate_on_error = subprocess.clone();
        let commands = promise::when(&exec, commands).then_catch(
            |()| (),
            move |error: MaybeException<()>| -> Result<()> {
                // A protocol failure must not leave the child running, or
                // the exit join would never complete.
                terminate_on_error.terminate();
                error.get()?;
                Ok(())
            },
        );

        let logging = drive_log(exec.clone(), BufReader::new(stderr).lines(), context.clone());

        let exit_context = context.clone();
        let exit_done = promise::when(&exec, exit_promise).then(move |status: i32| {
            if status != 0 {
                exit_context.log(&format!("process exited with status {status}"));
                exit_context.failed();
            }
        });

        promise::when3(&exec, exit_done, commands, logging)
            .then(|(), (), ()| ())
            .attach(subprocess)
            .attach(writer_guard)
            .attach(state)
    }
}

type CmdLines = Lines<BufReader<ChildStdout>>;
type LogLines = Lines<BufReader<ChildStderr>>;

/// Read one line off the stream, handing the stream back alongside it.
fn read_line<R>(lines: Lines<BufReader<R>>) -> Promise<(Lines<BufReader<R>>, Option<String>)>
where
    R: AsyncRead + Unpin + 'static,
{
    let (promise, fulfiller) = Promise::pending();
    let handle = tokio::task::spawn_local(async move {
        let mut lines = lines;
        match lines.next_line().await {
            Ok(line) => fulfiller.fulfill((lines, line)),
            Err(err) => fulfiller.reject(err.into()),
        }
    });
    promise.attach(AbortOnDrop(handle))
}

/// Single writer for protocol responses, so answers keep request order.
fn spawn_response_writer(stdin: ChildStdin) -> (mpsc::UnboundedSender<String>, AbortOnDrop) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = tokio::task::spawn_local(async move {
        let mut stdin = stdin;
        while let Some(line) = rx.recv().await {
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });
    (tx, AbortOnDrop(handle))
}

fn drive_commands(exec: Rc<dyn Executor>, lines: CmdLines, state: Rc<CommandState>) -> Promise<()> {
    promise::when(&exec, read_line(lines)).then(
        move |(lines, line): (CmdLines, Option<String>)| -> Promise<()> {
            match line {
                None => {
                    state.finish();
                    Promise::fulfilled(())
                }
                Some(line) => match state.consume(&line) {
                    Ok(()) => drive_commands(exec.clone(), lines, state.clone()),
                    Err(err) => Promise::rejected(err),
                },
            }
        },
    )
}

fn drive_log(exec: Rc<dyn Executor>, lines: LogLines, context: Rc<dyn BuildContext>) -> Promise<()> {
    promise::when(&exec, read_line(lines)).then(
        move |(lines, line): (LogLines, Option<String>)| -> Promise<()> {
            match line {
                None => Promise::fulfilled(()),
                Some(line) => {
                    context.log(&line);
                    drive_log(exec.clone(), lines, context.clone())
                }
            }
        },
    )
}

fn split_token<'a>(line: &mut &'a str) -> &'a str {
    match line.find(' ') {
        Some(idx) => {
            let token = &line[..idx];
            *line = &line[idx + 1..];
            token
        }
        None => {
            let token = *line;
            *line = "";
            token
        }
    }
}

struct CommandState {
    context: Rc<dyn BuildContext>,
    executable: File,
    input: Option<File>,
    responses: mpsc::UnboundedSender<String>,

    verb: RefCell<String>,
    silent: Cell<bool>,
    priority: Cell<Priority>,
    triggers: RefCell<Vec<Tag>>,

    /// Files the child may name in `provide`/`install`: its input plus
    /// anything it looked up or created.
    known_files: RefCell<HashMap<String, File>>,
    /// Request line -> previously sent response path.
    cache: RefCell<HashMap<String, String>>,
    provisions: RefCell<Vec<(File, Tag)>>,
}

impl CommandState {
    fn new(
        context: Rc<dyn BuildContext>,
        executable: File,
        input: Option<File>,
        responses: mpsc::UnboundedSender<String>,
    ) -> CommandState {
        // Default verb: the executable's basename without its extension.
        let basename = executable.basename();
        let verb = match basename.rfind('.') {
            Some(idx) if idx > 0 => basename[..idx].to_string(),
            _ => basename.to_string(),
        };

        let mut known_files = HashMap::new();
        if let Some(input) = &input {
            known_files.insert(input.canonical_name().to_string(), input.clone());
        }

        CommandState {
            context,
            executable,
            input,
            responses,
            verb: RefCell::new(verb),
            silent: Cell::new(false),
            priority: Cell::new(Priority::CodeGen),
            triggers: RefCell::new(Vec::new()),
            known_files: RefCell::new(known_files),
            cache: RefCell::new(HashMap::new()),
            provisions: RefCell::new(Vec::new()),
        }
    }

    fn respond(&self, text: &str) {
        let _ = self.responses.send(format!("{text}\n"));
    }

    /// Answer a lookup request: remember the path for repeats, remember the
    /// file for later `provide`/`install` lines.
    fn respond_file(&self, line: &str, file: Option<File>) {
        match file {
            Some(file) => {
                let path = file.disk_path().display().to_string();
                self.cache
                    .borrow_mut()
                    .insert(line.to_string(), path.clone());
                self.known_files.borrow_mut().insert(path.clone(), file);
                self.respond(&path);
            }
            None => self.respond(""),
        }
    }

    fn consume(&self, line: &str) -> Result<()> {
        if let Some(path) = self.cache.borrow().get(line) {
            self.respond(path);
            return Ok(());
        }

        let mut rest = line;
        let command = split_token(&mut rest);
        match command {
            "verb" => {
                *self.verb.borrow_mut() = rest.to_string();
            }
            "silent" => {
                self.silent.set(true);
            }
            "trigger" => {
                self.triggers.borrow_mut().push(Tag::from_name(rest));
            }
            "priority" => match rest {
                "codegen" => self.priority.set(Priority::CodeGen),
                "compilation" => self.priority.set(Priority::Compilation),
                other => {
                    return Err(BuildError::PluginProtocol(format!(
                        "invalid priority: {other}"
                    )));
                }
            },
            "findProvider" => {
                let file = self.context.find_provider(&Tag::from_name(rest));
                self.respond_file(line, file);
            }
            "findInput" => {
                if let Some(input) = &self.input {
                    if input.canonical_name() == rest {
                        self.respond_file(line, Some(input.clone()));
                        return Ok(());
                    }
                }
                // The child may ask for a file it created itself earlier.
                let own_output = self.cache.borrow().get(&format!("newOutput {rest}")).cloned();
                if let Some(path) = own_output {
                    self.respond(&path);
                    return Ok(());
                }
                let file = self.context.find_input(rest);
                self.respond_file(line, file);
            }
            "noteInput" => {
                // A read outside the tree (installed tool, system header).
                // Not tracked.
                debug!(path = rest, "plugin noted external input");
            }
            "newOutput" => {
                let file = self.context.new_output(rest)?;
                self.respond_file(line, Some(file));
            }
            "provide" => {
                let mut rest = rest;
                let filename = split_token(&mut rest);
                let file = self.known_files.borrow().get(filename).cloned();
                match file {
                    Some(file) => {
                        self.provisions
                            .borrow_mut()
                            .push((file, Tag::from_name(rest)));
                    }
                    None => {
                        return Err(BuildError::PluginProtocol(format!(
                            "file passed to \"provide\" was never opened here: {filename}"
                        )));
                    }
                }
            }
            "install" => {
                let mut rest = rest;
                let filename = split_token(&mut rest);
                let file = self.known_files.borrow().get(filename).cloned();
                let Some(file) = file else {
                    return Err(BuildError::PluginProtocol(format!(
                        "file passed to \"install\" was never opened here: {filename}"
                    )));
                };
                let Some((dir, name)) = rest.split_once('/') else {
                    return Err(BuildError::PluginProtocol(format!(
                        "invalid install location: {rest}"
                    )));
                };
                let Some(location) = InstallLocation::from_dir_name(dir) else {
                    return Err(BuildError::PluginProtocol(format!(
                        "invalid install location: {rest}"
                    )));
                };
                if name.is_empty() {
                    return Err(BuildError::PluginProtocol(format!(
                        "invalid install location: {rest}"
                    )));
                }
                self.context.install(&file, location, name);
            }
            "passed" => {
                self.context.passed();
            }
            _ => {
                return Err(BuildError::PluginProtocol(format!(
                    "invalid command: {line}"
                )));
            }
        }
        Ok(())
    }

    /// End of the command stream: commit provisions, and for a learn run,
    /// register the factory this rule described.
    fn finish(&self) {
        let provisions = self.provisions.take();
        let mut grouped: Vec<(File, Vec<Tag>)> = Vec::new();
        for (file, tag) in provisions {
            match grouped.iter_mut().find(|(candidate, _)| *candidate == file) {
                Some((_, tags)) => tags.push(tag),
                None => grouped.push((file, vec![tag])),
            }
        }
        for (file, tags) in grouped {
            self.context.provide(&file, tags);
        }

        if self.input.is_none() {
            self.context
                .add_action_type(Box::new(PluginDerivedFactory {
                    executable: self.executable.clone(),
                    verb: self.verb.borrow().clone(),
                    silent: self.silent.get(),
                    priority: self.priority.get(),
                    triggers: self.triggers.borrow().clone(),
                }));
        }
    }
}
