use crate::engine::{Engine, EngineEvent, EventSender, OutputCategory};
use anyhow::{anyhow, Context};
use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Runs a python program as a plain child process, without tracing.
///
/// Breakpoints are accepted but never verified. Output is forwarded as `output` events when
/// redirection is enabled, the exit code is reported when the child exits.
pub struct NoDebugEngine {
    python: PathBuf,
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    redirect_output: bool,
    events: Option<EventSender>,
    child: Option<ChildState>,
}

struct ChildState {
    pid: Pid,
    status: Arc<(Mutex<Option<i32>>, Condvar)>,
}

impl NoDebugEngine {
    /// Create an engine for `program`. Interpreter is resolved from `PATH` if not set explicitly.
    pub fn new(python: Option<&Path>, program: &Path, args: &[String]) -> anyhow::Result<Self> {
        let python = match python {
            Some(python) => python.to_path_buf(),
            None => which::which("python3")
                .or_else(|_| which::which("python"))
                .context("python interpreter not found in PATH")?,
        };
        Ok(Self {
            python,
            program: program.to_path_buf(),
            args: args.to_vec(),
            cwd: None,
            redirect_output: false,
            events: None,
            child: None,
        })
    }

    pub fn with_redirect_output(mut self, redirect: bool) -> Self {
        self.redirect_output = redirect;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.pid.as_raw() as u32)
    }

    fn spawn(&mut self, events: EventSender) -> anyhow::Result<()> {
        let mut cmd = Command::new(&self.python);
        cmd.arg(&self.program).args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut readers: Vec<(Box<dyn Read + Send>, OutputCategory)> = vec![];
        if self.redirect_output {
            let (stdout_reader, stdout_writer) = os_pipe::pipe()?;
            let (stderr_reader, stderr_writer) = os_pipe::pipe()?;
            cmd.stdout(stdout_writer).stderr(stderr_writer);
            readers.push((Box::new(stdout_reader) as Box<dyn Read + Send>, OutputCategory::Stdout));
            readers.push((Box::new(stderr_reader) as Box<dyn Read + Send>, OutputCategory::Stderr));
        }
        cmd.stdin(Stdio::null());

        let child = cmd
            .spawn()
            .with_context(|| format!("spawn {} {}", self.python.display(), self.program.display()))?;
        // drop the pipe writers held by the command so readers see EOF after the child exits
        drop(cmd);

        let pid = Pid::from_raw(child.id() as i32);
        info!(target: "engine", "debuggee started, pid {pid}");

        for (reader, category) in readers {
            let events = events.clone();
            thread::spawn(move || forward_output(reader, category, events));
        }

        let status = Arc::new((Mutex::new(None), Condvar::new()));
        thread::spawn({
            let status = status.clone();
            let events = events.clone();
            move || wait_child(child, status, events)
        });

        events.emit(EngineEvent::Process {
            name: self.program.display().to_string(),
            pid: Some(pid.as_raw() as u32),
        });
        self.child = Some(ChildState { pid, status });
        Ok(())
    }
}

fn forward_output(reader: impl Read, category: OutputCategory, events: EventSender) {
    let mut stream = BufReader::new(reader);
    loop {
        let mut line = String::new();
        let Ok(size) = stream.read_line(&mut line) else {
            break;
        };
        if size == 0 {
            break;
        }
        events.emit(EngineEvent::Output {
            category,
            output: line,
        });
    }
}

fn wait_child(mut child: Child, status: Arc<(Mutex<Option<i32>>, Condvar)>, events: EventSender) {
    let code = match child.wait() {
        Ok(exit) => exit.code().unwrap_or_else(|| {
            // killed by a signal
            use std::os::unix::process::ExitStatusExt;
            exit.signal().map(|s| 128 + s).unwrap_or(1)
        }),
        Err(e) => {
            warn!(target: "engine", "wait for debuggee: {e}");
            1
        }
    };
    debug!(target: "engine", "debuggee exited with code {code}");
    let (lock, cond) = &*status;
    *lock.lock().unwrap() = Some(code);
    cond.notify_all();
    events.emit(EngineEvent::Exited { code });
}

impl Engine for NoDebugEngine {
    fn name(&self) -> &str {
        "nodebug"
    }

    fn start(&mut self, events: EventSender) -> anyhow::Result<()> {
        self.events = Some(events);
        Ok(())
    }

    fn configuration_done(&mut self) -> anyhow::Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let events = self
            .events
            .clone()
            .ok_or_else(|| anyhow!("engine is not started"))?;
        self.spawn(events)
    }

    fn resume(&mut self, _thread_id: Option<i64>) -> anyhow::Result<()> {
        Ok(())
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        let Some(child) = &self.child else {
            return Ok(());
        };
        let (lock, cond) = &*child.status;
        if lock.lock().unwrap().is_some() {
            return Ok(());
        }

        debug!(target: "engine", "terminate debuggee {}", child.pid);
        signal::kill(child.pid, Signal::SIGTERM)?;
        let (exited, _) = cond
            .wait_timeout_while(lock.lock().unwrap(), TERMINATE_GRACE, |code| code.is_none())
            .unwrap();
        if exited.is_none() {
            warn!(target: "engine", "debuggee {} ignores SIGTERM, kill it", child.pid);
            signal::kill(child.pid, Signal::SIGKILL)?;
        }
        Ok(())
    }
}
