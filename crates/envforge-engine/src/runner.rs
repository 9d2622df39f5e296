use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::context::CommandLine;
use crate::interrupt::InterruptFlag;

pub const OUTPUT_TAIL_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Time between SIGTERM and SIGKILL when a command is aborted.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub module: String,
    /// The command as written in the manifest, for diagnostics.
    pub command: String,
    pub line: CommandLine,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Exited(i32),
    Signaled,
    TimedOut,
    Interrupted,
    SpawnFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    pub output_tail: Vec<String>,
}

impl CommandOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            status: CommandStatus::Exited(code),
            output_tail: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == CommandStatus::Exited(0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            CommandStatus::Exited(code) => Some(code),
            _ => None,
        }
    }
}

pub trait CommandRunner {
    fn run(&mut self, invocation: &Invocation) -> CommandOutcome;
}

/// Spawns real child processes, enforcing the timeout and interrupt flag.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    interrupt: InterruptFlag,
}

impl ShellRunner {
    pub fn new(interrupt: InterruptFlag) -> Self {
        Self { interrupt }
    }
}

type Tail = Arc<Mutex<VecDeque<String>>>;

impl CommandRunner for ShellRunner {
    fn run(&mut self, invocation: &Invocation) -> CommandOutcome {
        debug!(
            "module={} running: {}",
            invocation.module, invocation.line
        );
        let mut command = Command::new(&invocation.line.program);
        command
            .args(&invocation.line.args)
            .envs(invocation.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so an abort reaches everything the command started.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let spawned = command.spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                return CommandOutcome {
                    status: CommandStatus::SpawnFailed(format!(
                        "failed to start {}: {err}",
                        invocation.line.program
                    )),
                    output_tail: Vec::new(),
                }
            }
        };

        let tail: Tail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Arc::clone(&tail)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Arc::clone(&tail)));
        }

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    break match status.code() {
                        Some(code) => CommandStatus::Exited(code),
                        None => CommandStatus::Signaled,
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    terminate(&mut child);
                    break CommandStatus::SpawnFailed(format!("failed to poll child: {err}"));
                }
            }
            if self.interrupt.is_set() {
                terminate(&mut child);
                break CommandStatus::Interrupted;
            }
            if started.elapsed() > invocation.timeout {
                debug!(
                    "module={} timed out after {:?}; killing process group {}",
                    invocation.module,
                    invocation.timeout,
                    child.id()
                );
                terminate(&mut child);
                break CommandStatus::TimedOut;
            }
            thread::sleep(POLL_INTERVAL);
        };

        // A process that left the group can still hold the pipes open.
        if matches!(status, CommandStatus::Exited(_) | CommandStatus::Signaled) {
            for reader in readers {
                let _ = reader.join();
            }
        }
        let output_tail = tail
            .lock()
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default();
        debug!(
            "module={} finished: status={status:?} elapsed_ms={}",
            invocation.module,
            started.elapsed().as_millis()
        );

        CommandOutcome {
            status,
            output_tail,
        }
    }
}

/// SIGTERM to the whole group first so `sudo` can relay it, then SIGKILL
/// for whatever is left.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg only sends a signal; `pgid` is the group created at spawn.
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    // SAFETY: as above; ESRCH once the group is gone is harmless.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_reader<R: Read + Send + 'static>(stream: R, tail: Tail) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else {
                break;
            };
            if let Ok(mut lines) = tail.lock() {
                if lines.len() == OUTPUT_TAIL_LINES {
                    lines.pop_front();
                }
                lines.push_back(line);
            }
        }
    })
}
