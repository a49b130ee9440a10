use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use fanout_core::{LAUNCH_FAILED_PREFIX, TIMEOUT_PREFIX};
use tracing::{debug, warn};

pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Command prefix; the program text is appended as the final argument.
    pub interpreter: Vec<String>,
    pub timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["sh".to_string(), "-c".to_string()],
            timeout: DEFAULT_RUN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed { exit_code: i32 },
    TimedOut,
    LaunchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub status: RunStatus,
}

impl RunOutcome {
    fn timed_out(timeout: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!(
                "{} program exceeded {}s limit",
                TIMEOUT_PREFIX,
                timeout.as_secs_f64()
            ),
            status: RunStatus::TimedOut,
        }
    }

    fn launch_failed(reason: impl std::fmt::Display) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("{} {}", LAUNCH_FAILED_PREFIX, reason),
            status: RunStatus::LaunchFailed,
        }
    }
}

/// Runs one untrusted program in its own child process. Every failure mode comes back
/// as a [`RunOutcome`]; nothing is raised to the caller.
#[derive(Debug, Clone, Default)]
pub struct IsolatedRunner {
    config: RunnerConfig,
}

impl IsolatedRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn execute(&self, program: &str, stdin: &str) -> RunOutcome {
        self.run(program, stdin, self.config.timeout)
    }

    /// The deadline covers the child's exit and EOF on both output pipes, so background
    /// processes holding the pipes open cannot stretch the run past `timeout`.
    pub fn run(&self, program: &str, stdin: &str, timeout: Duration) -> RunOutcome {
        let Some((bin, prefix)) = self.config.interpreter.split_first() else {
            return RunOutcome::launch_failed("no interpreter configured");
        };
        let mut cmd = Command::new(bin);
        cmd.args(prefix);
        cmd.arg(program);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            cmd.process_group(0);
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("failed to launch {}: {}", bin, e);
                return RunOutcome::launch_failed(e);
            }
        };

        if let Some(mut pipe) = child.stdin.take() {
            let input = stdin.as_bytes().to_vec();
            thread::spawn(move || {
                // A program that exits without reading closes the pipe early.
                let _ = pipe.write_all(&input);
            });
        }
        let (tx, rx) = crossbeam_channel::bounded(2);
        if let Some(pipe) = child.stdout.take() {
            read_to_string_thread(Stream::Stdout, pipe, tx.clone());
        }
        if let Some(pipe) = child.stderr.take() {
            read_to_string_thread(Stream::Stderr, pipe, tx);
        }

        let status = match wait_until(&mut child, deadline) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(timeout_secs = timeout.as_secs_f64(), "program timed out, killed");
                return RunOutcome::timed_out(timeout);
            }
            Err(e) => {
                kill_tree(&mut child);
                return RunOutcome::launch_failed(format!("wait failed: {}", e));
            }
        };
        let Some((stdout, stderr)) = collect_output(&rx, deadline) else {
            // Exited, but something it spawned still holds the pipes.
            kill_tree(&mut child);
            warn!(
                timeout_secs = timeout.as_secs_f64(),
                "program output still open at deadline, killed"
            );
            return RunOutcome::timed_out(timeout);
        };
        let exit_code = exit_code(status);
        debug!(
            exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "program finished"
        );
        RunOutcome {
            stdout,
            stderr,
            status: RunStatus::Completed { exit_code },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

fn read_to_string_thread<R: Read + Send + 'static>(
    stream: Stream,
    mut pipe: R,
    tx: crossbeam_channel::Sender<(Stream, String)>,
) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send((stream, String::from_utf8_lossy(&buf).into_owned()));
    });
}

/// `None` when either pipe is still open at the deadline.
fn collect_output(rx: &Receiver<(Stream, String)>, deadline: Instant) -> Option<(String, String)> {
    let mut stdout = String::new();
    let mut stderr = String::new();
    loop {
        match rx.recv_deadline(deadline) {
            Ok((Stream::Stdout, text)) => stdout = text,
            Ok((Stream::Stderr, text)) => stderr = text,
            Err(RecvTimeoutError::Disconnected) => return Some((stdout, stderr)),
            Err(RecvTimeoutError::Timeout) => return None,
        }
    }
}

/// `Ok(None)` means the deadline passed and the process group was killed.
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            kill_tree(child);
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: killpg only sends a signal; the group was created at spawn.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt as _;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    match status.code() {
        Some(code) => code,
        None => signal.map(|s| 128 + s).unwrap_or(1),
    }
}
