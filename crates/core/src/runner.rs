// Shell command execution with streaming or buffered output

use crate::ports::{ExecutionOutput, OutputStream, StepLabel};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// How a command's output is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Lines go to the output port as they arrive
    Realtime,
    /// Lines are collected and returned to the caller
    Buffered,
}

/// Everything needed to run one command
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub shell: Option<Vec<String>>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub mode: OutputMode,
    pub label: StepLabel,
}

/// Result of one command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutcome {
    /// A failure that never reached the point of producing output
    pub fn spawn_failure(message: impl std::fmt::Display, duration: Duration) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: Vec::new(),
            stderr: vec![format!("Error: {}", message)],
            timed_out: false,
            duration,
        }
    }
}

/// Runs shell commands. Implementations never return errors: process-level
/// problems are reported as a failed [`CommandOutcome`].
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, request: &CommandRequest) -> CommandOutcome;
}

/// Splits a byte stream into complete lines, holding back a trailing partial line.
/// Bytes are decoded only once their line is complete, so a multibyte
/// character split across two reads stays intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let remainder = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, remainder);
        complete[..last_newline]
            .split(|&b| b == b'\n')
            .map(|line| decode_line(line.strip_suffix(b"\r").unwrap_or(line)))
            .collect()
    }

    /// Flush the trailing partial line, if it has any non-whitespace content
    pub fn finish(&mut self) -> Option<String> {
        let rest = decode_line(&std::mem::take(&mut self.pending));
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Program and arguments used to run `command`
pub fn shell_invocation(shell: Option<&[String]>, command: &str) -> (String, Vec<String>) {
    if let Some([program, args @ ..]) = shell {
        let mut args = args.to_vec();
        args.push(command.to_string());
        return (program.clone(), args);
    }

    if cfg!(windows) {
        (
            "cmd.exe".to_string(),
            vec!["/c".to_string(), command.to_string()],
        )
    } else {
        let program = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        (program, vec!["-c".to_string(), command.to_string()])
    }
}

/// [`TaskRunner`] backed by real child processes
pub struct ShellTaskRunner {
    output: Arc<dyn ExecutionOutput>,
}

impl ShellTaskRunner {
    pub fn new(output: Arc<dyn ExecutionOutput>) -> Self {
        Self { output }
    }

    fn spawn(&self, request: &CommandRequest) -> std::io::Result<Child> {
        let (program, args) = shell_invocation(request.shell.as_deref(), &request.command);
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }
        command.spawn()
    }
}

#[async_trait::async_trait]
impl TaskRunner for ShellTaskRunner {
    async fn run(&self, request: &CommandRequest) -> CommandOutcome {
        let started = Instant::now();
        let realtime = request.mode == OutputMode::Realtime;
        if realtime {
            self.output.step_started(&request.label);
        }

        tracing::debug!("Spawning command: {}", request.command);
        let mut child = match self.spawn(request) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("Failed to spawn command {:?}: {}", request.command, e);
                let outcome = CommandOutcome::spawn_failure(e, started.elapsed());
                if realtime {
                    for line in &outcome.stderr {
                        self.output.output_line(OutputStream::Stderr, line);
                    }
                    self.output
                        .step_finished(&request.label, false, outcome.duration);
                }
                return outcome;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputStream::Stderr, tx.clone()));
        }
        drop(tx);

        let deadline = async {
            match request.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut outcome = CommandOutcome::default();
        let mut status = None;
        let mut streams_open = true;

        loop {
            tokio::select! {
                line = rx.recv(), if streams_open => match line {
                    Some((stream, line)) => self.deliver(realtime, &mut outcome, stream, line),
                    None => streams_open = false,
                },
                result = child.wait(), if status.is_none() => {
                    status = Some(result);
                }
                _ = &mut deadline, if !outcome.timed_out => {
                    outcome.timed_out = true;
                    terminate(&mut child);
                    break;
                }
            }

            if status.is_some() && !streams_open {
                break;
            }
        }

        if outcome.timed_out {
            while let Ok((stream, line)) = rx.try_recv() {
                self.deliver(realtime, &mut outcome, stream, line);
            }
            let secs = request.timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
            let message = format!("Command timed out after {} seconds", secs);
            tracing::warn!("{}: {}", message, request.command);
            self.deliver(realtime, &mut outcome, OutputStream::Stderr, message);
            outcome.success = false;
        } else {
            match status {
                Some(Ok(exit)) => {
                    outcome.exit_code = exit.code();
                    outcome.success = exit.success();
                }
                Some(Err(e)) => {
                    let message = format!("Error: {}", e);
                    self.deliver(realtime, &mut outcome, OutputStream::Stderr, message);
                    outcome.success = false;
                }
                None => outcome.success = false,
            }
        }

        outcome.duration = started.elapsed();
        if realtime {
            self.output
                .step_finished(&request.label, outcome.success, outcome.duration);
        }
        outcome
    }
}

impl ShellTaskRunner {
    fn deliver(
        &self,
        realtime: bool,
        outcome: &mut CommandOutcome,
        stream: OutputStream,
        line: String,
    ) {
        if realtime {
            self.output.output_line(stream, &line);
        }
        match stream {
            OutputStream::Stdout => outcome.stdout.push(line),
            OutputStream::Stderr => outcome.stderr.push(line),
        }
    }
}

async fn pump<R>(mut reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    if tx.send((stream, line)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!("Stopped reading {:?}: {}", stream, e);
                break;
            }
        }
    }
    if let Some(line) = buffer.finish() {
        let _ = tx.send((stream, line));
    }
}

fn terminate(child: &mut Child) {
    if child.id().map(send_sigterm).unwrap_or(false) {
        return;
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill timed out command: {}", e);
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> bool {
    false
}
