//! Supervision of external processes (par2, unrar, user scripts)
//!
//! A [`Supervised`] process has its stdout and stderr merged into one stream
//! of lines, accepts writes on stdin, and can be killed at any time. Output
//! without a trailing newline is still delivered when it ends in an
//! interactive prompt (unrar's `[C]ontinue, [Q]uit`), so callers waiting for
//! the prompt are not stuck.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Partial output ending in one of these is flushed as a line
const PROMPT_SUFFIXES: &[&str] = &["[Q]uit", "[Q]uit "];

/// A running external process
pub struct Supervised {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<String>,
}

impl Supervised {
    /// Start `program` with `args` in `cwd`
    pub fn spawn<I, S>(program: &Path, args: I, cwd: Option<&Path>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let name = program.display().to_string();
        let mut child = command
            .spawn()
            .map_err(|e| Error::ExternalTool(format!("failed to execute {name}: {e}")))?;

        let (tx, lines) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }
        debug!(program = %name, pid = ?child.id(), "started external process");

        Ok(Self {
            program: name,
            stdin: child.stdin.take(),
            child,
            lines,
        })
    }

    /// Next line of output; `None` once both streams are closed
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Write raw bytes to the process's stdin
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::ExternalTool(format!("{} stdin is closed", self.program)))?;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Kill the process
    pub async fn kill(&mut self) {
        self.stdin = None;
        if let Err(e) = self.child.kill().await {
            debug!(program = %self.program, error = %e, "kill failed, process already gone");
        }
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.stdin = None;
        Ok(self.child.wait().await?)
    }
}

async fn forward_lines<R>(mut reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut partial: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        partial.extend_from_slice(&buf[..n]);
        while let Some(pos) = partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = partial.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim_end().to_string();
            if tx.send(text).await.is_err() {
                return;
            }
        }
        let prompt = {
            let pending = String::from_utf8_lossy(&partial);
            PROMPT_SUFFIXES
                .iter()
                .any(|p| pending.ends_with(p))
                .then(|| pending.trim_end().to_string())
        };
        if let Some(text) = prompt {
            partial.clear();
            if tx.send(text).await.is_err() {
                return;
            }
        }
    }
    if !partial.is_empty() {
        let _ = tx
            .send(String::from_utf8_lossy(&partial).trim_end().to_string())
            .await;
    }
}

/// Collected output of a finished process
#[derive(Debug)]
pub struct ProcessOutput {
    /// Every line of stdout and stderr, interleaved in arrival order
    pub lines: Vec<String>,
    /// Exit status
    pub status: ExitStatus,
}

/// Run a process to completion, killing it when `cancel` fires
pub async fn run<I, S>(
    program: &Path,
    args: I,
    cwd: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<ProcessOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut process = Supervised::spawn(program, args, cwd)?;
    let mut lines = Vec::new();
    loop {
        tokio::select! {
            line = process.next_line() => match line {
                Some(line) => lines.push(line),
                None => break,
            },
            _ = cancel.cancelled() => {
                warn!(program = %program.display(), "killing external process");
                process.kill().await;
                return Err(Error::ExternalTool(format!(
                    "{} was cancelled",
                    program.display()
                )));
            }
        }
    }
    let status = process.wait().await?;
    Ok(ProcessOutput { lines, status })
}
