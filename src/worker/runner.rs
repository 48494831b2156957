use std::io::SeekFrom;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::time::MissedTickBehavior;

use crate::error::{FarmError, Result};
use crate::model::BucketId;
use crate::store::{ConnectionRelease, EntityStore};
use crate::worker::command::BuildTool;

/// Signal a build tool raises when it aborts itself.
pub const ABORT_SIGNAL: i32 = 6;

/// Receives the output of a running task in chunks.
pub trait LogSink: Send + Sync {
    fn append(&self, chunk: &str) -> Result<()>;
}

/// Appends output as log fragments of a bucket.
pub struct BucketLogSink {
    store: Arc<dyn EntityStore>,
    bucket_id: BucketId,
}

impl BucketLogSink {
    pub fn new(store: Arc<dyn EntityStore>, bucket_id: BucketId) -> Self {
        Self { store, bucket_id }
    }
}

impl LogSink for BucketLogSink {
    fn append(&self, chunk: &str) -> Result<()> {
        self.store.append_log(self.bucket_id, chunk)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    /// The process could not be spawned.
    NotStarted,
}

impl From<ExitStatus> for Termination {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Termination::Exited(code),
            (None, Some(signal)) => Termination::Signaled(signal),
            (None, None) => Termination::NotStarted,
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exit code {}", code),
            Termination::Signaled(signal) => write!(f, "signal {}", signal),
            Termination::NotStarted => write!(f, "not started"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(Termination),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }

    fn classify(termination: Termination) -> Self {
        match termination {
            Termination::Exited(0) => TaskOutcome::Succeeded,
            other => TaskOutcome::Failed(other),
        }
    }
}

fn abort_notice() -> String {
    let rule = "-".repeat(80);
    format!("\n\n{rule}\n\nbuild tool aborted - retrying once\n\n{rule}\n\n")
}

/// Runs build tasks as subprocesses of a project checkout.
///
/// Output goes to a scratch log file in the checkout which is tailed into a
/// [`LogSink`] while the task runs. The storage connection is released around
/// every spawn.
#[derive(Clone)]
pub struct TaskRunner {
    store: Arc<dyn EntityStore>,
    tool: BuildTool,
    poll_interval: Duration,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn EntityStore>, tool: BuildTool, poll_interval: Duration) -> Self {
        Self {
            store,
            tool,
            poll_interval,
        }
    }

    pub fn tool(&self) -> &BuildTool {
        &self.tool
    }

    /// Run `task` in `workdir`, retrying once when the tool aborted itself.
    pub async fn run(&self, workdir: &Path, task: &str, sink: &dyn LogSink) -> Result<TaskOutcome> {
        let outcome = self.run_once(workdir, task, sink).await?;
        if outcome == TaskOutcome::Failed(Termination::Signaled(ABORT_SIGNAL)) {
            tracing::warn!(task, "Build tool aborted, retrying task once");
            sink.append(&abort_notice())?;
            return self.run_once(workdir, task, sink).await;
        }
        Ok(outcome)
    }

    async fn run_once(&self, workdir: &Path, task: &str, sink: &dyn LogSink) -> Result<TaskOutcome> {
        let argv = self.tool.command_line(workdir, task);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| FarmError::Internal("empty command line".to_string()))?;
        tracing::info!(task, command = %argv.join(" "), workdir = %workdir.display(), "Running task");

        let log_path = self.tool.log_path(workdir);
        let stdout = std::fs::File::create(&log_path)?;
        let stderr = stdout.try_clone()?;

        let spawned = {
            let _released = ConnectionRelease::new(self.store.as_ref());
            Command::new(program)
                .args(args)
                .current_dir(workdir)
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(stderr)
                .kill_on_drop(true)
                .spawn()
        };
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(task, error = %e, "Failed to spawn task");
                sink.append(&format!("Failed to start `{}`: {}\n", argv.join(" "), e))?;
                return Ok(TaskOutcome::Failed(Termination::NotStarted));
            }
        };

        let mut tail = LogTail::new(log_path);
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = poll.tick() => tail.drain(sink, false).await?,
            }
        };
        tail.drain(sink, true).await?;

        let termination = Termination::from(status);
        let outcome = TaskOutcome::classify(termination);
        tracing::info!(task, termination = %termination, success = outcome.is_success(), "Task finished");
        Ok(outcome)
    }
}

/// Incremental reader of a growing log file.
struct LogTail {
    path: PathBuf,
    offset: u64,
    /// Bytes of a multi-byte character cut off by the last read.
    partial: Vec<u8>,
}

impl LogTail {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            partial: Vec::new(),
        }
    }

    async fn read_new(&mut self) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        self.offset += bytes.len() as u64;
        Ok(bytes)
    }

    /// Forward unread output to `sink`. `last` also flushes a cut-off tail.
    async fn drain(&mut self, sink: &dyn LogSink, last: bool) -> Result<()> {
        match self.read_new().await {
            Ok(bytes) => self.partial.extend_from_slice(&bytes),
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "Skipping log read");
                if !last {
                    return Ok(());
                }
            }
        }
        let text = take_text(&mut self.partial, last);
        if !text.is_empty() {
            sink.append(&text)?;
        }
        Ok(())
    }
}

/// Decode `buf` as UTF-8, dropping invalid sequences.
///
/// An incomplete sequence at the end stays in `buf` unless `flush` is set.
fn take_text(buf: &mut Vec<u8>, flush: bool) -> String {
    let mut text = String::new();
    let mut rest: &[u8] = buf;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                rest = &[];
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                if let Ok(valid) = std::str::from_utf8(valid) {
                    text.push_str(valid);
                }
                match e.error_len() {
                    Some(len) => rest = &after[len..],
                    None => {
                        rest = if flush { &[] } else { after };
                        break;
                    }
                }
            }
        }
    }
    let remainder = rest.to_vec();
    *buf = remainder;
    text
}
