//! Child-process plumbing for one engine instance: framing, reader threads,
//! a serialized stdin writer and the raw transcript.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::error::SessionError;
use crate::sync_utils::lock_or_recover;
use crate::transcript::{Transcript, TranscriptDirection, TranscriptEntry, TranscriptStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// Receives raw lines from the reader threads.
pub trait ConversationListener: Send + Sync {
    fn on_line(&self, stream: TranscriptStream, line: &str);
    fn on_stream_closed(&self, stream: TranscriptStream);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Exited on its own within the grace period.
    Graceful(Option<i32>),
    /// Killed after the grace period elapsed.
    Forced(Option<i32>),
    /// Already reaped before shutdown was requested.
    AlreadyExited,
}

impl ShutdownOutcome {
    pub fn is_graceful(self) -> bool {
        !matches!(self, Self::Forced(_))
    }

    pub fn exit_code(self) -> Option<i32> {
        match self {
            Self::Graceful(code) | Self::Forced(code) => code,
            Self::AlreadyExited => None,
        }
    }
}

/// Output pipes taken from a freshly spawned child, handed to
/// [`ProcessConversation::attach`] once a listener exists.
#[derive(Debug)]
pub struct ConversationOutput {
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

#[derive(Debug)]
pub struct ProcessConversation {
    label: String,
    pid: u32,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    transcript: Arc<Mutex<Transcript>>,
}

impl ProcessConversation {
    pub fn spawn(
        label: &str,
        spec: &LaunchSpec,
    ) -> Result<(Self, ConversationOutput), SessionError> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        if let Some(directory) = spec.working_directory.as_ref() {
            command.current_dir(directory);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|error| {
            if error.kind() == io::ErrorKind::NotFound {
                SessionError::EngineNotFound(format!(
                    "{} could not be executed: {error}",
                    spec.program.display()
                ))
            } else {
                SessionError::SpawnFailed {
                    path: spec.program.display().to_string(),
                    reason: error.to_string(),
                }
            }
        })?;

        let output = ConversationOutput {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };
        let stdin = child.stdin.take();
        let pid = child.id();
        tracing::debug!(label, pid, program = %spec.program.display(), "spawned engine process");

        let mut transcript = Transcript::default();
        transcript.record(
            TranscriptDirection::System,
            TranscriptStream::System,
            format!("started {} (pid {pid})", spec.program.display()).as_str(),
        );
        Ok((
            Self {
                label: label.to_string(),
                pid,
                child: Mutex::new(Some(child)),
                stdin: Mutex::new(stdin),
                transcript: Arc::new(Mutex::new(transcript)),
            },
            output,
        ))
    }

    /// Starts one reader thread per output stream.
    pub fn attach(&self, output: ConversationOutput, listener: Weak<dyn ConversationListener>) {
        if let Some(stdout) = output.stdout {
            self.spawn_reader(TranscriptStream::Stdout, stdout, listener.clone());
        }
        if let Some(stderr) = output.stderr {
            self.spawn_reader(TranscriptStream::Stderr, stderr, listener);
        }
    }

    fn spawn_reader<R>(
        &self,
        stream: TranscriptStream,
        reader: R,
        listener: Weak<dyn ConversationListener>,
    ) where
        R: Read + Send + 'static,
    {
        let transcript = Arc::clone(&self.transcript);
        let thread_name = format!(
            "kalix-{}-{}",
            self.label,
            stream.label().to_ascii_lowercase()
        );
        let spawned = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut buffered = BufReader::new(reader);
                let mut line = String::new();
                loop {
                    line.clear();
                    match buffered.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            let trimmed = line.trim_end_matches(['\n', '\r']);
                            if trimmed.trim().is_empty() {
                                continue;
                            }
                            lock_or_recover(&transcript).record(
                                TranscriptDirection::EngineToController,
                                stream,
                                trimmed,
                            );
                            let Some(listener) = listener.upgrade() else {
                                return;
                            };
                            listener.on_line(stream, trimmed);
                        }
                        Err(error) => {
                            lock_or_recover(&transcript).record(
                                TranscriptDirection::System,
                                TranscriptStream::System,
                                format!("{} reader failed: {error}", stream.label()).as_str(),
                            );
                            break;
                        }
                    }
                }
                if let Some(listener) = listener.upgrade() {
                    listener.on_stream_closed(stream);
                }
            });
        if let Err(error) = spawned {
            tracing::error!(label = %self.label, %error, "failed to start engine reader thread");
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Writes one framed line. The stdin lock is held across the write, flush
    /// and transcript append, so concurrent callers never interleave.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut stdin = lock_or_recover(&self.stdin);
        let Some(pipe) = stdin.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "engine stdin is closed",
            ));
        };
        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');
        pipe.write_all(framed.as_bytes())?;
        pipe.flush()?;
        lock_or_recover(&self.transcript).record(
            TranscriptDirection::ControllerToEngine,
            TranscriptStream::Stdin,
            line,
        );
        Ok(())
    }

    /// Sends `farewell`, closes stdin and waits up to `grace` before killing.
    pub fn shutdown(&self, farewell: &str, grace: Duration) -> ShutdownOutcome {
        if let Err(error) = self.write_line(farewell) {
            tracing::debug!(label = %self.label, %error, "engine did not accept shutdown request");
        }
        lock_or_recover(&self.stdin).take();

        let Some(mut child) = lock_or_recover(&self.child).take() else {
            return ShutdownOutcome::AlreadyExited;
        };
        match child.wait_timeout(grace) {
            Ok(Some(status)) => ShutdownOutcome::Graceful(status.code()),
            Ok(None) => {
                tracing::warn!(
                    label = %self.label,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "engine ignored shutdown request; killing"
                );
                ShutdownOutcome::Forced(kill_and_reap(&mut child))
            }
            Err(error) => {
                tracing::warn!(label = %self.label, %error, "failed to wait for engine exit; killing");
                ShutdownOutcome::Forced(kill_and_reap(&mut child))
            }
        }
    }

    /// Collects the exit status after the engine closed its stdout, killing it
    /// if it is still alive after `timeout`.
    pub fn reap(&self, timeout: Duration) -> Option<ExitStatus> {
        lock_or_recover(&self.stdin).take();
        let mut child = lock_or_recover(&self.child).take()?;
        match child.wait_timeout(timeout) {
            Ok(Some(status)) => Some(status),
            Ok(None) | Err(_) => {
                let _ = child.kill();
                child.wait().ok()
            }
        }
    }

    pub fn kill(&self) {
        lock_or_recover(&self.stdin).take();
        if let Some(mut child) = lock_or_recover(&self.child).take() {
            kill_and_reap(&mut child);
        }
    }

    pub fn is_alive(&self) -> bool {
        match lock_or_recover(&self.child).as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn record_system(&self, message: &str) {
        lock_or_recover(&self.transcript).record(
            TranscriptDirection::System,
            TranscriptStream::System,
            message,
        );
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        lock_or_recover(&self.transcript).entries().to_vec()
    }

    pub fn clear_transcript(&self) {
        lock_or_recover(&self.transcript).clear();
    }
}

fn kill_and_reap(child: &mut Child) -> Option<i32> {
    let _ = child.kill();
    child.wait().ok().and_then(|status| status.code())
}

pub fn describe_exit(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => match status.code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        },
        None => "exit status unavailable".to_string(),
    }
}
