//! Spoken greetings.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

/// How long one utterance may run before the speech process is killed.
pub const DEFAULT_SPEECH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum SpeechError {
    #[error("failed to start speech command {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("speech command {program} exited with {status}")]
    Exit {
        program: String,
        status: std::process::ExitStatus,
    },
    #[error("speech command {program} still running after {after:?}, killed")]
    Timeout { program: String, after: Duration },
}

/// Something that can say a line of text out loud.
#[async_trait]
pub trait Speaker: Send + Sync {
    async fn speak(&self, text: &str) -> Result<(), SpeechError>;
}

/// Speaks by running `<program> -v <voice> <text>` (espeak-ng, macOS `say`).
pub struct CommandSpeaker {
    program: String,
    voice: String,
    timeout: Duration,
}

impl CommandSpeaker {
    pub fn new(program: impl Into<String>, voice: impl Into<String>) -> Self {
        Self { program: program.into(), voice: voice.into(), timeout: DEFAULT_SPEECH_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Speaker for CommandSpeaker {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        tracing::debug!(program = %self.program, voice = %self.voice, text, "speaking");
        let run = Command::new(&self.program)
            .arg("-v")
            .arg(&self.voice)
            .arg(text)
            .kill_on_drop(true)
            .status();
        // Dropping `run` on timeout kills the child.
        let status = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| SpeechError::Timeout { program: self.program.clone(), after: self.timeout })?
            .map_err(|source| SpeechError::Spawn { program: self.program.clone(), source })?;

        if !status.success() {
            return Err(SpeechError::Exit { program: self.program.clone(), status });
        }
        Ok(())
    }
}

/// Plays one line at a time: concurrent callers wait for the current line
/// to finish instead of talking over it.
pub struct SerialSpeaker<S> {
    inner: S,
    turn: Mutex<()>,
}

impl<S: Speaker> SerialSpeaker<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, turn: Mutex::new(()) }
    }
}

#[async_trait]
impl<S: Speaker> Speaker for SerialSpeaker<S> {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        let _turn = self.turn.lock().await;
        self.inner.speak(text).await
    }
}

/// Used when speech is disabled: the line only reaches the log.
pub struct LogSpeaker;

#[async_trait]
impl Speaker for LogSpeaker {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        tracing::info!(text, "greeting (speech disabled)");
        Ok(())
    }
}

/// Fill `{name}` in a greeting template.
pub fn render(template: &str, name: &str) -> String {
    template.replace("{name}", name)
}
