#![forbid(unsafe_code)]

//! Independent ways of turning a [`VideoReference`] into metadata and, for
//! some of them, a raw audio source.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::process::ExitStatus;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::Child;

use crate::error::ResolveError;
use crate::metadata::PartialMetadata;
use crate::reference::VideoReference;

mod fallback;
mod oembed;
mod ytdlp;

pub use fallback::IdentifierFallback;
pub use oembed::{DEFAULT_OEMBED_ENDPOINT, OEmbedStrategy};
pub use ytdlp::{YtDlpStrategy, classify_failure};

const PRIME_CHUNK: usize = 16 * 1024;

/// Result of a single strategy attempt.
pub type ExtractionOutcome = Result<Extraction, ResolveError>;

/// What a successful attempt produced. `audio` is only ever set by strategies
/// that report [`Strategy::supplies_stream`] and only when a stream was asked for.
#[derive(Debug, Default)]
pub struct Extraction {
    pub metadata: PartialMetadata,
    pub audio: Option<AudioSource>,
}

impl Extraction {
    pub fn metadata_only(metadata: PartialMetadata) -> Self {
        Self {
            metadata,
            audio: None,
        }
    }
}

#[async_trait]
pub trait Strategy: Send + Sync {
    /// Name used in logs and reported back to callers.
    fn name(&self) -> &str;

    /// Whether this strategy can ever hand out a raw audio source.
    fn supplies_stream(&self) -> bool;

    /// One bounded attempt. Strategies never retry internally.
    async fn attempt(&self, reference: &VideoReference, want_stream: bool) -> ExtractionOutcome;
}

/// Raw (not yet transcoded) audio bytes. When backed by a child process the
/// process is killed if the source is dropped before it finishes.
pub struct AudioSource {
    label: String,
    reader: Pin<Box<dyn AsyncRead + Send>>,
    process: Option<Child>,
}

impl AudioSource {
    pub fn from_reader(label: impl Into<String>, reader: impl AsyncRead + Send + 'static) -> Self {
        Self {
            label: label.into(),
            reader: Box::pin(reader),
            process: None,
        }
    }

    /// Wraps a spawned child whose stdout carries the audio. The child must
    /// have been spawned with a piped stdout and `kill_on_drop(true)`.
    pub fn from_child(label: impl Into<String>, mut child: Child) -> Result<Self, ResolveError> {
        let label = label.into();
        let stdout = child.stdout.take().ok_or_else(|| {
            ResolveError::UpstreamUnavailable(format!("{label} has no stdout to stream from"))
        })?;
        Ok(Self {
            label,
            reader: Box::pin(stdout),
            process: Some(child),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Waits for the first bytes and keeps them for the reader, so a source
    /// that dies before producing audio is caught while other strategies can
    /// still be tried.
    pub async fn prime(&mut self) -> Result<(), ResolveError> {
        let mut head = vec![0; PRIME_CHUNK];
        let read = self.reader.read(&mut head).await.map_err(|err| {
            ResolveError::UpstreamUnavailable(format!("reading {}: {err}", self.label))
        })?;
        if read == 0 {
            if let Some(child) = self.process.as_mut()
                && let Ok(status) = child.wait().await
            {
                ensure_success(&self.label, status)?;
            }
            return Err(ResolveError::UpstreamUnavailable(format!(
                "{} produced no audio",
                self.label
            )));
        }
        head.truncate(read);
        let rest = std::mem::replace(&mut self.reader, Box::pin(tokio::io::empty()));
        self.reader = Box::pin(io::Cursor::new(head).chain(rest));
        Ok(())
    }

    /// Waits for the backing process (if any) after its output was consumed,
    /// turning an unclean exit into an error so truncated audio is not
    /// mistaken for a complete file.
    pub async fn finish(mut self) -> Result<(), ResolveError> {
        let Some(mut child) = self.process.take() else {
            return Ok(());
        };
        let status = child.wait().await.map_err(|err| {
            ResolveError::UpstreamUnavailable(format!("waiting for {}: {err}", self.label))
        })?;
        ensure_success(&self.label, status)
    }
}

fn ensure_success(label: &str, status: ExitStatus) -> Result<(), ResolveError> {
    if status.success() {
        Ok(())
    } else {
        Err(ResolveError::UpstreamUnavailable(format!(
            "{label} exited with {status}"
        )))
    }
}

impl AsyncRead for AudioSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.reader.as_mut().poll_read(cx, buf)
    }
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSource")
            .field("label", &self.label)
            .field("process", &self.process.as_ref().and_then(Child::id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reader_backed_source_streams_and_finishes() {
        let mut source = AudioSource::from_reader("memory", std::io::Cursor::new(b"abc".to_vec()));
        let mut out = Vec::new();
        source.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
        assert_eq!(source.label(), "memory");
        source.finish().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_backed_source_reports_unclean_exit() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "printf partial; exit 3"])
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut source = AudioSource::from_child("sh", child).unwrap();
        let mut out = Vec::new();
        source.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"partial");
        let err = source.finish().await.unwrap_err();
        assert!(matches!(err, ResolveError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn primed_source_replays_the_first_chunk() {
        let mut source =
            AudioSource::from_reader("memory", std::io::Cursor::new(b"first and rest".to_vec()));
        source.prime().await.unwrap();
        let mut out = Vec::new();
        source.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"first and rest");
    }

    #[tokio::test]
    async fn empty_source_fails_to_prime() {
        let mut source = AudioSource::from_reader("empty", tokio::io::empty());
        let err = source.prime().await.unwrap_err();
        assert!(err.to_string().contains("produced no audio"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_child_fails_to_prime_with_its_exit_status() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "exit 1"])
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut source = AudioSource::from_child("sh", child).unwrap();
        let err = source.prime().await.unwrap_err();
        assert!(matches!(err, ResolveError::UpstreamUnavailable(_)));
        assert!(err.to_string().contains("exited with"), "{err}");
    }
}
