use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AudioSource, Extraction, ExtractionOutcome, Strategy};
use crate::error::{ResolveError, Unavailability};
use crate::metadata::PartialMetadata;
use crate::reference::VideoReference;

/// Full extraction through a yt-dlp compatible command line. The same driver
/// backs both the native binary and the Python module, which fail for
/// different reasons often enough to be worth trying separately.
#[derive(Debug, Clone)]
pub struct YtDlpStrategy {
    name: String,
    program: PathBuf,
    base_args: Vec<String>,
    cookies: Option<PathBuf>,
}

/// Subset of `yt-dlp --dump-single-json`. Everything is optional because
/// older uploads routinely lack fields.
#[derive(Debug, Deserialize)]
struct InfoJson {
    title: Option<String>,
    fulltitle: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    description: Option<String>,
    view_count: Option<u64>,
}

impl InfoJson {
    fn into_partial(self) -> PartialMetadata {
        PartialMetadata {
            title: self.title.or(self.fulltitle),
            duration_seconds: self
                .duration
                .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
                .map(|seconds| seconds.round() as u64),
            thumbnail_url: self.thumbnail,
            author: self.uploader.or(self.channel),
            description: self.description,
            view_count: self.view_count,
        }
    }
}

impl YtDlpStrategy {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            base_args,
            cookies: None,
        }
    }

    /// Native `yt-dlp` executable.
    pub fn binary(program: impl Into<PathBuf>) -> Self {
        Self::new("yt-dlp", program, Vec::new())
    }

    /// `python3 -m yt_dlp`, a separate code path from the bundled binary.
    pub fn python_module(python: impl Into<PathBuf>) -> Self {
        Self::new(
            "python-yt-dlp",
            python,
            vec!["-m".to_string(), "yt_dlp".to_string()],
        )
    }

    pub fn with_cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.base_args);
        if let Some(cookies) = self.cookies.as_ref().filter(|path| path.exists()) {
            command.arg("--cookies").arg(cookies);
        }
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    fn spawn_error(&self, err: std::io::Error) -> ResolveError {
        if err.kind() == ErrorKind::NotFound {
            ResolveError::UpstreamUnavailable(format!(
                "{} is not installed ({})",
                self.name,
                self.program.display()
            ))
        } else {
            ResolveError::UpstreamUnavailable(format!("starting {}: {err}", self.name))
        }
    }

    async fn fetch_info(&self, reference: &VideoReference) -> Result<InfoJson, ResolveError> {
        let output = self
            .command()
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg(reference.watch_url())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| self.spawn_error(err))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(strategy = %self.name, status = %output.status, %stderr, "metadata command failed");
            return Err(classify_failure(&stderr));
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn open_audio(&self, reference: &VideoReference) -> Result<AudioSource, ResolveError> {
        let child = self
            .command()
            .arg("--format")
            .arg("bestaudio/best")
            .arg("--output")
            .arg("-")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--quiet")
            .arg(reference.watch_url())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| self.spawn_error(err))?;
        AudioSource::from_child(self.name.clone(), child)
    }

    /// Only hands out a source that has produced its first bytes; a download
    /// that dies at once (expired media URL, HTTP 403) is not a stream.
    async fn open_primed_audio(&self, reference: &VideoReference) -> Result<AudioSource, ResolveError> {
        let mut audio = self.open_audio(reference)?;
        audio.prime().await?;
        Ok(audio)
    }
}

#[async_trait]
impl Strategy for YtDlpStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn supplies_stream(&self) -> bool {
        true
    }

    async fn attempt(&self, reference: &VideoReference, want_stream: bool) -> ExtractionOutcome {
        let metadata = self.fetch_info(reference).await?.into_partial();
        if !want_stream {
            return Ok(Extraction::metadata_only(metadata));
        }

        // Metadata is still useful when no audio comes out, so this is
        // reported as a metadata-only success and the chain keeps looking.
        match self.open_primed_audio(reference).await {
            Ok(audio) => Ok(Extraction {
                metadata,
                audio: Some(audio),
            }),
            Err(err) => {
                warn!(strategy = %self.name, error = %err, "audio stream unavailable");
                Ok(Extraction::metadata_only(metadata))
            }
        }
    }
}

/// Maps extractor stderr onto the error taxonomy. Only messages that mean the
/// video itself is inaccessible become [`ResolveError::VideoUnavailable`].
pub fn classify_failure(stderr: &str) -> ResolveError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("private video") || lowered.contains("video is private") {
        return ResolveError::VideoUnavailable(Unavailability::Private);
    }
    if lowered.contains("confirm your age") || lowered.contains("age-restricted") {
        return ResolveError::VideoUnavailable(Unavailability::AgeRestricted);
    }
    if lowered.contains("video unavailable")
        || lowered.contains("has been removed")
        || lowered.contains("no longer available")
    {
        return ResolveError::VideoUnavailable(Unavailability::Removed);
    }
    if lowered.contains("http error 429")
        || lowered.contains("timed out")
        || lowered.contains("unable to download")
        || lowered.contains("urlopen error")
        || lowered.contains("connection refused")
        || lowered.contains("connection reset")
        || lowered.contains("network is unreachable")
        || lowered.contains("name resolution")
    {
        return ResolveError::UpstreamUnavailable(last_line(stderr));
    }
    ResolveError::Extraction(last_line(stderr))
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("extractor failed without output")
        .to_string()
}
