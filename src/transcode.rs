#![forbid(unsafe_code)]

//! Thin wrapper around an ffmpeg process: maps the requested quality and
//! format onto encoder arguments and pipes audio through it as it arrives.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use axum::body::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, timeout_at};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::ResolveError;
use crate::reference::VideoReference;
use crate::strategy::AudioSource;

const STDERR_LIMIT: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Quality {
    #[serde(rename = "128")]
    Kbps128,
    #[default]
    #[serde(rename = "192")]
    Kbps192,
    #[serde(rename = "320")]
    Kbps320,
}

impl Quality {
    /// Unknown or missing values fall back to the default instead of failing.
    pub fn parse_or_default(value: Option<&str>) -> Self {
        match value.map(|raw| raw.trim().trim_end_matches(['k', 'K'])) {
            Some("128") => Self::Kbps128,
            Some("192") => Self::Kbps192,
            Some("320") => Self::Kbps320,
            _ => Self::default(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kbps128 => "128",
            Self::Kbps192 => "192",
            Self::Kbps320 => "320",
        }
    }

    pub fn bitrate(self) -> &'static str {
        match self {
            Self::Kbps128 => "128k",
            Self::Kbps192 => "192k",
            Self::Kbps320 => "320k",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    M4a,
    Wav,
}

impl AudioFormat {
    /// Unknown or missing values fall back to the default instead of failing.
    pub fn parse_or_default(value: Option<&str>) -> Self {
        match value.map(|raw| raw.trim().trim_start_matches('.').to_ascii_lowercase()) {
            Some(raw) if raw == "mp3" => Self::Mp3,
            Some(raw) if raw == "m4a" => Self::M4a,
            Some(raw) if raw == "wav" => Self::Wav,
            _ => Self::default(),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::Wav => "wav",
        }
    }

    pub fn codec(self) -> &'static str {
        match self {
            Self::Mp3 => "libmp3lame",
            Self::M4a => "aac",
            Self::Wav => "pcm_s16le",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::M4a => "audio/mp4",
            Self::Wav => "audio/wav",
        }
    }

    /// Muxer arguments. MP4 needs fragmented output to be written to a pipe.
    fn muxer_args(self) -> &'static [&'static str] {
        match self {
            Self::Mp3 => &["-f", "mp3"],
            Self::M4a => &["-f", "ipod", "-movflags", "+frag_keyframe+empty_moov"],
            Self::Wav => &["-f", "wav"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub reference: VideoReference,
    pub quality: Quality,
    pub format: AudioFormat,
}

impl ConversionRequest {
    pub fn new(reference: VideoReference, quality: Option<&str>, format: Option<&str>) -> Self {
        Self {
            reference,
            quality: Quality::parse_or_default(quality),
            format: AudioFormat::parse_or_default(format),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    global_args: Vec<String>,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            global_args: Vec::new(),
        }
    }

    /// Arguments placed before the generated ones (e.g. `-threads 2`).
    pub fn with_global_args(mut self, args: Vec<String>) -> Self {
        self.global_args = args;
        self
    }

    fn arguments(&self, quality: Quality, format: AudioFormat) -> Vec<String> {
        let mut args = self.global_args.clone();
        args.extend(
            ["-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-vn"]
                .map(String::from),
        );
        args.push("-c:a".into());
        args.push(format.codec().into());
        if format != AudioFormat::Wav {
            args.push("-b:a".into());
            args.push(quality.bitrate().into());
        }
        args.extend(format.muxer_args().iter().map(|arg| arg.to_string()));
        args.push("pipe:1".into());
        args
    }

    /// Starts converting `source` and waits for the first encoded chunk, so a
    /// transcoder that fails on startup is reported before anything is sent.
    /// Waiting past `deadline` is a [`ResolveError::Timeout`]; both processes
    /// are killed when that happens.
    pub async fn transcode(
        &self,
        source: AudioSource,
        quality: Quality,
        format: AudioFormat,
        deadline: Instant,
    ) -> Result<TranscodedAudio, ResolveError> {
        let started = Instant::now();
        let label = self.program.display().to_string();
        debug!(transcoder = %label, source = source.label(), codec = format.codec(), bitrate = quality.bitrate(), "starting transcode");

        let mut child = Command::new(&self.program)
            .args(self.arguments(quality, format))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ResolveError::TranscodeFailed(format!("starting {label}: {err}")))?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ResolveError::TranscodeFailed(format!(
                "{label} was started without pipes"
            )));
        };

        let feeder = AbortOnDrop(tokio::spawn(async move {
            let mut source = source;
            let copied = tokio::io::copy(&mut source, &mut stdin).await;
            let _ = stdin.shutdown().await;
            drop(stdin);
            match copied {
                Ok(_) => source.finish().await,
                Err(err) => Err(ResolveError::TranscodeFailed(format!(
                    "writing to transcoder: {err}"
                ))),
            }
        }));
        let stderr = AbortOnDrop(tokio::spawn(async move {
            let mut stderr = stderr;
            let mut raw = Vec::new();
            let _ = (&mut stderr).take(STDERR_LIMIT).read_to_end(&mut raw).await;
            // Keep the pipe empty so a chatty transcoder never blocks on it.
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
            String::from_utf8_lossy(&raw).into_owned()
        }));

        let mut pipe = Pipe {
            label,
            child,
            stdout: ReaderStream::new(stdout),
            stderr,
            feeder,
            finished: false,
        };

        let first = match timeout_at(deadline, pipe.next_chunk()).await {
            Ok(first) => first,
            Err(_) => {
                return Err(ResolveError::Timeout(
                    deadline.saturating_duration_since(started),
                ));
            }
        };
        match first {
            Some(Ok(first)) => Ok(TranscodedAudio { first, pipe }),
            Some(Err(err)) => Err(err),
            None => Err(ResolveError::TranscodeFailed(format!(
                "{} produced no output",
                pipe.label
            ))),
        }
    }
}

/// Encoded audio whose first chunk is already in hand.
pub struct TranscodedAudio {
    first: Bytes,
    pipe: Pipe,
}

impl TranscodedAudio {
    /// Byte stream suitable for a streaming response body. A failure after the
    /// first chunk surfaces as a stream error so the transport aborts the
    /// response instead of completing it. Dropping the stream kills the
    /// transcoder and the source.
    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        let Self { first, pipe } = self;
        let head = stream::once(async move { Ok(first) });
        let tail = stream::unfold(pipe, |mut pipe| async move {
            let item = pipe.next_chunk().await?;
            Some((item.map_err(io::Error::other), pipe))
        });
        head.chain(tail).boxed()
    }
}

struct Pipe {
    label: String,
    child: Child,
    stdout: ReaderStream<ChildStdout>,
    stderr: AbortOnDrop<String>,
    feeder: AbortOnDrop<Result<(), ResolveError>>,
    finished: bool,
}

impl Pipe {
    async fn next_chunk(&mut self) -> Option<Result<Bytes, ResolveError>> {
        if self.finished {
            return None;
        }
        match self.stdout.next().await {
            Some(Ok(chunk)) => Some(Ok(chunk)),
            Some(Err(err)) => {
                self.finished = true;
                Some(Err(ResolveError::TranscodeFailed(format!(
                    "reading {} output: {err}",
                    self.label
                ))))
            }
            None => {
                self.finished = true;
                self.finish().await.err().map(Err)
            }
        }
    }

    async fn finish(&mut self) -> Result<(), ResolveError> {
        let status = self.child.wait().await.map_err(|err| {
            ResolveError::TranscodeFailed(format!("waiting for {}: {err}", self.label))
        })?;
        if !status.success() {
            let stderr = self.stderr.join().await.unwrap_or_default();
            return Err(ResolveError::TranscodeFailed(format!(
                "{} exited with {status}: {}",
                self.label,
                stderr.trim()
            )));
        }
        match self.feeder.join().await {
            Ok(result) => result,
            Err(err) => Err(ResolveError::TranscodeFailed(format!(
                "feeding {}: {err}",
                self.label
            ))),
        }
    }
}

/// Aborts the task when dropped, so an abandoned response does not leave a
/// feeder blocked on a stalled source.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    async fn join(&mut self) -> Result<T, JoinError> {
        (&mut self.0).await
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_and_format_fall_back_to_defaults() {
        assert_eq!(Quality::parse_or_default(None), Quality::Kbps192);
        assert_eq!(Quality::parse_or_default(Some("999")), Quality::Kbps192);
        assert_eq!(Quality::parse_or_default(Some("")), Quality::Kbps192);
        assert_eq!(Quality::parse_or_default(Some("320")), Quality::Kbps320);
        assert_eq!(Quality::parse_or_default(Some("128k")), Quality::Kbps128);
        assert_eq!(AudioFormat::parse_or_default(None), AudioFormat::Mp3);
        assert_eq!(AudioFormat::parse_or_default(Some("flac")), AudioFormat::Mp3);
        assert_eq!(AudioFormat::parse_or_default(Some("M4A")), AudioFormat::M4a);
        assert_eq!(AudioFormat::parse_or_default(Some(".wav")), AudioFormat::Wav);
    }

    #[test]
    fn lookup_tables_match_encoder_names() {
        assert_eq!(Quality::Kbps128.bitrate(), "128k");
        assert_eq!(Quality::Kbps192.bitrate(), "192k");
        assert_eq!(Quality::Kbps320.bitrate(), "320k");
        assert_eq!(AudioFormat::Mp3.codec(), "libmp3lame");
        assert_eq!(AudioFormat::M4a.codec(), "aac");
        assert_eq!(AudioFormat::Wav.codec(), "pcm_s16le");
        assert_eq!(AudioFormat::Mp3.mime_type(), "audio/mpeg");
        assert_eq!(
            serde_json::to_value(Quality::Kbps320).unwrap(),
            serde_json::json!("320")
        );
        assert_eq!(
            serde_json::to_value(AudioFormat::M4a).unwrap(),
            serde_json::json!("m4a")
        );
    }

    #[test]
    fn builds_ffmpeg_arguments() {
        let args = FfmpegTranscoder::default().arguments(Quality::Kbps320, AudioFormat::Mp3);
        let joined = args.join(" ");
        assert!(joined.contains("-i pipe:0"));
        assert!(joined.contains("-c:a libmp3lame"));
        assert!(joined.contains("-b:a 320k"));
        assert!(joined.ends_with("-f mp3 pipe:1"));

        let wav = FfmpegTranscoder::default()
            .arguments(Quality::Kbps128, AudioFormat::Wav)
            .join(" ");
        assert!(wav.contains("-c:a pcm_s16le"));
        assert!(!wav.contains("-b:a"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn shell(script: &str) -> FfmpegTranscoder {
            FfmpegTranscoder::new("sh").with_global_args(vec![
                "-c".into(),
                script.into(),
                "ffmpeg".into(),
            ])
        }

        fn soon() -> Instant {
            Instant::now() + std::time::Duration::from_secs(10)
        }

        fn memory_source(bytes: &'static [u8]) -> AudioSource {
            AudioSource::from_reader("memory", std::io::Cursor::new(bytes.to_vec()))
        }

        async fn collect(audio: TranscodedAudio) -> (Vec<u8>, Option<io::Error>) {
            let mut stream = audio.into_stream();
            let mut bytes = Vec::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => bytes.extend_from_slice(&chunk),
                    Err(err) => return (bytes, Some(err)),
                }
            }
            (bytes, None)
        }

        #[tokio::test]
        async fn pipes_source_through_the_transcoder() {
            let audio = shell("cat")
                .transcode(memory_source(b"raw audio"), Quality::Kbps192, AudioFormat::Mp3, soon())
                .await
                .unwrap();
            let (bytes, err) = collect(audio).await;
            assert_eq!(bytes, b"raw audio");
            assert!(err.is_none());
        }

        #[tokio::test]
        async fn startup_failure_is_reported_before_streaming() {
            let err = shell("cat >/dev/null; echo 'Unknown encoder' >&2; exit 1")
                .transcode(memory_source(b"raw"), Quality::Kbps192, AudioFormat::Mp3, soon())
                .await
                .err()
                .expect("transcode should fail");
            match err {
                ResolveError::TranscodeFailed(message) => {
                    assert!(message.contains("Unknown encoder"), "{message}")
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn missing_transcoder_fails() {
            let err = FfmpegTranscoder::new("/nonexistent/ffmpeg-for-tests")
                .transcode(memory_source(b"raw"), Quality::Kbps192, AudioFormat::Mp3, soon())
                .await
                .err()
                .expect("transcode should fail");
            assert!(matches!(err, ResolveError::TranscodeFailed(_)));
        }

        #[tokio::test]
        async fn late_failure_aborts_the_stream() {
            let audio = shell("printf head; cat >/dev/null; exit 1")
                .transcode(memory_source(b"raw"), Quality::Kbps192, AudioFormat::Mp3, soon())
                .await
                .unwrap();
            let (bytes, err) = collect(audio).await;
            assert_eq!(bytes, b"head");
            assert!(err.is_some());
        }

        #[tokio::test]
        async fn failing_source_aborts_the_stream() {
            let child = Command::new("sh")
                .args(["-c", "printf data; exit 2"])
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .unwrap();
            let source = AudioSource::from_child("source", child).unwrap();
            let audio = shell("cat")
                .transcode(source, Quality::Kbps192, AudioFormat::Mp3, soon())
                .await
                .unwrap();
            let (bytes, err) = collect(audio).await;
            assert_eq!(bytes, b"data");
            assert!(err.is_some());
        }

        #[tokio::test]
        async fn stalled_source_times_out_before_streaming() {
            let (reader, writer) = tokio::io::duplex(64);
            // The writer stays open, so the transcoder never sees input or EOF.
            let _writer = writer;
            let source = AudioSource::from_reader("stalled", reader);
            let started = Instant::now();
            let err = shell("cat")
                .transcode(
                    source,
                    Quality::Kbps192,
                    AudioFormat::Mp3,
                    Instant::now() + std::time::Duration::from_millis(200),
                )
                .await
                .err()
                .expect("transcode should time out");
            assert!(matches!(err, ResolveError::Timeout(_)), "{err:?}");
            assert!(started.elapsed() < std::time::Duration::from_secs(5));
        }

        #[tokio::test]
        async fn chatty_stderr_does_not_block_the_transcoder() {
            let transcoder =
                shell("head -c 1000000 /dev/zero | tr '\\0' x >&2; cat; echo done >&2; exit 1");
            let result = tokio::time::timeout(
                std::time::Duration::from_secs(10),
                transcoder.transcode(memory_source(b"raw"), Quality::Kbps192, AudioFormat::Mp3, soon()),
            )
            .await
            .expect("transcoder should not stall on stderr");
            let (bytes, err) = collect(result.unwrap()).await;
            assert_eq!(bytes, b"raw");
            assert!(err.is_some());
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn dropping_the_stream_kills_transcoder_and_source() {
            let temp = tempfile::tempdir().unwrap();
            let source_pid = temp.path().join("source.pid");
            let transcoder_pid = temp.path().join("transcoder.pid");

            let child = Command::new("sh")
                .arg("-c")
                .arg(format!("echo $$ > '{}'; exec yes", source_pid.display()))
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .unwrap();
            let source = AudioSource::from_child("yes", child).unwrap();
            let audio = shell(&format!(
                "echo $$ > '{}'; exec cat",
                transcoder_pid.display()
            ))
            .transcode(source, Quality::Kbps192, AudioFormat::Mp3, soon())
            .await
            .unwrap();

            let mut stream = audio.into_stream();
            let chunk = stream.next().await.unwrap().unwrap();
            assert!(!chunk.is_empty());

            let pids = [&source_pid, &transcoder_pid].map(|path| {
                std::fs::read_to_string(path)
                    .unwrap()
                    .trim()
                    .parse::<u32>()
                    .unwrap()
            });
            for pid in pids {
                assert!(is_running(pid), "pid {pid} should be running");
            }

            drop(stream);

            for pid in pids {
                let mut gone = false;
                for _ in 0..100 {
                    if !is_running(pid) {
                        gone = true;
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                assert!(gone, "pid {pid} survived the dropped stream");
            }
        }

        /// Zombies count as gone: they were killed, only reaping is pending.
        #[cfg(target_os = "linux")]
        fn is_running(pid: u32) -> bool {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Ok(stat) => stat
                    .rsplit_once(") ")
                    .and_then(|(_, rest)| rest.chars().next())
                    .is_some_and(|state| state != 'Z' && state != 'X'),
                Err(_) => false,
            }
        }
    }
}
