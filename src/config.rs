#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::ValueEnum;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::pipeline::Resolver;
use crate::strategy::{DEFAULT_OEMBED_ENDPOINT, OEmbedStrategy, Strategy, YtDlpStrategy};
use crate::transcode::FfmpegTranscoder;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YT_DLP: &str = "yt-dlp";
pub const DEFAULT_PYTHON: &str = "python3";
pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Whether `/convert` may stream audio itself or always hands out links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ConvertMode {
    #[default]
    Stream,
    Links,
}

impl ConvertMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stream" => Some(Self::Stream),
            "links" => Some(Self::Links),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub www_root: Option<PathBuf>,
    pub yt_dlp: PathBuf,
    pub python: PathBuf,
    pub ffmpeg: PathBuf,
    pub cookies: Option<PathBuf>,
    pub oembed_endpoint: String,
    pub request_timeout: Duration,
    pub convert_mode: ConvertMode,
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub www_root: Option<PathBuf>,
    pub convert_mode: Option<ConvertMode>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<ServiceConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_config_with_overrides(&file_vars, env_var_string, overrides))
}

#[cfg(test)]
fn build_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> ServiceConfig {
    build_config_with_overrides(file_vars, env_lookup, ConfigOverrides::default())
}

fn build_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> ServiceConfig {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup("HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let www_root = overrides
        .www_root
        .or_else(|| lookup("WWW_ROOT").map(PathBuf::from));
    let request_timeout = lookup("REQUEST_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    let convert_mode = overrides
        .convert_mode
        .or_else(|| lookup("CONVERT_MODE").and_then(|value| ConvertMode::parse(&value)))
        .unwrap_or_default();

    ServiceConfig {
        host,
        port,
        www_root,
        yt_dlp: PathBuf::from(lookup("YT_DLP_PATH").unwrap_or_else(|| DEFAULT_YT_DLP.into())),
        python: PathBuf::from(lookup("YTDLP_PYTHON").unwrap_or_else(|| DEFAULT_PYTHON.into())),
        ffmpeg: PathBuf::from(lookup("FFMPEG_PATH").unwrap_or_else(|| DEFAULT_FFMPEG.into())),
        cookies: lookup("COOKIES_PATH").map(PathBuf::from),
        oembed_endpoint: lookup("OEMBED_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_OEMBED_ENDPOINT.to_string()),
        request_timeout: Duration::from_secs(request_timeout),
        convert_mode,
    }
}

impl ServiceConfig {
    /// Strategy chain in priority order: native yt-dlp, oEmbed, then the
    /// Python module as a second full extractor. Links mode keeps only oEmbed.
    pub fn build_resolver(&self) -> Resolver {
        let oembed: Arc<dyn Strategy> = Arc::new(OEmbedStrategy::new(&self.oembed_endpoint));
        let strategies = match self.convert_mode {
            ConvertMode::Stream => vec![
                Arc::new(YtDlpStrategy::binary(&self.yt_dlp).with_cookies(self.cookies.clone()))
                    as Arc<dyn Strategy>,
                oembed,
                Arc::new(
                    YtDlpStrategy::python_module(&self.python).with_cookies(self.cookies.clone()),
                ),
            ],
            ConvertMode::Links => vec![oembed],
        };
        Resolver::new(strategies).with_budget(self.request_timeout)
    }

    pub fn build_transcoder(&self) -> FfmpegTranscoder {
        FfmpegTranscoder::new(&self.ffmpeg)
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .and_then(non_blank)
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
