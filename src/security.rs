#![forbid(unsafe_code)]

//! Startup guard and the filename sanitizing applied before anything derived
//! from a video title reaches a header or a path.

use anyhow::{Result, bail};
use nix::unistd::Uid;

pub const DEFAULT_FILENAME: &str = "download";
const MAX_FILENAME_CHARS: usize = 150;
const SAFE_PUNCTUATION: &str = " -_.,()[]'&!+";

/// Fails fast when the server is started as root. Extractors and the
/// transcoder are external programs and should never run privileged.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Keeps ASCII letters, digits and a few harmless punctuation marks, collapses
/// whitespace and trims leading/trailing dots. Never returns an empty string.
pub fn sanitize_filename(title: &str) -> String {
    let kept: String = title
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || SAFE_PUNCTUATION.contains(*c))
        .collect();
    let collapsed = kept.split(' ').filter(|part| !part.is_empty()).collect::<Vec<_>>().join(" ");
    let trimmed: String = collapsed
        .trim_matches(|c: char| c == '.' || c == ' ')
        .chars()
        .take(MAX_FILENAME_CHARS)
        .collect();
    let trimmed = trimmed.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        DEFAULT_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// `Content-Disposition` value for an attachment. The plain `filename` is the
/// ASCII-safe name; `filename*` carries the title with only path and control
/// characters removed, percent-encoded, for clients that understand it.
pub fn attachment_disposition(title: &str, extension: &str) -> String {
    let ascii = sanitize_filename(title);
    let unicode: String = title
        .chars()
        .filter(|c| !c.is_control() && !r#"/\:*?"<>|"#.contains(*c))
        .collect();
    let unicode = unicode.trim().trim_matches('.');
    let unicode = if unicode.is_empty() { ascii.as_str() } else { unicode };
    format!(
        "attachment; filename=\"{ascii}.{extension}\"; filename*=UTF-8''{}",
        urlencoding::encode(&format!("{unicode}.{extension}"))
    )
}
