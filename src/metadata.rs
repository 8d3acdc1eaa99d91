#![forbid(unsafe_code)]

//! Response model shared by every strategy plus the one place where missing
//! fields receive their fallback values.

use serde::{Deserialize, Serialize};

use crate::reference::VideoReference;

/// Descriptions longer than this are cut (in characters, not bytes).
pub const DESCRIPTION_LIMIT: usize = 200;
pub const UNKNOWN_AUTHOR: &str = "Unknown";

/// Fully populated metadata. Every field is always present; the JSON keys
/// mirror what existing clients of `/info` already read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub video_id: String,
    pub title: String,
    #[serde(rename = "duration")]
    pub duration_seconds: u64,
    #[serde(rename = "thumbnail")]
    pub thumbnail_url: String,
    pub author: String,
    pub description: String,
    pub view_count: u64,
}

/// Whatever subset of fields a strategy managed to obtain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialMetadata {
    pub title: Option<String>,
    pub duration_seconds: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub view_count: Option<u64>,
}

impl PartialMetadata {
    /// Fills every missing or blank field from the identifier-based fallbacks.
    pub fn normalize(self, reference: &VideoReference) -> VideoMetadata {
        VideoMetadata {
            video_id: reference.id().to_string(),
            title: non_blank(self.title).unwrap_or_else(|| placeholder_title(reference)),
            duration_seconds: self.duration_seconds.unwrap_or(0),
            thumbnail_url: non_blank(self.thumbnail_url)
                .unwrap_or_else(|| reference.thumbnail_url()),
            author: non_blank(self.author).unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
            description: non_blank(self.description)
                .map(|text| truncate_chars(&text, DESCRIPTION_LIMIT))
                .unwrap_or_default(),
            view_count: self.view_count.unwrap_or(0),
        }
    }
}

impl From<VideoMetadata> for PartialMetadata {
    fn from(metadata: VideoMetadata) -> Self {
        Self {
            title: Some(metadata.title),
            duration_seconds: Some(metadata.duration_seconds),
            thumbnail_url: Some(metadata.thumbnail_url),
            author: Some(metadata.author),
            description: Some(metadata.description),
            view_count: Some(metadata.view_count),
        }
    }
}

pub fn placeholder_title(reference: &VideoReference) -> String {
    format!("YouTube Video ({})", reference.id())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
