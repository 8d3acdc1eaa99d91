#![forbid(unsafe_code)]

//! Extracts the canonical video identifier from the URL shapes users paste.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ResolveError;

/// Watch (`/watch?...v=ID`), short (`youtu.be/ID`) and embed (`/embed/ID`)
/// shapes. The identifier must be exactly 11 characters of the YouTube ID
/// alphabet and must not be followed by another ID character.
static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:https?://)?(?:(?:www|m|music)\.)?(?:youtube\.com/(?:watch\?(?:[^#]*&)?v=|embed/)|youtu\.be/)([A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-].*)?$",
    )
    .expect("reference pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoReference {
    id: String,
    url: String,
}

impl VideoReference {
    /// Parses a user-supplied URL. Anything that does not match one of the
    /// known shapes is rejected rather than guessed at.
    pub fn parse(url: &str) -> Result<Self, ResolveError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(ResolveError::InvalidReference("URL is required".into()));
        }

        let id = REFERENCE_PATTERN
            .captures(trimmed)
            .and_then(|captures| captures.get(1))
            .map(|matched| matched.as_str().to_string())
            .ok_or_else(|| ResolveError::InvalidReference(trimmed.to_string()))?;

        Ok(Self {
            id,
            url: trimmed.to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The URL exactly as the caller supplied it (trimmed).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Canonical watch URL handed to extractors, independent of the input shape.
    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.id)
    }

    /// Deterministic CDN thumbnail used when a strategy supplies none.
    pub fn thumbnail_url(&self) -> String {
        format!("https://img.youtube.com/vi/{}/maxresdefault.jpg", self.id)
    }
}
