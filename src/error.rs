#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a video cannot be served at all, regardless of the strategy used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailability {
    Private,
    AgeRestricted,
    Removed,
}

impl Unavailability {
    pub fn http_status(self) -> u16 {
        match self {
            Self::Private | Self::AgeRestricted => 403,
            Self::Removed => 410,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Private => "This video is private and cannot be accessed.",
            Self::AgeRestricted => "This video is age-restricted and cannot be accessed.",
            Self::Removed => "This video is no longer available.",
        }
    }
}

impl fmt::Display for Unavailability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid YouTube URL: {0}")]
    InvalidReference(String),

    #[error("{0}")]
    VideoUnavailable(Unavailability),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transcode failed: {0}")]
    TranscodeFailed(String),

    #[error("all extraction strategies failed")]
    AllStrategiesFailed,
}

impl ResolveError {
    /// HTTP status a transport adapter should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidReference(_) => 400,
            Self::VideoUnavailable(reason) => reason.http_status(),
            Self::UpstreamUnavailable(_) => 502,
            Self::Timeout(_) => 504,
            Self::Extraction(_) | Self::TranscodeFailed(_) | Self::AllStrategiesFailed => 500,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::VideoUnavailable(_))
    }
}

impl From<serde_json::Error> for ResolveError {
    fn from(err: serde_json::Error) -> Self {
        Self::Extraction(format!("invalid JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailability_maps_to_forbidden_or_gone() {
        assert_eq!(
            ResolveError::VideoUnavailable(Unavailability::Private).http_status(),
            403
        );
        assert_eq!(
            ResolveError::VideoUnavailable(Unavailability::AgeRestricted).http_status(),
            403
        );
        assert_eq!(
            ResolveError::VideoUnavailable(Unavailability::Removed).http_status(),
            410
        );
    }

    #[test]
    fn invalid_reference_is_bad_request() {
        let err = ResolveError::InvalidReference("nope".into());
        assert_eq!(err.http_status(), 400);
        assert!(err.to_string().contains("nope"));
    }
}
