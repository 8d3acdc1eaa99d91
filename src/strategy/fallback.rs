use async_trait::async_trait;

use super::{Extraction, ExtractionOutcome, Strategy};
use crate::metadata::{PartialMetadata, placeholder_title};
use crate::reference::VideoReference;

/// Last resort: fabricates metadata from the identifier alone. Never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentifierFallback;

#[async_trait]
impl Strategy for IdentifierFallback {
    fn name(&self) -> &str {
        "identifier-fallback"
    }

    fn supplies_stream(&self) -> bool {
        false
    }

    async fn attempt(&self, reference: &VideoReference, _want_stream: bool) -> ExtractionOutcome {
        Ok(Extraction::metadata_only(PartialMetadata {
            title: Some(placeholder_title(reference)),
            thumbnail_url: Some(reference.thumbnail_url()),
            ..PartialMetadata::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fabricates_metadata_without_audio() {
        let reference = VideoReference::parse("https://youtu.be/jNQXAC9IVRw").unwrap();
        let extraction = IdentifierFallback.attempt(&reference, true).await.unwrap();
        assert!(extraction.audio.is_none());
        let metadata = extraction.metadata.normalize(&reference);
        assert!(metadata.title.contains("jNQXAC9IVRw"));
        assert_eq!(
            metadata.thumbnail_url,
            "https://img.youtube.com/vi/jNQXAC9IVRw/maxresdefault.jpg"
        );
    }
}
