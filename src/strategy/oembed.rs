use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Extraction, ExtractionOutcome, Strategy};
use crate::error::ResolveError;
use crate::metadata::PartialMetadata;
use crate::reference::VideoReference;

pub const DEFAULT_OEMBED_ENDPOINT: &str = "https://www.youtube.com/oembed";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Metadata-only lookup against the public oEmbed endpoint. Cheap and rarely
/// blocked, but it knows nothing about duration, views or audio.
#[derive(Debug, Clone)]
pub struct OEmbedStrategy {
    endpoint: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct OEmbedResponse {
    title: Option<String>,
    author_name: Option<String>,
    thumbnail_url: Option<String>,
}

impl OEmbedStrategy {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for OEmbedStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_OEMBED_ENDPOINT)
    }
}

#[async_trait]
impl Strategy for OEmbedStrategy {
    fn name(&self) -> &str {
        "oembed"
    }

    fn supplies_stream(&self) -> bool {
        false
    }

    async fn attempt(&self, reference: &VideoReference, _want_stream: bool) -> ExtractionOutcome {
        let endpoint = self.endpoint.clone();
        let watch_url = reference.watch_url();
        let timeout = self.timeout;
        // ureq is blocking; keep it off the async workers.
        let response = tokio::task::spawn_blocking(move || fetch(&endpoint, &watch_url, timeout))
            .await
            .map_err(|err| ResolveError::UpstreamUnavailable(format!("oEmbed worker: {err}")))??;

        Ok(Extraction::metadata_only(PartialMetadata {
            title: response.title,
            author: response.author_name,
            thumbnail_url: response.thumbnail_url,
            ..PartialMetadata::default()
        }))
    }
}

fn fetch(endpoint: &str, watch_url: &str, timeout: Duration) -> Result<OEmbedResponse, ResolveError> {
    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    match agent
        .get(endpoint)
        .query("url", watch_url)
        .query("format", "json")
        .call()
    {
        Ok(response) => response
            .into_json::<OEmbedResponse>()
            .map_err(|err| ResolveError::Extraction(format!("decoding oEmbed response: {err}"))),
        Err(ureq::Error::Status(code, _)) => Err(ResolveError::UpstreamUnavailable(format!(
            "oEmbed returned HTTP {code}"
        ))),
        Err(ureq::Error::Transport(transport)) => Err(ResolveError::UpstreamUnavailable(
            format!("oEmbed unreachable: {transport}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::Query, http::StatusCode, response::IntoResponse, routing::get};
    use serde_json::json;
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/oembed")
    }

    fn reference() -> VideoReference {
        VideoReference::parse("https://youtu.be/jNQXAC9IVRw").unwrap()
    }

    #[tokio::test]
    async fn reads_title_author_and_thumbnail() {
        let router = Router::new().route(
            "/oembed",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let expected = "https://www.youtube.com/watch?v=jNQXAC9IVRw";
                if params.get("url").map(String::as_str) != Some(expected)
                    || params.get("format").map(String::as_str) != Some("json")
                {
                    return StatusCode::NOT_FOUND.into_response();
                }
                Json(json!({
                    "title": "Me at the zoo",
                    "author_name": "jawed",
                    "thumbnail_url": "https://i.ytimg.com/vi/jNQXAC9IVRw/hqdefault.jpg",
                }))
                .into_response()
            }),
        );
        let strategy = OEmbedStrategy::new(serve(router).await);

        let extraction = strategy.attempt(&reference(), true).await.unwrap();
        assert!(extraction.audio.is_none());
        let metadata = extraction.metadata.normalize(&reference());
        assert_eq!(metadata.title, "Me at the zoo");
        assert_eq!(metadata.author, "jawed");
        assert_eq!(
            metadata.thumbnail_url,
            "https://i.ytimg.com/vi/jNQXAC9IVRw/hqdefault.jpg"
        );
        assert_eq!(metadata.duration_seconds, 0);
    }

    #[tokio::test]
    async fn http_errors_are_upstream_failures() {
        let router = Router::new().route("/oembed", get(|| async { StatusCode::UNAUTHORIZED }));
        let strategy = OEmbedStrategy::new(serve(router).await);
        let err = strategy.attempt(&reference(), false).await.unwrap_err();
        assert!(matches!(err, ResolveError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_fast() {
        let strategy = OEmbedStrategy::new("http://127.0.0.1:9/oembed")
            .with_timeout(Duration::from_millis(500));
        let err = strategy.attempt(&reference(), false).await.unwrap_err();
        assert!(matches!(err, ResolveError::UpstreamUnavailable(_)));
    }
}
