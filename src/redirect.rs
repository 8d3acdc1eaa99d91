#![forbid(unsafe_code)]

//! External converter links handed out when no raw audio could be obtained.

use serde::Serialize;

use crate::metadata::VideoMetadata;
use crate::reference::VideoReference;
use crate::transcode::{AudioFormat, ConversionRequest, Quality};

pub const FALLBACK_MESSAGE: &str = "Due to YouTube restrictions on this server, please use one of these services to download your audio:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectService {
    pub name: String,
    pub url: String,
    pub features: Vec<String>,
}

impl RedirectService {
    fn new(name: &str, url: String, features: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            url,
            features: features.iter().map(|feature| feature.to_string()).collect(),
        }
    }
}

/// Fixed list of third-party converters; every URL carries the identifier.
pub fn redirect_services(reference: &VideoReference) -> Vec<RedirectService> {
    let id = reference.id();
    let watch = urlencoding::encode(&reference.watch_url()).into_owned();
    vec![
        RedirectService::new(
            "Y2Mate (Recommended)",
            format!("https://www.y2mate.com/youtube/{id}"),
            &["MP3", "MP4", "Multiple qualities"],
        ),
        RedirectService::new(
            "SaveFrom.net",
            format!("https://en.savefrom.net/1-youtube-video-downloader-{id}/"),
            &["Fast downloads", "Browser extension available"],
        ),
        RedirectService::new(
            "Dirpy",
            format!("https://dirpy.com/from/youtube?url={watch}"),
            &["Audio cutting", "ID3 tag editing"],
        ),
        RedirectService::new(
            "YTMP3",
            format!("https://ytmp3.cc/youtube-to-mp3/?url={watch}"),
            &["Simple interface", "Quick conversion"],
        ),
    ]
}

/// JSON body returned by `/convert` when it cannot stream audio itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionFallback {
    pub success: bool,
    pub message: String,
    pub video_id: String,
    pub video_url: String,
    pub title: String,
    pub services: Vec<RedirectService>,
    pub requested_format: AudioFormat,
    pub requested_quality: Quality,
}

impl ConversionFallback {
    pub fn new(request: &ConversionRequest, metadata: &VideoMetadata) -> Self {
        Self {
            success: true,
            message: FALLBACK_MESSAGE.to_string(),
            video_id: request.reference.id().to_string(),
            video_url: request.reference.watch_url(),
            title: metadata.title.clone(),
            services: redirect_services(&request.reference),
            requested_format: request.format,
            requested_quality: request.quality,
        }
    }
}
