#![forbid(unsafe_code)]

//! Resolves YouTube links into normalized metadata and, when a raw audio
//! source can be obtained, streams it through an external transcoder.

pub mod config;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod redirect;
pub mod reference;
pub mod security;
pub mod strategy;
pub mod transcode;

pub use error::{ResolveError, Unavailability};
pub use metadata::{PartialMetadata, VideoMetadata};
pub use pipeline::{Resolution, Resolver};
pub use reference::VideoReference;
