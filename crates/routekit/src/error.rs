//! Error taxonomy for the interception pipeline.
//!
//! Only `PatternCompile` is fatal, and only at registration time. Every other
//! variant is recovered or logged inside the dispatcher so that a request is
//! always resolved.

use std::path::PathBuf;

/// Errors raised while registering middleware or handling an intercepted request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid url pattern `{pattern}`: {source}")]
    PatternCompile {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("upstream fetch of {url} failed: {reason}")]
    UpstreamFetch { url: String, reason: String },
    #[error("failed to read local file {path}: {source}")]
    LocalRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("transform failed: {0}")]
    Transform(#[source] anyhow::Error),
    #[error("script error: {0}")]
    Script(String),
    /// The page, context or browser went away while a request was in flight.
    #[error("target page, context or browser has been closed")]
    SessionClosed,
    #[error("session error: {0}")]
    Session(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Teardown races are expected and never worth a warning.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Error::SessionClosed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
