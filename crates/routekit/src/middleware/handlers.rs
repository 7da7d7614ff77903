//! Built-in middleware: mocks, remaps, content modification and taps.

use super::registry::{Middleware, Observer};
use crate::error::{Error, Result};
use crate::metrics;
use crate::mime::mimetype;
use crate::modify::{apply_transform, ModifyTransform};
use crate::route::{CommittedResponse, FetchOptions, Headers, PendingRequest, StagedResponse};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a remap handler sends a request.
#[derive(Clone)]
pub enum Target {
    Fixed(String),
    Computed(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl Target {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Target::Computed(Arc::new(f))
    }

    pub fn resolve(&self, source: &str) -> String {
        match self {
            Target::Fixed(target) => target.clone(),
            Target::Computed(f) => f(source),
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Fixed(target) => write!(f, "Fixed({target:?})"),
            Target::Computed(_) => write!(f, "Computed(<fn>)"),
        }
    }
}

impl From<&str> for Target {
    fn from(target: &str) -> Self {
        Target::Fixed(target.to_string())
    }
}

impl From<String> for Target {
    fn from(target: String) -> Self {
        Target::Fixed(target)
    }
}

impl From<&std::path::Path> for Target {
    fn from(path: &std::path::Path) -> Self {
        Target::Fixed(path.to_string_lossy().into_owned())
    }
}

/// Serve a literal response without touching the network.
#[derive(Debug, Clone)]
pub struct Mock {
    response: StagedResponse,
}

impl Mock {
    /// Responses without a status are served as 200.
    pub fn new(mut response: StagedResponse) -> Self {
        if response.status.is_none() {
            response.status = Some(200);
        }
        Self { response }
    }
}

#[async_trait]
impl Middleware for Mock {
    async fn handle(&self, ctx: &mut PendingRequest) -> Result<()> {
        info!("MOCK {}", ctx.url());
        ctx.fulfill(self.response.clone());
        Ok(())
    }
}

/// Fetch another URL in place of the requested one.
#[derive(Debug, Clone)]
pub struct MapRemote {
    target: Target,
    fallback: bool,
}

impl MapRemote {
    pub fn new(target: impl Into<Target>) -> Self {
        Self {
            target: target.into(),
            fallback: false,
        }
    }

    /// On a 404 from the target, serve the original URL instead.
    pub fn with_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }
}

#[async_trait]
impl Middleware for MapRemote {
    async fn handle(&self, ctx: &mut PendingRequest) -> Result<()> {
        let source = ctx.url().to_string();
        let target = self.target.resolve(&source);
        info!("MAP {} => {}", source, target);

        let staged = ctx.fetch(FetchOptions::url(target.as_str())).await;
        let not_found = staged.as_ref().and_then(|s| s.status) == Some(404);
        if self.fallback && not_found {
            info!("FALLBACK {} (404 from {})", source, target);
            ctx.refetch(FetchOptions::default()).await;
        }
        Ok(())
    }
}

/// Serve a file from disk in place of the requested URL.
#[derive(Debug, Clone)]
pub struct MapLocal {
    target: Target,
    fallback: bool,
}

impl MapLocal {
    pub fn new(target: impl Into<Target>) -> Self {
        Self {
            target: target.into(),
            fallback: false,
        }
    }

    /// When the file cannot be read, fetch the original URL instead.
    pub fn with_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }
}

#[async_trait]
impl Middleware for MapLocal {
    async fn handle(&self, ctx: &mut PendingRequest) -> Result<()> {
        let source = ctx.url().to_string();
        let target = self.target.resolve(&source);
        info!("MAP {} => {}", source, target);

        match tokio::fs::read(&target).await {
            Ok(body) => {
                ctx.fulfill(StagedResponse::new().body(body).content_type(mimetype(&target)));
            }
            Err(source_err) => {
                let err = Error::LocalRead {
                    path: target.into(),
                    source: source_err,
                };
                if self.fallback {
                    info!("FALLBACK {} ({})", source, err);
                    ctx.fetch(FetchOptions::default()).await;
                } else {
                    warn!("{}", err);
                }
            }
        }
        Ok(())
    }
}

/// Imperative content modification registered with `modify_json`,
/// `modify_js` or `modify_html`.
#[derive(Debug, Clone)]
pub struct ModifyHandler {
    transform: ModifyTransform,
}

impl ModifyHandler {
    pub fn new(transform: ModifyTransform) -> Self {
        Self { transform }
    }
}

#[async_trait]
impl Middleware for ModifyHandler {
    async fn handle(&self, ctx: &mut PendingRequest) -> Result<()> {
        match apply_transform(ctx, &self.transform, None).await {
            Ok(applied) => {
                if applied {
                    metrics::record_modification(self.transform.kind(), true);
                }
            }
            Err(e) => {
                metrics::record_modification(self.transform.kind(), false);
                warn!("Failed to modify {}: {}", ctx.url(), e);
            }
        }
        Ok(())
    }
}

/// Committed body as handed to a tap.
#[derive(Debug, Clone, PartialEq)]
pub enum TapBody {
    Json(Value),
    Text(String),
    Empty,
}

/// What a tap callback observes.
#[derive(Debug, Clone)]
pub struct TapEvent {
    pub url: String,
    pub status: u16,
    pub headers: Headers,
    pub content_type: Option<String>,
    pub body: TapBody,
}

impl From<&CommittedResponse> for TapEvent {
    fn from(response: &CommittedResponse) -> Self {
        let is_json = response
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("json"));
        let body = if response.body.is_empty() {
            TapBody::Empty
        } else if is_json {
            match serde_json::from_slice(&response.body) {
                Ok(value) => TapBody::Json(value),
                Err(e) => {
                    debug!("Tap body for {} is not valid JSON: {}", response.url, e);
                    TapBody::Text(String::from_utf8_lossy(&response.body).into_owned())
                }
            }
        } else {
            TapBody::Text(String::from_utf8_lossy(&response.body).into_owned())
        };
        Self {
            url: response.url.clone(),
            status: response.status,
            headers: response.headers.clone(),
            content_type: response.content_type.clone(),
            body,
        }
    }
}

type TapCallback = dyn Fn(TapEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Read-only observer of committed responses.
#[derive(Clone)]
pub struct Tap {
    callback: Arc<TapCallback>,
}

impl Tap {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(TapEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            callback: Arc::new(move |event: TapEvent| callback(event).boxed()),
        }
    }
}

impl fmt::Debug for Tap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Tap")
    }
}

#[async_trait]
impl Observer for Tap {
    async fn observe(&self, response: &CommittedResponse) -> Result<()> {
        (self.callback)(TapEvent::from(response))
            .await
            .map_err(Error::Transform)
    }
}
