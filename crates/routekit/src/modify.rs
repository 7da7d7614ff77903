//! Content modification: JSON, JavaScript and HTML body rewrites, plus
//! status/header rewrites of the whole response.
//!
//! A body modification is gated twice: by URL pattern, then by the content type
//! currently staged on the request. A response modification is gated by URL
//! pattern only. Rules run in registration order over the
//! same staged body, so a rule that retypes the response can unlock a later one.

use crate::error::{Error, Result};
use crate::metrics;
use crate::pattern::{CompiledPattern, UrlPattern};
use crate::route::{FetchOptions, Headers, PendingRequest, StagedResponse};
use bytes::Bytes;
use futures::future::BoxFuture;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rewrites a decoded JSON body.
pub trait JsonTransform: Send + Sync {
    fn transform(&self, value: Value) -> BoxFuture<'static, anyhow::Result<Value>>;
}

impl<F, Fut> JsonTransform for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn transform(&self, value: Value) -> BoxFuture<'static, anyhow::Result<Value>> {
        Box::pin(self(value))
    }
}

/// Rewrites JavaScript source text.
pub trait JsTransform: Send + Sync {
    fn transform(&self, source: String) -> BoxFuture<'static, anyhow::Result<String>>;
}

impl<F, Fut> JsTransform for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    fn transform(&self, source: String) -> BoxFuture<'static, anyhow::Result<String>> {
        Box::pin(self(source))
    }
}

/// Edits a parsed HTML document in place.
///
/// Synchronous: the parsed document is not `Send` and never crosses an await.
pub trait HtmlTransform: Send + Sync {
    fn transform(&self, document: &mut Html) -> anyhow::Result<()>;
}

impl<F> HtmlTransform for F
where
    F: Fn(&mut Html) -> anyhow::Result<()> + Send + Sync,
{
    fn transform(&self, document: &mut Html) -> anyhow::Result<()> {
        self(document)
    }
}

/// Status line and headers of the response about to be served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseParts {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
}

/// Rewrites the status and headers of a response. The body is left alone.
pub trait ResponseTransform: Send + Sync {
    fn transform(&self, parts: ResponseParts) -> BoxFuture<'static, anyhow::Result<ResponseParts>>;
}

impl<F, Fut> ResponseTransform for F
where
    F: Fn(ResponseParts) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<ResponseParts>> + Send + 'static,
{
    fn transform(
        &self,
        parts: ResponseParts,
    ) -> BoxFuture<'static, anyhow::Result<ResponseParts>> {
        Box::pin(self(parts))
    }
}

#[derive(Clone)]
pub enum ModifyTransform {
    Json(Arc<dyn JsonTransform>),
    Js(Arc<dyn JsTransform>),
    Html(Arc<dyn HtmlTransform>),
    Response(Arc<dyn ResponseTransform>),
}

impl ModifyTransform {
    pub fn json(transform: impl JsonTransform + 'static) -> Self {
        ModifyTransform::Json(Arc::new(transform))
    }

    pub fn js(transform: impl JsTransform + 'static) -> Self {
        ModifyTransform::Js(Arc::new(transform))
    }

    pub fn html(transform: impl HtmlTransform + 'static) -> Self {
        ModifyTransform::Html(Arc::new(transform))
    }

    pub fn response(transform: impl ResponseTransform + 'static) -> Self {
        ModifyTransform::Response(Arc::new(transform))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModifyTransform::Json(_) => "json",
            ModifyTransform::Js(_) => "js",
            ModifyTransform::Html(_) => "html",
            ModifyTransform::Response(_) => "response",
        }
    }

    /// Substring the staged content type must contain for this transform to run.
    /// `javascript` covers both `text/javascript` and `application/javascript`.
    /// Response transforms run whatever the content type.
    pub fn content_type_marker(&self) -> Option<&'static str> {
        match self {
            ModifyTransform::Json(_) => Some("application/json"),
            ModifyTransform::Js(_) => Some("javascript"),
            ModifyTransform::Html(_) => Some("text/html"),
            ModifyTransform::Response(_) => None,
        }
    }

    /// Rewrite a body. Response transforms never touch it.
    async fn run(&self, body: Bytes) -> anyhow::Result<Bytes> {
        match self {
            ModifyTransform::Json(transform) => {
                let value: Value = serde_json::from_slice(&body)?;
                let value = transform.transform(value).await?;
                Ok(Bytes::from(serde_json::to_vec(&value)?))
            }
            ModifyTransform::Js(transform) => {
                let source = String::from_utf8_lossy(&body).into_owned();
                let source = transform.transform(source).await?;
                Ok(Bytes::from(source))
            }
            ModifyTransform::Html(transform) => {
                let text = String::from_utf8_lossy(&body);
                Ok(Bytes::from(rewrite_html(&text, transform.as_ref())?))
            }
            ModifyTransform::Response(_) => Ok(body),
        }
    }
}

impl fmt::Debug for ModifyTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModifyTransform::{}", self.kind())
    }
}

fn rewrite_html(text: &str, transform: &dyn HtmlTransform) -> anyhow::Result<String> {
    let mut document = Html::parse_document(text);
    transform.transform(&mut document)?;
    Ok(document.html())
}

/// Apply one transform to the request's staged response.
///
/// Returns `Ok(false)` when there is nothing to transform (failed fetch) or
/// the staged content type does not match a body transform.
pub async fn apply_transform(
    ctx: &mut PendingRequest,
    transform: &ModifyTransform,
    retype: Option<&str>,
) -> Result<bool> {
    let Some(snapshot) = ctx.fetch(FetchOptions::default()).await else {
        debug!("Nothing to {} modify for {}", transform.kind(), ctx.url());
        return Ok(false);
    };

    if let ModifyTransform::Response(transform) = transform {
        let parts = ResponseParts {
            status: snapshot.status.unwrap_or(200),
            headers: snapshot.headers.unwrap_or_default(),
        };
        let parts = transform.transform(parts).await.map_err(Error::Transform)?;
        let mut patch = StagedResponse::new().status(parts.status).headers(parts.headers);
        if let Some(content_type) = retype {
            patch = patch.content_type(content_type);
        }
        ctx.fulfill(patch);
        info!("MODIFY RESPONSE {}", ctx.url());
        return Ok(true);
    }

    let content_type = snapshot.effective_content_type().unwrap_or_default();
    let marker = transform.content_type_marker().unwrap_or_default();
    if !content_type.contains(marker) {
        debug!(
            "Skipping {} modify for {}: content type is {:?}",
            transform.kind(),
            ctx.url(),
            content_type
        );
        return Ok(false);
    }

    let body = snapshot.body.unwrap_or_default();
    let rewritten = transform.run(body).await.map_err(Error::Transform)?;

    let mut patch = StagedResponse::new().body(rewritten);
    if let Some(content_type) = retype {
        patch = patch.content_type(content_type);
    }
    ctx.fulfill(patch);
    info!("MODIFY {} {}", transform.kind().to_uppercase(), ctx.url());
    Ok(true)
}

/// A declarative modification keyed by URL patterns.
#[derive(Debug, Clone)]
pub struct ModifyRule {
    patterns: Vec<CompiledPattern>,
    transform: ModifyTransform,
    content_type: Option<String>,
}

impl ModifyRule {
    pub fn new<P>(patterns: impl IntoIterator<Item = P>, transform: ModifyTransform) -> Result<Self>
    where
        P: Into<UrlPattern>,
    {
        let patterns = patterns
            .into_iter()
            .map(CompiledPattern::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns,
            transform,
            content_type: None,
        })
    }

    /// Content type staged after the transform succeeds.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn matches(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(url))
    }

    pub fn transform(&self) -> &ModifyTransform {
        &self.transform
    }
}

/// Ordered modify rules. Every matching rule applies.
#[derive(Debug, Clone, Default)]
pub struct ModifyTable {
    rules: Vec<ModifyRule>,
}

impl ModifyTable {
    pub fn new(rules: Vec<ModifyRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Run the chain. Transform failures are logged per rule and never stop
    /// later rules. Returns whether any rule rewrote the body.
    pub async fn apply(&self, ctx: &mut PendingRequest) -> bool {
        let mut changed = false;
        for (index, rule) in self.rules.iter().enumerate() {
            if !rule.matches(ctx.url()) {
                continue;
            }
            match apply_transform(ctx, &rule.transform, rule.content_type.as_deref()).await {
                Ok(applied) => {
                    if applied {
                        metrics::record_modification(rule.transform.kind(), true);
                    }
                    changed |= applied;
                }
                Err(e) => {
                    metrics::record_modification(rule.transform.kind(), false);
                    warn!("Modify rule #{} failed for {}: {}", index, ctx.url(), e);
                }
            }
        }
        if changed {
            info!("FULFILL {}", ctx.url());
        }
        changed
    }
}

/// Built-in HTML edit removing every element that matches a CSS selector.
pub struct RemoveElements {
    selectors: Vec<Selector>,
}

impl RemoveElements {
    pub fn new<S: AsRef<str>>(selectors: &[S]) -> anyhow::Result<Self> {
        let selectors = selectors
            .iter()
            .map(|s| {
                Selector::parse(s.as_ref())
                    .map_err(|e| anyhow::anyhow!("invalid selector `{}`: {:?}", s.as_ref(), e))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { selectors })
    }
}

impl HtmlTransform for RemoveElements {
    fn transform(&self, document: &mut Html) -> anyhow::Result<()> {
        for selector in &self.selectors {
            let ids: Vec<_> = document.select(selector).map(|el| el.id()).collect();
            for id in ids {
                if let Some(mut node) = document.tree.get_mut(id) {
                    node.detach();
                }
            }
        }
        Ok(())
    }
}
