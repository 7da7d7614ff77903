use crate::error::Result;
use crate::pattern::{CompiledPattern, UrlPattern};
use crate::route::{CommittedResponse, PendingRequest};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// A pre-phase handler. It may stage a response but never resolves the route.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut PendingRequest) -> Result<()>;
}

/// A post-phase handler observing the response a request was resolved with.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(&self, response: &CommittedResponse) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pre,
    Post,
}

#[derive(Clone)]
pub enum Handler {
    Pre(Arc<dyn Middleware>),
    Post(Arc<dyn Observer>),
}

impl Handler {
    pub fn phase(&self) -> Phase {
        match self {
            Handler::Pre(_) => Phase::Pre,
            Handler::Post(_) => Phase::Post,
        }
    }
}

#[derive(Clone)]
pub struct MiddlewareEntry {
    pub pattern: CompiledPattern,
    pub handler: Handler,
}

impl fmt::Debug for MiddlewareEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareEntry")
            .field("pattern", &self.pattern.describe())
            .field("phase", &self.handler.phase())
            .finish()
    }
}

/// Collects entries in registration order. Patterns compile on `push`, so a
/// bad pattern is reported at the call that registered it.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: Vec<MiddlewareEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pattern: impl Into<UrlPattern>, handler: Handler) -> Result<&mut Self> {
        let pattern = CompiledPattern::compile(pattern)?;
        self.entries.push(MiddlewareEntry { pattern, handler });
        Ok(self)
    }

    pub fn pre(
        &mut self,
        pattern: impl Into<UrlPattern>,
        middleware: impl Middleware + 'static,
    ) -> Result<&mut Self> {
        self.push(pattern, Handler::Pre(Arc::new(middleware)))
    }

    pub fn post(
        &mut self,
        pattern: impl Into<UrlPattern>,
        observer: impl Observer + 'static,
    ) -> Result<&mut Self> {
        self.push(pattern, Handler::Post(Arc::new(observer)))
    }

    pub fn build(self) -> Registry {
        Registry {
            entries: Arc::from(self.entries),
        }
    }
}

/// Immutable, cheaply cloneable view of the registered middleware.
#[derive(Debug, Clone)]
pub struct Registry {
    entries: Arc<[MiddlewareEntry]>,
}

impl Default for Registry {
    fn default() -> Self {
        RegistryBuilder::new().build()
    }
}

impl Registry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pre-phase handlers matching `url`, in registration order.
    pub fn pre_matching<'a>(
        &'a self,
        url: &'a str,
    ) -> impl Iterator<Item = &'a Arc<dyn Middleware>> {
        self.entries.iter().filter_map(move |entry| match &entry.handler {
            Handler::Pre(m) if entry.pattern.matches(url) => Some(m),
            _ => None,
        })
    }

    /// Post-phase observers matching `url`, in registration order.
    pub fn post_matching<'a>(
        &'a self,
        url: &'a str,
    ) -> impl Iterator<Item = &'a Arc<dyn Observer>> {
        self.entries.iter().filter_map(move |entry| match &entry.handler {
            Handler::Post(o) if entry.pattern.matches(url) => Some(o),
            _ => None,
        })
    }
}
