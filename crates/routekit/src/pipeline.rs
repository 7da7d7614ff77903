//! Registration API.
//!
//! ```no_run
//! use routekit::{Pipeline, StagedResponse};
//!
//! # fn main() -> routekit::Result<()> {
//! let mut pipeline = Pipeline::new();
//! pipeline
//!     .mock("**/api/flags", StagedResponse::new().body(r#"{"beta":true}"#))?
//!     .map_local("**/app.js", "./dist/app.js")?
//!     .modify_json("**/api/user", |mut user: serde_json::Value| async move {
//!         user["admin"] = true.into();
//!         anyhow::Ok(user)
//!     })?;
//! let dispatcher = pipeline.build()?;
//! # Ok(())
//! # }
//! ```

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::middleware::{
    MapLocal, MapRemote, Middleware, Mock, ModifyHandler, Observer, RegistryBuilder, Tap, TapEvent,
    Target,
};
use crate::modify::{
    HtmlTransform, JsTransform, JsonTransform, ModifyRule, ModifyTable, ModifyTransform,
    ResponseTransform,
};
use crate::overrides::{OverrideRule, OverrideTable};
use crate::pattern::UrlPattern;
use crate::route::StagedResponse;
use std::future::Future;

/// Collects middleware, override rules and modify rules, then freezes them
/// into a [`Dispatcher`].
#[derive(Debug, Default)]
pub struct Pipeline {
    registry: RegistryBuilder,
    overrides: Vec<OverrideRule>,
    modifies: Vec<ModifyRule>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mock(
        &mut self,
        pattern: impl Into<UrlPattern>,
        response: StagedResponse,
    ) -> Result<&mut Self> {
        self.registry.pre(pattern, Mock::new(response))?;
        Ok(self)
    }

    pub fn map_remote(
        &mut self,
        pattern: impl Into<UrlPattern>,
        target: impl Into<Target>,
    ) -> Result<&mut Self> {
        self.registry.pre(pattern, MapRemote::new(target))?;
        Ok(self)
    }

    /// Like `map_remote`, but a 404 from the target serves the original URL.
    pub fn map_remote_or_source(
        &mut self,
        pattern: impl Into<UrlPattern>,
        target: impl Into<Target>,
    ) -> Result<&mut Self> {
        self.registry.pre(pattern, MapRemote::new(target).with_fallback())?;
        Ok(self)
    }

    pub fn map_local(
        &mut self,
        pattern: impl Into<UrlPattern>,
        target: impl Into<Target>,
    ) -> Result<&mut Self> {
        self.registry.pre(pattern, MapLocal::new(target))?;
        Ok(self)
    }

    /// Like `map_local`, but an unreadable file serves the original URL.
    pub fn map_local_or_source(
        &mut self,
        pattern: impl Into<UrlPattern>,
        target: impl Into<Target>,
    ) -> Result<&mut Self> {
        self.registry.pre(pattern, MapLocal::new(target).with_fallback())?;
        Ok(self)
    }

    pub fn modify_json(
        &mut self,
        pattern: impl Into<UrlPattern>,
        transform: impl JsonTransform + 'static,
    ) -> Result<&mut Self> {
        self.modify(pattern, ModifyTransform::json(transform))
    }

    pub fn modify_js(
        &mut self,
        pattern: impl Into<UrlPattern>,
        transform: impl JsTransform + 'static,
    ) -> Result<&mut Self> {
        self.modify(pattern, ModifyTransform::js(transform))
    }

    pub fn modify_html(
        &mut self,
        pattern: impl Into<UrlPattern>,
        transform: impl HtmlTransform + 'static,
    ) -> Result<&mut Self> {
        self.modify(pattern, ModifyTransform::html(transform))
    }

    /// Rewrite status and headers of matching responses, whatever their
    /// content type.
    pub fn modify_response(
        &mut self,
        pattern: impl Into<UrlPattern>,
        transform: impl ResponseTransform + 'static,
    ) -> Result<&mut Self> {
        self.modify(pattern, ModifyTransform::response(transform))
    }

    fn modify(
        &mut self,
        pattern: impl Into<UrlPattern>,
        transform: ModifyTransform,
    ) -> Result<&mut Self> {
        self.registry.pre(pattern, ModifyHandler::new(transform))?;
        Ok(self)
    }

    pub fn tap<F, Fut>(&mut self, pattern: impl Into<UrlPattern>, callback: F) -> Result<&mut Self>
    where
        F: Fn(TapEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.post(pattern, Tap::new(callback))?;
        Ok(self)
    }

    /// Register a custom pre-phase handler.
    pub fn use_middleware(
        &mut self,
        pattern: impl Into<UrlPattern>,
        middleware: impl Middleware + 'static,
    ) -> Result<&mut Self> {
        self.registry.pre(pattern, middleware)?;
        Ok(self)
    }

    /// Register a custom post-phase observer.
    pub fn use_observer(
        &mut self,
        pattern: impl Into<UrlPattern>,
        observer: impl Observer + 'static,
    ) -> Result<&mut Self> {
        self.registry.post(pattern, observer)?;
        Ok(self)
    }

    pub fn overrides(&mut self, rules: impl IntoIterator<Item = OverrideRule>) -> &mut Self {
        self.overrides.extend(rules);
        self
    }

    pub fn modifies(&mut self, rules: impl IntoIterator<Item = ModifyRule>) -> &mut Self {
        self.modifies.extend(rules);
        self
    }

    /// Validate and compile the override rules and freeze everything.
    pub fn build(self) -> Result<Dispatcher> {
        let overrides = OverrideTable::new(self.overrides)?;
        Ok(Dispatcher::new(
            self.registry.build(),
            overrides,
            ModifyTable::new(self.modifies),
        ))
    }
}
