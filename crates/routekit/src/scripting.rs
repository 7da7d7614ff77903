//! Rhai-scripted body transforms for modify rules loaded from config files.
//!
//! The script sees the decoded body as `body` (a map/array/value for JSON,
//! a string for JavaScript) and its final expression becomes the new body.
//! Response scripts see `response` as `#{status, headers}` and return it.

use crate::modify::{JsTransform, JsonTransform, ResponseParts, ResponseTransform};
use anyhow::{anyhow, Result};
use futures::future::{self, BoxFuture};
use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::Value;
use std::sync::Arc;

/// Upper bound on operations per script run, so a runaway loop fails the
/// rule instead of stalling the request.
const MAX_OPERATIONS: u64 = 1_000_000;

/// A compiled transform script.
#[derive(Clone)]
pub struct ScriptTransform {
    engine: Arc<Engine>,
    ast: Arc<AST>,
    name: String,
}

impl ScriptTransform {
    pub fn compile(script: &str, name: impl Into<String>) -> Result<Self> {
        let engine = Self::create_engine();
        let ast = engine
            .compile(script)
            .map_err(|e| anyhow!("Failed to compile script: {e}"))?;
        Ok(Self {
            engine: Arc::new(engine),
            ast: Arc::new(ast),
            name: name.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn create_engine() -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.on_print(|text| tracing::info!("[script] {}", text));
        engine.on_debug(|text, _, pos| tracing::debug!("[script {:?}] {}", pos, text));
        engine
    }

    fn eval(&self, var: &'static str, input: Dynamic) -> Result<Dynamic> {
        let mut scope = Scope::new();
        scope.push(var, input);
        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|e| anyhow!("script `{}` failed: {e}", self.name))
    }

    pub fn eval_json(&self, value: Value) -> Result<Value> {
        let input = rhai::serde::to_dynamic(value).map_err(|e| anyhow!("{e}"))?;
        let output = self.eval("body", input)?;
        rhai::serde::from_dynamic::<Value>(&output)
            .map_err(|e| anyhow!("script `{}` returned a non-JSON value: {e}", self.name))
    }

    pub fn eval_text(&self, source: String) -> Result<String> {
        let output = self.eval("body", Dynamic::from(source))?;
        output
            .into_string()
            .map_err(|ty| anyhow!("script `{}` returned {ty}, expected a string", self.name))
    }

    pub fn eval_response(&self, parts: ResponseParts) -> Result<ResponseParts> {
        let input = rhai::serde::to_dynamic(parts).map_err(|e| anyhow!("{e}"))?;
        let output = self.eval("response", input)?;
        rhai::serde::from_dynamic::<ResponseParts>(&output)
            .map_err(|e| anyhow!("script `{}` returned a malformed response: {e}", self.name))
    }
}

impl JsonTransform for ScriptTransform {
    fn transform(&self, value: Value) -> BoxFuture<'static, Result<Value>> {
        Box::pin(future::ready(self.eval_json(value)))
    }
}

impl JsTransform for ScriptTransform {
    fn transform(&self, source: String) -> BoxFuture<'static, Result<String>> {
        Box::pin(future::ready(self.eval_text(source)))
    }
}

impl ResponseTransform for ScriptTransform {
    fn transform(&self, parts: ResponseParts) -> BoxFuture<'static, Result<ResponseParts>> {
        Box::pin(future::ready(self.eval_response(parts)))
    }
}
