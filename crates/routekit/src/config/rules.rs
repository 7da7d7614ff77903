//! Modify rules as written in config files.

use crate::error::Result;
use crate::modify::{ModifyRule, ModifyTransform, RemoveElements};
use crate::pattern::UrlPattern;
use crate::scripting::ScriptTransform;
use crate::Error;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyRuleConfig {
    pub url_patterns: Vec<UrlPattern>,
    #[serde(flatten)]
    pub transform: TransformConfig,
    /// Content type staged after the transform succeeds.
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Exactly one transform per rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformConfig {
    /// Rhai script over the decoded JSON body
    Json(String),
    /// Rhai script over the JavaScript source
    Js(String),
    Html(HtmlEdit),
    /// Rhai script over `response`, a `#{status, headers}` map
    Response(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct HtmlEdit {
    /// CSS selectors of elements to drop
    #[serde(default)]
    pub remove: Vec<String>,
}

impl ModifyRuleConfig {
    /// Compile patterns and scripts. `index` only names the rule in errors.
    pub fn compile(&self, index: usize) -> Result<ModifyRule> {
        let name = format!("modifies[{index}]");
        let transform = match &self.transform {
            TransformConfig::Json(script) => {
                ModifyTransform::json(compile_script(script, &name)?)
            }
            TransformConfig::Js(script) => ModifyTransform::js(compile_script(script, &name)?),
            TransformConfig::Html(edit) => ModifyTransform::html(
                RemoveElements::new(edit.remove.as_slice())
                    .map_err(|e| Error::InvalidRule(format!("{name}: {e}")))?,
            ),
            TransformConfig::Response(script) => {
                ModifyTransform::response(compile_script(script, &name)?)
            }
        };

        let rule = ModifyRule::new(self.url_patterns.clone(), transform)?;
        Ok(match &self.content_type {
            Some(content_type) => rule.with_content_type(content_type.clone()),
            None => rule,
        })
    }
}

fn compile_script(script: &str, name: &str) -> Result<ScriptTransform> {
    ScriptTransform::compile(script, name).map_err(|e| Error::Script(format!("{name}: {e}")))
}
