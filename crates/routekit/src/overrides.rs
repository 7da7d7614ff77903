//! Declarative override rules.
//!
//! An override table is evaluated once per request, after the imperative
//! middleware, and only when none of it decided the outcome. The last
//! registered matching rule wins and there is no fall-through to earlier ones.

use crate::error::{Error, Result};
use crate::metrics;
use crate::mime::mimetype;
use crate::pattern::{has_glob_syntax, CompiledPattern};
use crate::route::{FetchOptions, Headers, PendingRequest, StagedResponse};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideType {
    Local,
    Remote,
    Mock,
}

impl OverrideType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideType::Local => "local",
            OverrideType::Remote => "remote",
            OverrideType::Mock => "mock",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideMode {
    /// Local: serve the file if it exists, otherwise leave the request alone.
    Patch,
    /// Local: serve the file or fail. Remote: fetch the target instead.
    Replace,
    /// Remote: answer with a 302 to the target.
    Redirect,
    /// Remote: answer with the target string as the body.
    Fulfill,
}

impl OverrideMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideMode::Patch => "patch",
            OverrideMode::Replace => "replace",
            OverrideMode::Redirect => "redirect",
            OverrideMode::Fulfill => "fulfill",
        }
    }
}

/// What a predicate pattern decided for a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicateTarget {
    /// Not a match.
    Skip,
    /// Use the rule target as is.
    Verbatim,
    /// Join this path onto the rule target.
    Suffix(String),
}

impl From<bool> for PredicateTarget {
    fn from(matched: bool) -> Self {
        if matched {
            PredicateTarget::Verbatim
        } else {
            PredicateTarget::Skip
        }
    }
}

impl From<String> for PredicateTarget {
    fn from(path: String) -> Self {
        if path.is_empty() {
            PredicateTarget::Skip
        } else {
            PredicateTarget::Suffix(path)
        }
    }
}

impl From<&str> for PredicateTarget {
    fn from(path: &str) -> Self {
        PredicateTarget::from(path.to_string())
    }
}

pub type OverridePredicate = Arc<dyn Fn(&str) -> PredicateTarget + Send + Sync>;

#[derive(Clone)]
pub enum OverridePattern {
    Url(String),
    Predicate(OverridePredicate),
}

impl OverridePattern {
    pub fn predicate<F, T>(f: F) -> Self
    where
        F: Fn(&str) -> T + Send + Sync + 'static,
        T: Into<PredicateTarget>,
    {
        OverridePattern::Predicate(Arc::new(move |url: &str| f(url).into()))
    }
}

impl fmt::Debug for OverridePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverridePattern::Url(s) => write!(f, "Url({s:?})"),
            OverridePattern::Predicate(_) => write!(f, "Predicate(<fn>)"),
        }
    }
}

impl From<&str> for OverridePattern {
    fn from(s: &str) -> Self {
        OverridePattern::Url(s.to_string())
    }
}

impl From<String> for OverridePattern {
    fn from(s: String) -> Self {
        OverridePattern::Url(s)
    }
}

impl<'de> Deserialize<'de> for OverridePattern {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(OverridePattern::Url)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRule {
    pub url_pattern: OverridePattern,
    #[serde(rename = "type")]
    pub kind: OverrideType,
    pub target: String,
    #[serde(default)]
    pub mode: Option<OverrideMode>,
    #[serde(default)]
    pub headers: Option<Headers>,
}

impl OverrideRule {
    pub fn new(url_pattern: impl Into<OverridePattern>, kind: OverrideType, target: &str) -> Self {
        Self {
            url_pattern: url_pattern.into(),
            kind,
            target: target.to_string(),
            mode: None,
            headers: None,
        }
    }

    pub fn mock(url_pattern: impl Into<OverridePattern>, body: &str) -> Self {
        Self::new(url_pattern, OverrideType::Mock, body)
    }

    pub fn local(url_pattern: impl Into<OverridePattern>, dir: &str) -> Self {
        Self::new(url_pattern, OverrideType::Local, dir)
    }

    pub fn remote(url_pattern: impl Into<OverridePattern>, origin: &str) -> Self {
        Self::new(url_pattern, OverrideType::Remote, origin)
    }

    pub fn with_mode(mut self, mode: OverrideMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Reject mode/type combinations that can never apply.
    pub fn validate(&self) -> Result<()> {
        if self.target.is_empty() && self.kind != OverrideType::Mock {
            return Err(Error::InvalidRule(format!(
                "{} override for {:?} has an empty target",
                self.kind.as_str(),
                self.url_pattern
            )));
        }
        let invalid = match (self.kind, self.mode) {
            (OverrideType::Local, Some(OverrideMode::Redirect | OverrideMode::Fulfill)) => true,
            (OverrideType::Remote, Some(OverrideMode::Patch)) => true,
            _ => false,
        };
        if invalid {
            return Err(Error::InvalidRule(format!(
                "mode `{}` is not valid for {} override {:?}",
                self.mode.map(|m| m.as_str()).unwrap_or_default(),
                self.kind.as_str(),
                self.url_pattern
            )));
        }
        Ok(())
    }

    fn effective_mode(&self) -> OverrideMode {
        match (self.kind, self.mode) {
            (_, Some(mode)) => mode,
            (OverrideType::Local, None) => OverrideMode::Patch,
            (_, None) => OverrideMode::Replace,
        }
    }
}

enum UrlMatcher {
    Exact(String),
    Prefix(String),
    Glob(CompiledPattern),
}

impl UrlMatcher {
    fn compile(pattern: &str) -> Result<Self> {
        if pattern.ends_with('/') {
            Ok(UrlMatcher::Prefix(pattern.to_string()))
        } else if has_glob_syntax(pattern) {
            Ok(UrlMatcher::Glob(CompiledPattern::compile(pattern)?))
        } else {
            Ok(UrlMatcher::Exact(pattern.to_string()))
        }
    }
}

enum RuleMatcher {
    Url {
        matcher: UrlMatcher,
        /// Compared against the path instead of the full URL.
        path_only: bool,
    },
    Predicate(OverridePredicate),
}

struct CompiledOverride {
    matcher: RuleMatcher,
    rule: OverrideRule,
}

/// The parts of a request URL the resolver works with.
struct RequestUrl<'a> {
    full: &'a str,
    clean: &'a str,
    path: String,
    query: Option<&'a str>,
}

impl<'a> RequestUrl<'a> {
    fn parse(url: &'a str) -> Self {
        let (clean, query) = match url.split_once('?') {
            Some((clean, query)) => (clean, Some(query)),
            None => (url, None),
        };
        let path = Url::parse(clean)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| clean.to_string());
        Self {
            full: url,
            clean,
            path,
            query,
        }
    }
}

impl CompiledOverride {
    fn compile(rule: OverrideRule) -> Result<Self> {
        rule.validate()?;
        let matcher = match &rule.url_pattern {
            OverridePattern::Url(pattern) => RuleMatcher::Url {
                matcher: UrlMatcher::compile(pattern)?,
                path_only: pattern.starts_with('/'),
            },
            OverridePattern::Predicate(f) => RuleMatcher::Predicate(f.clone()),
        };
        Ok(Self { matcher, rule })
    }

    fn matches(&self, url: &RequestUrl<'_>) -> bool {
        match &self.matcher {
            RuleMatcher::Url { matcher, path_only } => {
                let subject = if *path_only { url.path.as_str() } else { url.full };
                match matcher {
                    UrlMatcher::Exact(p) => {
                        subject == p || (!*path_only && url.clean == p)
                    }
                    UrlMatcher::Prefix(p) => subject.starts_with(p.as_str()),
                    UrlMatcher::Glob(g) => g.matches(subject),
                }
            }
            RuleMatcher::Predicate(f) => f(url.full) != PredicateTarget::Skip,
        }
    }

    /// Where a local/remote rule points for this URL. `None` aborts the rule.
    fn resolve_target(&self, url: &RequestUrl<'_>) -> Option<String> {
        let join = |suffix: &str| match self.rule.kind {
            OverrideType::Remote => join_url(&self.rule.target, suffix),
            _ => join_path(&self.rule.target, suffix)
                .to_string_lossy()
                .into_owned(),
        };
        match &self.matcher {
            RuleMatcher::Url {
                matcher: UrlMatcher::Prefix(prefix),
                path_only,
            } => {
                let subject = if *path_only { url.path.as_str() } else { url.clean };
                let remainder = subject.strip_prefix(prefix.as_str()).unwrap_or_default();
                Some(join(remainder))
            }
            RuleMatcher::Url { .. } => Some(self.rule.target.clone()),
            RuleMatcher::Predicate(f) => match f(url.clean) {
                PredicateTarget::Skip => None,
                PredicateTarget::Verbatim => Some(self.rule.target.clone()),
                PredicateTarget::Suffix(path) => Some(join(&path)),
            },
        }
    }
}

/// Join a path onto a base URL with exactly one separator.
fn join_url(base: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path)
}

fn join_path(base: &str, path: &str) -> PathBuf {
    Path::new(base).join(path.trim_start_matches('/'))
}

/// Reattach the request query to a remote target.
fn with_query(target: &str, query: Option<&str>) -> String {
    let Some(query) = query.filter(|q| !q.is_empty()) else {
        return target.to_string();
    };
    match Url::parse(target) {
        Ok(mut url) => {
            url.set_query(Some(query));
            url.to_string()
        }
        Err(_) => format!("{target}?{query}"),
    }
}

/// Compiled override rules in registration order.
#[derive(Default)]
pub struct OverrideTable {
    rules: Vec<CompiledOverride>,
}

impl fmt::Debug for OverrideTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverrideTable")
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl OverrideTable {
    pub fn new(rules: impl IntoIterator<Item = OverrideRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(CompiledOverride::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Stage the winning rule's response on `ctx`.
    ///
    /// Returns whether a rule was applied. Only a failed local `replace`
    /// surfaces an error; other misses leave the request untouched.
    pub async fn apply(&self, ctx: &mut PendingRequest) -> Result<bool> {
        let source = ctx.url().to_string();
        let url = RequestUrl::parse(&source);

        let Some(winner) = self.rules.iter().rev().find(|r| r.matches(&url)) else {
            return Ok(false);
        };
        let rule = &winner.rule;
        debug!("Override {:?} selected for {}", rule.url_pattern, source);

        if rule.kind == OverrideType::Mock {
            let mut patch = StagedResponse::new().status(200).body(rule.target.clone());
            if let Some(headers) = &rule.headers {
                patch = patch.headers(headers.clone());
            }
            ctx.fulfill(patch);
            metrics::record_override("mock", "fulfill");
            return Ok(true);
        }

        let Some(target) = winner.resolve_target(&url) else {
            return Ok(false);
        };
        let mode = rule.effective_mode();

        let applied = match rule.kind {
            OverrideType::Local => serve_local(ctx, &target, mode).await?,
            _ => serve_remote(ctx, rule, &target, url.query, mode).await,
        };
        if applied {
            metrics::record_override(rule.kind.as_str(), mode.as_str());
        }
        Ok(applied)
    }
}

async fn serve_local(ctx: &mut PendingRequest, target: &str, mode: OverrideMode) -> Result<bool> {
    let path = PathBuf::from(target);
    if mode == OverrideMode::Patch && !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        debug!("No local file {} for {}", path.display(), ctx.url());
        return Ok(false);
    }

    let body = tokio::fs::read(&path)
        .await
        .map_err(|source| Error::LocalRead {
            path: path.clone(),
            source,
        })?;
    info!("PATCH {} >>> {}", ctx.url(), path.display());
    ctx.fulfill(
        StagedResponse::new()
            .status(200)
            .body(body)
            .content_type(mimetype(&path)),
    );
    Ok(true)
}

async fn serve_remote(
    ctx: &mut PendingRequest,
    rule: &OverrideRule,
    target: &str,
    query: Option<&str>,
    mode: OverrideMode,
) -> bool {
    match mode {
        OverrideMode::Redirect => {
            let location = with_query(target, query);
            info!("REDIRECT {} >>> {}", ctx.url(), location);
            ctx.fulfill(StagedResponse::new().status(302).header("location", location));
            true
        }
        OverrideMode::Fulfill => {
            let mut patch = StagedResponse::new().status(200).body(target.to_string());
            if let Some(headers) = &rule.headers {
                patch = patch.headers(headers.clone());
            }
            ctx.fulfill(patch);
            true
        }
        _ => {
            let target_url = with_query(target, query);
            // the memoized response belongs to the source URL
            if ctx.refetch(FetchOptions::url(target_url.as_str())).await.is_none() {
                warn!("Failed to fetch {} for {}", target_url, ctx.url());
                ctx.discard();
                return false;
            }
            let Some(response) = ctx.real_response().cloned() else {
                ctx.discard();
                return false;
            };
            if !response.ok() {
                warn!("Failed to fetch {} status {}", target_url, response.status);
                ctx.discard();
                return false;
            }

            info!("PATCH {} >>> {}", ctx.url(), target_url);
            let mut patch = StagedResponse::new()
                .status(response.status)
                .body(response.body.clone());
            if let Some(content_type) = response.content_type() {
                patch = patch.content_type(content_type);
            }
            ctx.fulfill(patch);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::testing::FakeRoute;
    use crate::route::UpstreamResponse;
    use std::io::Write;

    async fn run(table: &OverrideTable, route: Arc<FakeRoute>) -> (PendingRequest, Result<bool>) {
        let mut ctx = PendingRequest::new(route);
        let result = table.apply(&mut ctx).await;
        (ctx, result)
    }

    #[tokio::test]
    async fn test_last_matching_rule_wins() {
        let table = OverrideTable::new([
            OverrideRule::mock("https://x/a", "OLD"),
            OverrideRule::mock("https://x/a", "NEW"),
        ])
        .unwrap();
        let route = FakeRoute::new("https://x/a");
        let (ctx, result) = run(&table, route.clone()).await;

        assert!(result.unwrap());
        assert_eq!(ctx.staged().text(), "NEW");
        assert_eq!(ctx.staged().status, Some(200));
        assert_eq!(route.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_carries_rule_headers() {
        let headers = Headers::from([("x-mocked".to_string(), "1".to_string())]);
        let rule = OverrideRule::mock("**/api/*", "{}").with_headers(headers);
        let table = OverrideTable::new([rule]).unwrap();
        let (ctx, _) = run(&table, FakeRoute::new("https://x/api/user")).await;

        let staged = ctx.staged();
        assert_eq!(staged.headers.as_ref().unwrap().get("x-mocked").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_no_match_leaves_request_alone() {
        let table = OverrideTable::new([OverrideRule::mock("https://x/a", "A")]).unwrap();
        let (ctx, result) = run(&table, FakeRoute::new("https://x/b")).await;
        assert!(!result.unwrap());
        assert!(!ctx.is_decided());
    }

    #[tokio::test]
    async fn test_local_prefix_mapping_serves_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("app.js")).unwrap();
        file.write_all(b"var x=1;").unwrap();

        let rule = OverrideRule::local("https://x/static/", dir.path().to_str().unwrap())
            .with_mode(OverrideMode::Patch);
        let table = OverrideTable::new([rule]).unwrap();
        let (ctx, result) = run(&table, FakeRoute::new("https://x/static/app.js?v=3")).await;

        assert!(result.unwrap());
        assert_eq!(ctx.staged().text(), "var x=1;");
        assert!(ctx.staged().content_type.as_deref().unwrap().contains("javascript"));
    }

    #[tokio::test]
    async fn test_local_patch_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let rule = OverrideRule::local("https://x/static/", dir.path().to_str().unwrap())
            .with_mode(OverrideMode::Patch);
        let table = OverrideTable::new([rule]).unwrap();
        let (ctx, result) = run(&table, FakeRoute::new("https://x/static/missing.js")).await;

        assert!(!result.unwrap());
        assert!(!ctx.is_decided());
    }

    #[tokio::test]
    async fn test_local_without_mode_behaves_as_patch() {
        let dir = tempfile::tempdir().unwrap();
        let rule = OverrideRule::local("https://x/static/", dir.path().to_str().unwrap());
        let table = OverrideTable::new([rule]).unwrap();
        let (_, result) = run(&table, FakeRoute::new("https://x/static/missing.js")).await;
        assert!(!result.unwrap());
    }

    #[tokio::test]
    async fn test_local_replace_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let rule = OverrideRule::local("https://x/static/", dir.path().to_str().unwrap())
            .with_mode(OverrideMode::Replace);
        let table = OverrideTable::new([rule]).unwrap();
        let (_, result) = run(&table, FakeRoute::new("https://x/static/missing.js")).await;

        assert!(matches!(result, Err(Error::LocalRead { .. })));
    }

    #[tokio::test]
    async fn test_remote_redirect_keeps_query() {
        let rule = OverrideRule::remote("https://x/api/", "https://staging.x/api")
            .with_mode(OverrideMode::Redirect);
        let table = OverrideTable::new([rule]).unwrap();
        let route = FakeRoute::new("https://x/api/users?page=2");
        let (ctx, result) = run(&table, route.clone()).await;

        assert!(result.unwrap());
        let staged = ctx.staged();
        assert_eq!(staged.status, Some(302));
        assert_eq!(
            staged.headers.as_ref().unwrap().get("location").unwrap(),
            "https://staging.x/api/users?page=2"
        );
        assert!(ctx.is_decided());
        assert_eq!(route.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_fulfill_uses_target_as_body() {
        let rule =
            OverrideRule::remote("https://x/flag", "enabled").with_mode(OverrideMode::Fulfill);
        let table = OverrideTable::new([rule]).unwrap();
        let (ctx, _) = run(&table, FakeRoute::new("https://x/flag")).await;
        assert_eq!(ctx.staged().text(), "enabled");
    }

    #[tokio::test]
    async fn test_remote_replace_fetches_target() {
        let rule = OverrideRule::remote("https://x/api/", "https://staging.x/v2/");
        let table = OverrideTable::new([rule]).unwrap();
        let route = FakeRoute::new("https://x/api/users?id=7").upstream_for(
            "https://staging.x/v2/users?id=7",
            UpstreamResponse::new(201, "[]").with_header("content-type", "application/json"),
        );
        let (ctx, result) = run(&table, route.clone()).await;

        assert!(result.unwrap());
        let staged = ctx.staged();
        assert_eq!(staged.status, Some(201));
        assert_eq!(staged.text(), "[]");
        assert_eq!(staged.content_type.as_deref(), Some("application/json"));
        assert_eq!(route.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_remote_replace_non_2xx_is_abandoned() {
        let rule = OverrideRule::remote("https://x/api/", "https://staging.x/api/");
        let table = OverrideTable::new([rule]).unwrap();
        let route = FakeRoute::new("https://x/api/users")
            .upstream_for("https://staging.x/api/users", UpstreamResponse::new(503, "down"));
        let (ctx, result) = run(&table, route).await;

        assert!(!result.unwrap());
        assert!(!ctx.is_decided());
        assert!(ctx.real_response().is_none());
    }

    #[tokio::test]
    async fn test_path_pattern_matches_any_origin() {
        let table = OverrideTable::new([OverrideRule::mock("/health", "ok")]).unwrap();
        let (ctx, _) = run(&table, FakeRoute::new("https://a.example/health?x=1")).await;
        assert_eq!(ctx.staged().text(), "ok");
    }

    #[tokio::test]
    async fn test_predicate_suffix_joins_target() {
        let rule = OverrideRule::remote(
            OverridePattern::predicate(|url: &str| {
                url.strip_prefix("https://x/assets/")
                    .map(|rest| rest.to_string())
                    .unwrap_or_default()
            }),
            "https://cdn.x/",
        )
        .with_mode(OverrideMode::Redirect);
        let table = OverrideTable::new([rule]).unwrap();

        let (ctx, result) = run(&table, FakeRoute::new("https://x/assets/logo.png")).await;
        assert!(result.unwrap());
        assert_eq!(
            ctx.staged().headers.as_ref().unwrap().get("location").unwrap(),
            "https://cdn.x/logo.png"
        );

        let (_, result) = run(&table, FakeRoute::new("https://x/other.png")).await;
        assert!(!result.unwrap());
    }

    #[test]
    fn test_validate_rejects_impossible_modes() {
        let rule = OverrideRule::local("https://x/", "./dist").with_mode(OverrideMode::Redirect);
        assert!(matches!(rule.validate(), Err(Error::InvalidRule(_))));

        let rule = OverrideRule::remote("https://x/", "https://y/").with_mode(OverrideMode::Patch);
        assert!(rule.validate().is_err());

        assert!(OverrideRule::remote("https://x/", "").validate().is_err());
        assert!(OverrideRule::mock("https://x/", "").validate().is_ok());
    }

    #[test]
    fn test_rule_deserializes_from_yaml() {
        let yaml = r#"
urlPattern: "https://x/static/"
type: local
target: ./dist
mode: replace
"#;
        let rule: OverrideRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.kind, OverrideType::Local);
        assert_eq!(rule.mode, Some(OverrideMode::Replace));
        assert!(matches!(
            rule.url_pattern,
            OverridePattern::Url(ref p) if p == "https://x/static/"
        ));
    }

    #[test]
    fn test_join_helpers() {
        assert_eq!(join_url("https://y/api/", "/users"), "https://y/api/users");
        assert_eq!(join_url("https://y/api", ""), "https://y/api");
        assert_eq!(join_path("./dist", "/js/app.js"), PathBuf::from("./dist/js/app.js"));
        assert_eq!(with_query("https://y/a", Some("b=1")), "https://y/a?b=1");
        assert_eq!(with_query("https://y/a", None), "https://y/a");
    }
}
