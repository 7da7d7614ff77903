//! URL pattern compilation.
//!
//! A pattern is a glob string, a regular expression or a predicate over the
//! parsed URL. Every form is compiled once, at registration time, into a
//! [`CompiledPattern`] whose `matches` is a pure boolean test.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Characters escaped when they appear literally in a glob.
const ESCAPED_CHARS: &[char] = &[
    '$', '^', '+', '.', '*', '(', ')', '|', '\\', '?', '{', '}', '[', ']',
];

/// Regex fragment for a `**` segment wildcard (consumes the trailing `/`).
const DEEP_WILDCARD: &str = "((?:[^/]*(?:/|$))*)";

/// Predicate over a parsed request URL.
pub type UrlPredicate = Arc<dyn Fn(&Url) -> bool + Send + Sync>;

/// A pattern as supplied by the integrator.
#[derive(Clone)]
pub enum UrlPattern {
    Glob(String),
    /// Unanchored regular expression tested against the full URL.
    Regex(String),
    Predicate(UrlPredicate),
}

impl UrlPattern {
    pub fn glob(glob: impl Into<String>) -> Self {
        UrlPattern::Glob(glob.into())
    }

    pub fn regex(regex: impl Into<String>) -> Self {
        UrlPattern::Regex(regex.into())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Url) -> bool + Send + Sync + 'static,
    {
        UrlPattern::Predicate(Arc::new(f))
    }
}

impl fmt::Debug for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlPattern::Glob(g) => f.debug_tuple("Glob").field(g).finish(),
            UrlPattern::Regex(r) => f.debug_tuple("Regex").field(r).finish(),
            UrlPattern::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<&str> for UrlPattern {
    fn from(glob: &str) -> Self {
        UrlPattern::Glob(glob.to_string())
    }
}

impl From<String> for UrlPattern {
    fn from(glob: String) -> Self {
        UrlPattern::Glob(glob)
    }
}

impl From<Regex> for UrlPattern {
    fn from(regex: Regex) -> Self {
        UrlPattern::Regex(regex.as_str().to_string())
    }
}

/// Config-file form: a bare string is a glob, `{ regex: ... }` is a regex.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawPattern {
    Glob(String),
    Regex { regex: String },
}

impl<'de> Deserialize<'de> for UrlPattern {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match RawPattern::deserialize(deserializer)? {
            RawPattern::Glob(glob) => UrlPattern::Glob(glob),
            RawPattern::Regex { regex } => UrlPattern::Regex(regex),
        })
    }
}

enum Matcher {
    Regex(Regex),
    Predicate(UrlPredicate),
}

/// A pattern normalized to a single boolean URL test.
#[derive(Clone)]
pub struct CompiledPattern {
    source: String,
    matcher: Arc<Matcher>,
}

impl CompiledPattern {
    /// Compile a pattern. Invalid glob or regex syntax fails here, never per request.
    pub fn compile(pattern: impl Into<UrlPattern>) -> Result<Self> {
        match pattern.into() {
            UrlPattern::Glob(glob) => {
                let regex = compile_glob(&glob)?;
                Ok(Self {
                    source: glob,
                    matcher: Arc::new(Matcher::Regex(regex)),
                })
            }
            UrlPattern::Regex(source) => {
                let regex = Regex::new(&source).map_err(|e| Error::PatternCompile {
                    pattern: source.clone(),
                    source: e,
                })?;
                Ok(Self {
                    source: format!("/{source}/"),
                    matcher: Arc::new(Matcher::Regex(regex)),
                })
            }
            UrlPattern::Predicate(predicate) => Ok(Self {
                source: "<predicate>".to_string(),
                matcher: Arc::new(Matcher::Predicate(predicate)),
            }),
        }
    }

    /// Catch-all pattern.
    pub fn any() -> Self {
        Self {
            source: "**".to_string(),
            matcher: Arc::new(Matcher::Predicate(Arc::new(|_: &Url| true))),
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        match self.matcher.as_ref() {
            Matcher::Regex(regex) => regex.is_match(url),
            Matcher::Predicate(predicate) => match Url::parse(url) {
                Ok(parsed) => predicate(&parsed),
                Err(_) => false,
            },
        }
    }

    /// Human-readable form used in log lines.
    pub fn describe(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for CompiledPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledPattern")
            .field("source", &self.source)
            .finish()
    }
}

/// Compile a glob into an anchored regex.
pub fn compile_glob(glob: &str) -> Result<Regex> {
    Regex::new(&glob_to_regex(glob)).map_err(|e| Error::PatternCompile {
        pattern: glob.to_string(),
        source: e,
    })
}

/// Translate a URL glob into regex source.
///
/// `*` stays within one path segment, `**` between separators (or at either
/// end) spans segments, `?` is any single character, `{a,b}` alternates and
/// `[...]` passes through as a character class. A backslash escapes the next
/// character.
pub fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut in_group = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\\' && i + 1 < chars.len() {
            i += 1;
            let escaped = chars[i];
            if ESCAPED_CHARS.contains(&escaped) {
                out.push('\\');
            }
            out.push(escaped);
            i += 1;
            continue;
        }

        if c == '*' {
            let before = i.checked_sub(1).map(|p| chars[p]);
            let mut star_count = 1;
            while chars.get(i + 1) == Some(&'*') {
                star_count += 1;
                i += 1;
            }
            let after = chars.get(i + 1).copied();
            let is_deep = star_count > 1
                && matches!(before, None | Some('/'))
                && matches!(after, None | Some('/'));
            if is_deep {
                out.push_str(DEEP_WILDCARD);
                i += 1;
            } else {
                out.push_str("([^/]*)");
            }
            i += 1;
            continue;
        }

        match c {
            '?' => out.push('.'),
            '[' | ']' => out.push(c),
            '{' => {
                in_group = true;
                out.push('(');
            }
            '}' => {
                in_group = false;
                out.push(')');
            }
            ',' if in_group => out.push('|'),
            _ => {
                if ESCAPED_CHARS.contains(&c) {
                    out.push('\\');
                }
                out.push(c);
            }
        }
        i += 1;
    }

    out.push('$');
    out
}

/// True when a string uses any glob syntax and cannot be an exact URL.
pub fn has_glob_syntax(pattern: &str) -> bool {
    pattern.contains(&['*', '?', '{', '['][..])
}
