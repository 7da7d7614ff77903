//! Cookies observed by the session, saved as its storage state.
//!
//! `Max-Age` and `Expires` are honoured: a cookie whose expiry has passed is
//! never sent, and receiving one deletes any stored cookie it replaces.
//! Session cookies live as long as the jar and are not saved.

use crate::error::Result;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// `None` for a session cookie.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl StoredCookie {
    /// Parse one `Set-Cookie` line received from `url`.
    pub fn parse(line: &str, url: &Url) -> Option<Self> {
        Self::parse_at(line, url, Utc::now())
    }

    fn parse_at(line: &str, url: &Url, now: DateTime<Utc>) -> Option<Self> {
        let mut parts = line.split(';');
        let (name, value) = parts.next()?.trim().split_once('=')?;
        if name.is_empty() {
            return None;
        }

        let mut cookie = StoredCookie {
            name: name.to_string(),
            value: value.to_string(),
            domain: url.host_str()?.to_ascii_lowercase(),
            path: "/".to_string(),
            expires: None,
        };
        let mut max_age = None;
        for attr in parts {
            let Some((key, val)) = attr.trim().split_once('=') else {
                continue;
            };
            let val = val.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "domain" => cookie.domain = val.trim_start_matches('.').to_ascii_lowercase(),
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "expires" => cookie.expires = parse_http_date(val).or(cookie.expires),
                "max-age" => max_age = val.parse::<i64>().ok().or(max_age),
                _ => {}
            }
        }
        // Max-Age wins over Expires
        if let Some(seconds) = max_age {
            cookie.expires = Some(if seconds <= 0 {
                DateTime::<Utc>::MIN_UTC
            } else {
                now + Duration::seconds(seconds.min(MAX_AGE_CAP))
            });
        }
        Some(cookie)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    fn applies_to(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = host == self.domain || host.ends_with(&format!(".{}", self.domain));
        domain_ok && url.path().starts_with(&self.path)
    }
}

/// Upper bound on `Max-Age`, matching what browsers clamp to (400 days).
const MAX_AGE_CAP: i64 = 400 * 24 * 60 * 60;

/// `Expires` values: RFC 1123 dates plus the dashed legacy form.
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%a, %d-%b-%Y %H:%M:%S GMT")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// On-disk storage state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
}

#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: RwLock<Vec<StoredCookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&self, path: &Path) -> Result<()> {
        let text = tokio::fs::read_to_string(path).await?;
        let mut state: StorageState = serde_json::from_str(&text)?;
        let now = Utc::now();
        state.cookies.retain(|c| !c.is_expired(now));
        debug!("Loaded {} cookies from {}", state.cookies.len(), path.display());
        *self.cookies.write() = state.cookies;
        Ok(())
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let mut state = self.snapshot();
        state.cookies.retain(|c| c.expires.is_some());
        let text = serde_json::to_string_pretty(&state)?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    /// Cookies still alive now.
    pub fn snapshot(&self) -> StorageState {
        let now = Utc::now();
        StorageState {
            cookies: self
                .cookies
                .read()
                .iter()
                .filter(|c| !c.is_expired(now))
                .cloned()
                .collect(),
        }
    }

    /// Record `Set-Cookie` lines (newline separated) received from `url`.
    /// An already expired cookie only deletes the one it replaces.
    pub fn record(&self, url: &str, set_cookie: &str) {
        let Ok(url) = Url::parse(url) else {
            return;
        };
        let now = Utc::now();
        let mut cookies = self.cookies.write();
        for line in set_cookie.lines() {
            let Some(cookie) = StoredCookie::parse_at(line, &url, now) else {
                continue;
            };
            cookies.retain(|c| {
                !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
            });
            if cookie.is_expired(now) {
                debug!("Deleted cookie {} for {}", cookie.name, cookie.domain);
            } else {
                cookies.push(cookie);
            }
        }
    }

    /// `Cookie` header value for a request to `url`, if any cookie applies.
    pub fn header_for(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let now = Utc::now();
        let cookies = self.cookies.read();
        let pairs: Vec<String> = cookies
            .iter()
            .filter(|c| c.applies_to(&url) && !c.is_expired(now))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }
}
