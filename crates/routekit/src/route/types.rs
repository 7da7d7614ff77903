//! Request/response value types shared by routes, handlers and the dispatcher.

use bytes::Bytes;
use std::collections::BTreeMap;

/// Header map with lower-cased names. Repeated headers are joined.
pub type Headers = BTreeMap<String, String>;

pub const CONTENT_TYPE: &str = "content-type";

/// What the browsing session reported about an intercepted request.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl RequestInfo {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Overrides for an upstream fetch. Unset fields reuse the intercepted request.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: Option<Headers>,
}

impl FetchOptions {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

/// A real response retrieved from the network.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Status in the 2xx range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).map(String::as_str)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Accumulated fulfillment payload for one request.
///
/// Also used as a partial update: `PendingRequest::fulfill` replaces only the
/// fields that are set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedResponse {
    pub status: Option<u16>,
    pub headers: Option<Headers>,
    pub content_type: Option<String>,
    pub body: Option<Bytes>,
}

impl StagedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Shallow merge: every field set on `patch` replaces ours.
    pub fn merge(&mut self, patch: StagedResponse) {
        if patch.status.is_some() {
            self.status = patch.status;
        }
        if patch.headers.is_some() {
            self.headers = patch.headers;
        }
        if patch.content_type.is_some() {
            self.content_type = patch.content_type;
        }
        if patch.body.is_some() {
            self.body = patch.body;
        }
    }

    pub fn has_body(&self) -> bool {
        self.body.as_ref().is_some_and(|b| !b.is_empty())
    }

    /// Explicit content type, falling back to the staged `content-type` header.
    pub fn effective_content_type(&self) -> Option<&str> {
        self.content_type.as_deref().or_else(|| {
            self.headers
                .as_ref()
                .and_then(|h| h.get(CONTENT_TYPE))
                .map(String::as_str)
        })
    }

    pub fn text(&self) -> String {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }
}

/// The payload handed to the session when a request is fulfilled.
#[derive(Debug, Clone, PartialEq)]
pub struct FulfillResponse {
    pub status: u16,
    pub headers: Headers,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// How a request left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Fulfilled,
    Continued,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Fulfilled => "fulfilled",
            Outcome::Continued => "continued",
        }
    }
}

/// The response a request was resolved with, as seen by post-phase observers.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedResponse {
    pub url: String,
    pub outcome: Outcome,
    pub status: u16,
    pub headers: Headers,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl CommittedResponse {
    pub fn fulfilled(url: &str, response: FulfillResponse) -> Self {
        let content_type = response
            .content_type
            .or_else(|| response.headers.get(CONTENT_TYPE).cloned());
        Self {
            url: url.to_string(),
            outcome: Outcome::Fulfilled,
            status: response.status,
            headers: response.headers,
            content_type,
            body: response.body,
        }
    }

    pub fn continued(url: &str, response: UpstreamResponse) -> Self {
        Self {
            url: url.to_string(),
            outcome: Outcome::Continued,
            status: response.status,
            content_type: response.content_type().map(str::to_string),
            headers: response.headers,
            body: response.body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_replaces_only_provided_fields() {
        let mut staged = StagedResponse::new()
            .status(404)
            .body("original")
            .content_type("text/plain");
        staged.merge(StagedResponse::new().body("patched"));

        assert_eq!(staged.status, Some(404));
        assert_eq!(staged.content_type.as_deref(), Some("text/plain"));
        assert_eq!(staged.text(), "patched");
    }

    #[test]
    fn test_empty_body_is_not_a_body() {
        assert!(!StagedResponse::new().body("").has_body());
        assert!(!StagedResponse::new().has_body());
        assert!(StagedResponse::new().body("x").has_body());
    }

    #[test]
    fn test_effective_content_type_prefers_explicit() {
        let staged = StagedResponse::new()
            .header("Content-Type", "text/html")
            .content_type("application/json");
        assert_eq!(staged.effective_content_type(), Some("application/json"));

        let staged = StagedResponse::new().header("Content-Type", "text/html");
        assert_eq!(staged.effective_content_type(), Some("text/html"));
    }

    #[test]
    fn test_upstream_ok_range() {
        assert!(UpstreamResponse::new(204, "").ok());
        assert!(!UpstreamResponse::new(302, "").ok());
        assert!(!UpstreamResponse::new(500, "").ok());
    }

    #[test]
    fn test_committed_fulfilled_takes_header_content_type() {
        let committed = CommittedResponse::fulfilled(
            "https://x/",
            FulfillResponse {
                status: 200,
                headers: Headers::from([(CONTENT_TYPE.to_string(), "text/css".to_string())]),
                content_type: None,
                body: Bytes::from_static(b"a{}"),
            },
        );
        assert_eq!(committed.content_type.as_deref(), Some("text/css"));
        assert_eq!(committed.outcome, Outcome::Fulfilled);
    }
}
