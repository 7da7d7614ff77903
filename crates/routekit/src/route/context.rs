use super::types::{
    FetchOptions, FulfillResponse, Outcome, RequestInfo, StagedResponse, UpstreamResponse,
};
use super::InterceptedRoute;
use crate::metrics;
use std::sync::Arc;
use tracing::debug;

/// Lifecycle of a single intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Intercepted,
    Fetching,
    Staged,
    Fulfilled,
    Continued,
}

/// Mutable per-request state shared by the pre-phase handlers.
///
/// The context only stages: it never resolves the route. At most one upstream
/// round trip is made through `fetch`, however many handlers ask for it.
pub struct PendingRequest {
    route: Arc<dyn InterceptedRoute>,
    source_url: String,
    real_response: Option<UpstreamResponse>,
    fetch_attempted: bool,
    staged: StagedResponse,
    /// A handler staged a status explicitly (mock, redirect, local file).
    explicit: bool,
    state: RequestState,
}

impl PendingRequest {
    pub fn new(route: Arc<dyn InterceptedRoute>) -> Self {
        let source_url = route.request().url.clone();
        Self {
            route,
            source_url,
            real_response: None,
            fetch_attempted: false,
            staged: StagedResponse::default(),
            explicit: false,
            state: RequestState::Intercepted,
        }
    }

    pub fn url(&self) -> &str {
        &self.source_url
    }

    pub fn request(&self) -> &RequestInfo {
        self.route.request()
    }

    pub fn staged(&self) -> &StagedResponse {
        &self.staged
    }

    pub fn real_response(&self) -> Option<&UpstreamResponse> {
        self.real_response.as_ref()
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_committed(&self) -> bool {
        matches!(
            self.state,
            RequestState::Fulfilled | RequestState::Continued
        )
    }

    /// Whether the staged payload is enough to fulfill the request.
    pub fn is_decided(&self) -> bool {
        self.staged.has_body() || self.explicit
    }

    /// Return the staged response, fetching it from upstream first if nothing
    /// has been fetched or staged yet.
    ///
    /// `None` means there is nothing to work with: the single fetch failed and
    /// no handler staged a body.
    pub async fn fetch(&mut self, options: FetchOptions) -> Option<StagedResponse> {
        if !self.fetch_attempted && !self.staged.has_body() && !self.is_committed() {
            self.fetch_attempted = true;
            self.round_trip(&options).await;
        }

        if self.real_response.is_none() && !self.staged.has_body() {
            return None;
        }
        Some(self.staged.clone())
    }

    /// Force a fresh round trip and re-seed the staged response from it.
    ///
    /// Only used by recovery paths (map-remote falling back to the source).
    pub async fn refetch(&mut self, options: FetchOptions) -> Option<StagedResponse> {
        if self.is_committed() {
            return None;
        }
        self.fetch_attempted = true;
        self.staged.body = None;
        if self.round_trip(&options).await {
            Some(self.staged.clone())
        } else {
            None
        }
    }

    async fn round_trip(&mut self, options: &FetchOptions) -> bool {
        self.state = RequestState::Fetching;
        let url = options.url.as_deref().unwrap_or(&self.source_url);
        debug!("Fetching upstream response for {} from {}", self.source_url, url);

        match self.route.fetch(options).await {
            Ok(response) => {
                metrics::record_upstream_fetch(true);
                self.seed(response);
                self.state = RequestState::Staged;
                true
            }
            Err(e) => {
                metrics::record_upstream_fetch(false);
                debug!("Upstream fetch failed for {}: {}", self.source_url, e);
                self.state = if self.staged.has_body() || self.explicit {
                    RequestState::Staged
                } else {
                    RequestState::Intercepted
                };
                false
            }
        }
    }

    fn seed(&mut self, response: UpstreamResponse) {
        self.staged.body = Some(response.body.clone());
        self.staged.status = Some(response.status);
        self.staged.headers = Some(response.headers.clone());
        self.real_response = Some(response);
    }

    /// Shallow-merge `patch` into the staged response. No-op once committed.
    pub fn fulfill(&mut self, patch: StagedResponse) {
        if self.is_committed() {
            debug!("Ignoring fulfill for {}: already committed", self.source_url);
            return;
        }
        if patch.status.is_some() {
            self.explicit = true;
        }
        self.staged.merge(patch);
        self.state = RequestState::Staged;
    }

    /// Forget everything staged so far so the request falls through untouched.
    pub fn discard(&mut self) {
        if self.is_committed() {
            return;
        }
        self.staged = StagedResponse::default();
        self.real_response = None;
        self.fetch_attempted = false;
        self.explicit = false;
        self.state = RequestState::Intercepted;
    }

    /// Payload for a fulfilled commit: staged fields over the memoized response.
    pub(crate) fn fulfillment(&self) -> FulfillResponse {
        let real = self.real_response.as_ref();
        FulfillResponse {
            status: self
                .staged
                .status
                .or(real.map(|r| r.status))
                .unwrap_or(200),
            headers: self
                .staged
                .headers
                .clone()
                .or_else(|| real.map(|r| r.headers.clone()))
                .unwrap_or_default(),
            content_type: self.staged.content_type.clone(),
            body: self.staged.body.clone().unwrap_or_default(),
        }
    }

    /// The memoized upstream response untouched by anything staged since.
    pub(crate) fn memoized_fulfillment(&self) -> Option<FulfillResponse> {
        self.real_response.as_ref().map(|real| FulfillResponse {
            status: real.status,
            headers: real.headers.clone(),
            content_type: None,
            body: real.body.clone(),
        })
    }

    pub(crate) fn mark_committed(&mut self, outcome: Outcome) {
        self.state = match outcome {
            Outcome::Fulfilled => RequestState::Fulfilled,
            Outcome::Continued => RequestState::Continued,
        };
    }

    /// Record the real response observed while continuing the request.
    pub(crate) fn capture(&mut self, response: UpstreamResponse) {
        if self.real_response.is_none() {
            self.real_response = Some(response);
        }
    }
}
