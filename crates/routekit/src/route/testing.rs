//! In-memory route used by unit tests.

use super::{
    FetchOptions, FulfillResponse, InterceptedRoute, RequestInfo, UpstreamResponse,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution {
    Fulfilled(FulfillResponse),
    Continued,
}

pub(crate) struct FakeRoute {
    request: RequestInfo,
    responses: Mutex<HashMap<String, UpstreamResponse>>,
    fetches: AtomicUsize,
    resolutions: Mutex<Vec<Resolution>>,
    closed: AtomicBool,
}

impl FakeRoute {
    pub(crate) fn new(url: &str) -> Arc<Self> {
        Arc::new(Self {
            request: RequestInfo::get(url),
            responses: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            resolutions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Response served for the request's own URL.
    pub(crate) fn upstream(self: Arc<Self>, response: UpstreamResponse) -> Arc<Self> {
        let url = self.request.url.clone();
        self.upstream_for(&url, response)
    }

    pub(crate) fn upstream_for(
        self: Arc<Self>,
        url: &str,
        response: UpstreamResponse,
    ) -> Arc<Self> {
        self.responses.lock().insert(url.to_string(), response);
        self
    }

    /// Simulate the page going away: every resolution fails.
    pub(crate) fn closed(self: Arc<Self>) -> Arc<Self> {
        self.closed.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn resolutions(&self) -> Vec<Resolution> {
        self.resolutions.lock().clone()
    }

    pub(crate) fn fulfilled(&self) -> Option<FulfillResponse> {
        self.resolutions.lock().iter().find_map(|r| match r {
            Resolution::Fulfilled(f) => Some(f.clone()),
            Resolution::Continued => None,
        })
    }
}

#[async_trait]
impl InterceptedRoute for FakeRoute {
    fn request(&self) -> &RequestInfo {
        &self.request
    }

    async fn fetch(&self, options: &FetchOptions) -> Result<UpstreamResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let url = options.url.as_deref().unwrap_or(&self.request.url);
        self.responses
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::UpstreamFetch {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            })
    }

    async fn fulfill(&self, response: FulfillResponse) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        self.resolutions.lock().push(Resolution::Fulfilled(response));
        Ok(())
    }

    async fn continue_request(&self) -> Result<Option<UpstreamResponse>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        self.resolutions.lock().push(Resolution::Continued);
        Ok(self.responses.lock().get(&self.request.url).cloned())
    }
}
