//! Intercepted routes and the per-request pending context.
//!
//! - `types` - request/response value types
//! - `context` - `PendingRequest`, the memoized fetch-and-stage buffer

mod context;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{PendingRequest, RequestState};
pub use types::{
    CommittedResponse, FetchOptions, FulfillResponse, Headers, Outcome, RequestInfo,
    StagedResponse, UpstreamResponse, CONTENT_TYPE,
};

use crate::error::Result;
use async_trait::async_trait;

/// One request captured by the browsing session's catch-all hook.
///
/// Exactly one of `fulfill` or `continue_request` must eventually be called.
/// Implementations treat any call after the first resolution as a no-op.
#[async_trait]
pub trait InterceptedRoute: Send + Sync {
    fn request(&self) -> &RequestInfo;

    /// Retrieve the real upstream response without resolving the route.
    async fn fetch(&self, options: &FetchOptions) -> Result<UpstreamResponse>;

    /// Resolve with a synthetic or modified response.
    async fn fulfill(&self, response: FulfillResponse) -> Result<()>;

    /// Resolve by letting the request through to the network. Returns the
    /// real response when the session can capture it.
    async fn continue_request(&self) -> Result<Option<UpstreamResponse>>;
}
