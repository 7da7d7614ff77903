//! The single entry point every intercepted request goes through.
//!
//! Pre-middleware stage a response, the override table fills in when nothing
//! was decided, the modify table rewrites the staged body, then the request is
//! committed exactly once and post-middleware observe the result. A request
//! whose upstream response was already fetched is fulfilled from that copy
//! and never continued. No error escapes `dispatch`.

use crate::error::Error;
use crate::metrics;
use crate::middleware::Registry;
use crate::modify::ModifyTable;
use crate::overrides::OverrideTable;
use crate::route::{
    CommittedResponse, FulfillResponse, InterceptedRoute, Outcome, PendingRequest,
};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    registry: Registry,
    overrides: Arc<OverrideTable>,
    modifies: Arc<ModifyTable>,
}

impl Dispatcher {
    pub fn new(registry: Registry, overrides: OverrideTable, modifies: ModifyTable) -> Self {
        Self {
            registry,
            overrides: Arc::new(overrides),
            modifies: Arc::new(modifies),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Resolve `route`. Returns how the request left the pipeline.
    pub async fn dispatch(&self, route: Arc<dyn InterceptedRoute>) -> Outcome {
        let mut ctx = PendingRequest::new(route.clone());
        let url = ctx.url().to_string();
        debug!("Intercepted {} {}", ctx.request().method, url);

        let mut aborted = false;
        for middleware in self.registry.pre_matching(&url) {
            if let Err(e) = middleware.handle(&mut ctx).await {
                report("pre", &url, &e);
                aborted = true;
                break;
            }
        }

        if !aborted && !ctx.is_decided() && !self.overrides.is_empty() {
            if let Err(e) = self.overrides.apply(&mut ctx).await {
                report("override", &url, &e);
                aborted = true;
            }
        }

        if !aborted && !self.modifies.is_empty() {
            self.modifies.apply(&mut ctx).await;
        }

        // Continuing after a fetch would hit the origin twice.
        let payload = if aborted {
            ctx.memoized_fulfillment()
        } else if ctx.is_decided() || ctx.real_response().is_some() {
            Some(ctx.fulfillment())
        } else {
            None
        };
        let (outcome, committed) = match payload {
            Some(response) => {
                self.commit_fulfilled(&mut ctx, route.as_ref(), response)
                    .await
            }
            None => (
                Outcome::Continued,
                self.commit_continued(&mut ctx, route.as_ref()).await,
            ),
        };
        metrics::record_request(outcome.as_str());
        debug!("{} {}", outcome.as_str(), url);

        if let Some(committed) = committed {
            for observer in self.registry.post_matching(&url) {
                if let Err(e) = observer.observe(&committed).await {
                    report("post", &url, &e);
                }
            }
        }
        outcome
    }

    async fn commit_fulfilled(
        &self,
        ctx: &mut PendingRequest,
        route: &dyn InterceptedRoute,
        response: FulfillResponse,
    ) -> (Outcome, Option<CommittedResponse>) {
        match route.fulfill(response.clone()).await {
            Ok(()) => {
                ctx.mark_committed(Outcome::Fulfilled);
                let committed = CommittedResponse::fulfilled(ctx.url(), response);
                (Outcome::Fulfilled, Some(committed))
            }
            Err(e) if e.is_session_closed() => {
                report("commit", ctx.url(), &e);
                ctx.mark_committed(Outcome::Fulfilled);
                (Outcome::Fulfilled, None)
            }
            Err(e) => {
                report("commit", ctx.url(), &e);
                (Outcome::Continued, self.commit_continued(ctx, route).await)
            }
        }
    }

    async fn commit_continued(
        &self,
        ctx: &mut PendingRequest,
        route: &dyn InterceptedRoute,
    ) -> Option<CommittedResponse> {
        let result = route.continue_request().await;
        ctx.mark_committed(Outcome::Continued);
        match result {
            Ok(Some(response)) => {
                ctx.capture(response);
            }
            Ok(None) => {}
            Err(e) => {
                report("commit", ctx.url(), &e);
                return None;
            }
        }
        ctx.real_response()
            .cloned()
            .map(|response| CommittedResponse::continued(ctx.url(), response))
    }
}

fn report(phase: &str, url: &str, error: &Error) {
    if error.is_session_closed() {
        debug!("{} phase for {}: {}", phase, url, error);
        return;
    }
    metrics::record_dispatch_error(phase);
    warn!("{} phase failed for {}: {}", phase, url, error);
}
