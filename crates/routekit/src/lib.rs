//! Request interception and transformation for browsing sessions.
//!
//! Every request a session makes goes through one [`Dispatcher`]: imperative
//! middleware first, then the declarative override table, then content
//! modifications, and finally exactly one commit to the session.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod mime;
pub mod modify;
pub mod overrides;
pub mod pattern;
pub mod pipeline;
pub mod proxy;
pub mod route;
pub mod session;

mod scripting;

pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use middleware::{Middleware, Observer, TapBody, TapEvent, Target};
pub use modify::{
    HtmlTransform, JsTransform, JsonTransform, ModifyRule, RemoveElements, ResponseParts,
    ResponseTransform,
};
pub use overrides::{OverrideMode, OverridePattern, OverrideRule, OverrideType, PredicateTarget};
pub use pattern::{CompiledPattern, UrlPattern};
pub use pipeline::Pipeline;
pub use route::{
    CommittedResponse, FetchOptions, FulfillResponse, InterceptedRoute, Outcome, PendingRequest,
    RequestInfo, StagedResponse, UpstreamResponse,
};
pub use scripting::ScriptTransform;
pub use session::{BrowsingSession, SessionOptions, SessionScope};
