//! Imperative middleware registered through the pipeline.
//!
//! # Phases
//!
//! - `pre` - runs before commit and may stage a response
//! - `post` - read-only taps over the committed response

mod handlers;
mod registry;

pub use handlers::{MapLocal, MapRemote, Mock, ModifyHandler, Tap, TapBody, TapEvent, Target};
pub use registry::{
    Handler, Middleware, MiddlewareEntry, Observer, Phase, Registry, RegistryBuilder,
};
