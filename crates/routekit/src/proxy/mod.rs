//! Forward proxy implementation of the browsing session.
//!
//! # Module Structure
//!
//! - `server` - ProxySession and the accept loop
//! - `route` - InterceptedRoute over a proxied request
//! - `client` - upstream HTTP client
//! - `headers` - header map conversion and filtering

mod client;
mod headers;
mod route;
mod server;

pub use client::{create_http_client, HttpClient};
pub use route::{ProxyResponse, ProxyRoute};
pub use server::ProxySession;
