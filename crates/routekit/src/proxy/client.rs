//! Upstream HTTP client used for fetches and pass-through.

use super::headers::{for_upstream, from_header_map, to_header_map};
use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::route::{Headers, UpstreamResponse};
use bytes::Bytes;
use reqwest::redirect::Policy;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type HttpClient = reqwest::Client;

/// Create the shared client. Redirects are returned to the caller untouched.
pub fn create_http_client(config: &UpstreamConfig) -> anyhow::Result<HttpClient> {
    if config.tls_skip_verify {
        warn!("TLS certificate verification DISABLED for upstream fetches");
    }
    let client = reqwest::Client::builder()
        .redirect(Policy::none())
        .danger_accept_invalid_certs(config.tls_skip_verify)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .pool_max_idle_per_host(config.max_idle_per_host)
        .build()?;

    info!(
        "Upstream client configured: connect_timeout={}s, idle_timeout={}s, max_idle={}",
        config.connect_timeout_secs, config.idle_timeout_secs, config.max_idle_per_host
    );
    Ok(client)
}

/// Perform one upstream request and buffer the response.
pub async fn send(
    client: &HttpClient,
    method: &str,
    url: &str,
    headers: &Headers,
    body: Option<Bytes>,
) -> Result<UpstreamResponse> {
    let fetch_error = |reason: String| Error::UpstreamFetch {
        url: url.to_string(),
        reason,
    };

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|e| fetch_error(format!("invalid method: {e}")))?;
    debug!("Upstream {} {}", method, url);

    let mut request = client
        .request(method, url)
        .headers(to_header_map(&for_upstream(headers)));
    if let Some(body) = body {
        request = request.body(body);
    }

    let response = request.send().await.map_err(|e| fetch_error(e.to_string()))?;
    let status = response.status().as_u16();
    let headers = from_header_map(response.headers());
    let body = response
        .bytes()
        .await
        .map_err(|e| fetch_error(format!("failed to read body: {e}")))?;

    Ok(UpstreamResponse {
        status,
        headers,
        body,
    })
}
