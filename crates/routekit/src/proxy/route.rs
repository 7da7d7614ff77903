//! An intercepted proxy request.
//!
//! The client connection waits on a oneshot channel; resolving the route
//! (fulfill or continue) sends exactly one response down it.

use super::client::{send, HttpClient};
use super::headers::{for_client, to_header_map};
use crate::error::{Error, Result};
use crate::route::{
    FetchOptions, FulfillResponse, Headers, InterceptedRoute, RequestInfo, UpstreamResponse,
};
use crate::session::CookieJar;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE, COOKIE};
use hyper::{Response, StatusCode};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

pub type ProxyResponse = Response<Full<Bytes>>;

pub struct ProxyRoute {
    request: RequestInfo,
    client: HttpClient,
    jar: Arc<CookieJar>,
    responder: Mutex<Option<oneshot::Sender<ProxyResponse>>>,
}

impl ProxyRoute {
    pub fn new(
        request: RequestInfo,
        client: HttpClient,
        jar: Arc<CookieJar>,
    ) -> (Arc<Self>, oneshot::Receiver<ProxyResponse>) {
        let (tx, rx) = oneshot::channel();
        let route = Arc::new(Self {
            request,
            client,
            jar,
            responder: Mutex::new(Some(tx)),
        });
        (route, rx)
    }

    fn respond(&self, response: ProxyResponse) -> Result<()> {
        let sender = self
            .responder
            .lock()
            .take()
            .ok_or_else(|| {
                Error::Session(format!("{} was already resolved", self.request.url))
            })?;
        // a dropped receiver means the client hung up
        sender.send(response).map_err(|_| Error::SessionClosed)
    }

    async fn round_trip(&self, options: &FetchOptions) -> Result<UpstreamResponse> {
        let url = options.url.as_deref().unwrap_or(&self.request.url);
        let method = options.method.as_deref().unwrap_or(&self.request.method);
        let mut headers = options
            .headers
            .clone()
            .unwrap_or_else(|| self.request.headers.clone());
        if !headers.contains_key(COOKIE.as_str()) {
            if let Some(cookie) = self.jar.header_for(url) {
                headers.insert(COOKIE.as_str().to_string(), cookie);
            }
        }

        let body = self.request.body.clone();
        let response = send(&self.client, method, url, &headers, body).await?;
        if let Some(set_cookie) = response.headers.get("set-cookie") {
            self.jar.record(url, set_cookie);
        }
        Ok(response)
    }
}

fn build_response(
    status: u16,
    headers: &Headers,
    content_type: Option<&str>,
    body: Bytes,
) -> ProxyResponse {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    *response.headers_mut() = to_header_map(&for_client(headers));
    if let Some(content_type) = content_type.and_then(|ct| HeaderValue::from_str(ct).ok()) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}

pub fn error_response(status: StatusCode, message: &str) -> ProxyResponse {
    let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

#[async_trait]
impl InterceptedRoute for ProxyRoute {
    fn request(&self) -> &RequestInfo {
        &self.request
    }

    async fn fetch(&self, options: &FetchOptions) -> Result<UpstreamResponse> {
        self.round_trip(options).await
    }

    async fn fulfill(&self, response: FulfillResponse) -> Result<()> {
        debug!("Fulfilling {} with {}", self.request.url, response.status);
        self.respond(build_response(
            response.status,
            &response.headers,
            response.content_type.as_deref(),
            response.body,
        ))
    }

    async fn continue_request(&self) -> Result<Option<UpstreamResponse>> {
        match self.round_trip(&FetchOptions::default()).await {
            Ok(upstream) => {
                self.respond(build_response(
                    upstream.status,
                    &upstream.headers,
                    None,
                    upstream.body.clone(),
                ))?;
                Ok(Some(upstream))
            }
            Err(e) => {
                let _ = self.respond(error_response(StatusCode::BAD_GATEWAY, &e.to_string()));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(url: &str) -> (Arc<ProxyRoute>, oneshot::Receiver<ProxyResponse>) {
        ProxyRoute::new(
            RequestInfo::get(url),
            reqwest::Client::new(),
            Arc::new(CookieJar::new()),
        )
    }

    #[tokio::test]
    async fn test_fulfill_sends_one_response() {
        let (route, rx) = route("http://x/a");
        let headers = Headers::from([("x-mock".to_string(), "1".to_string())]);
        route
            .fulfill(FulfillResponse {
                status: 201,
                headers,
                content_type: Some("application/json".to_string()),
                body: Bytes::from_static(b"{}"),
            })
            .await
            .unwrap();

        let response = rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-mock"], "1");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let again = route
            .fulfill(FulfillResponse {
                status: 200,
                headers: Headers::new(),
                content_type: None,
                body: Bytes::new(),
            })
            .await;
        assert!(matches!(again, Err(Error::Session(_))));
    }

    #[tokio::test]
    async fn test_dropped_client_is_session_closed() {
        let (route, rx) = route("http://x/a");
        drop(rx);
        let err = route
            .fulfill(FulfillResponse {
                status: 200,
                headers: Headers::new(),
                content_type: None,
                body: Bytes::new(),
            })
            .await
            .unwrap_err();
        assert!(err.is_session_closed());
    }

    #[test]
    fn test_invalid_status_falls_back_to_ok() {
        let response = build_response(1000, &Headers::new(), None, Bytes::new());
        assert_eq!(response.status(), StatusCode::OK);
    }
}
