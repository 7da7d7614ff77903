//! ProxySession: a plain-HTTP forward proxy acting as the browsing session.
//!
//! Point a browser at the listener as its HTTP proxy and every absolute-form
//! request goes through the dispatcher. `CONNECT` tunnels are refused since
//! TLS is never terminated here.

use super::client::HttpClient;
use super::headers::from_header_map;
use super::route::{error_response, ProxyResponse, ProxyRoute};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::metrics::collect_metrics;
use crate::route::RequestInfo;
use crate::session::{BrowsingSession, CookieJar};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared by every connection.
struct ProxyState {
    client: HttpClient,
    dispatcher: Dispatcher,
    jar: Arc<CookieJar>,
}

pub struct ProxySession {
    state: Arc<ProxyState>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
}

impl ProxySession {
    pub async fn bind(
        addr: SocketAddr,
        client: HttpClient,
        dispatcher: Dispatcher,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            state: Arc::new(ProxyState {
                client,
                dispatcher,
                jar: Arc::new(CookieJar::new()),
            }),
            local_addr,
            listener: Mutex::new(Some(listener)),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn jar(&self) -> &Arc<CookieJar> {
        &self.state.jar
    }

    fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::Session("proxy is already running".to_string()))?;
        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(accept_loop(listener, state, shutdown));
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ProxyState>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };
        let (stream, remote_addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { handle_request(state, req).await }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection from {}: {}", remote_addr, err);
            }
        });
    }
    debug!("Proxy accept loop stopped");
}

async fn handle_request(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
) -> std::result::Result<ProxyResponse, Infallible> {
    if req.method() == Method::CONNECT {
        warn!("Refusing CONNECT to {}: TLS is not terminated", req.uri());
        return Ok(error_response(
            StatusCode::NOT_IMPLEMENTED,
            "CONNECT tunnels are not supported",
        ));
    }

    // origin-form: a request addressed to the proxy itself
    if req.uri().scheme().is_none() {
        return Ok(match req.uri().path() {
            "/metrics" => metrics_response(),
            _ => error_response(
                StatusCode::BAD_REQUEST,
                "expected an absolute-form proxy request",
            ),
        });
    }

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read request body for {}: {}", parts.uri, e);
            return Ok(error_response(StatusCode::BAD_REQUEST, "unreadable request body"));
        }
    };

    let request = RequestInfo {
        method: parts.method.to_string(),
        url: parts.uri.to_string(),
        headers: from_header_map(&parts.headers),
        body: if body.is_empty() { None } else { Some(body) },
    };
    let (route, rx) = ProxyRoute::new(request, state.client.clone(), state.jar.clone());

    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        dispatcher.dispatch(route).await;
    });

    Ok(rx.await.unwrap_or_else(|_| {
        error_response(StatusCode::BAD_GATEWAY, "request was dropped before it resolved")
    }))
}

fn metrics_response() -> ProxyResponse {
    let mut response = Response::new(Full::new(Bytes::from(collect_metrics())));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

#[async_trait]
impl BrowsingSession for ProxySession {
    async fn open(&self, url: Option<&str>) -> Result<()> {
        self.start()?;
        info!("Proxy listening on http://{}", self.local_addr);
        if let Some(url) = url {
            info!("Configure the browser to use the proxy, then open {}", url);
        }
        Ok(())
    }

    async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    async fn load_storage_state(&self, path: &Path) -> Result<()> {
        self.state.jar.load(path).await
    }

    async fn save_storage_state(&self, path: &Path) -> Result<()> {
        self.state.jar.save(path).await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        info!("Proxy on {} stopped", self.local_addr);
        Ok(())
    }
}
