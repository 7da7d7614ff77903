//! Forward proxy session driven by a real HTTP client.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use routekit::config::UpstreamConfig;
use routekit::proxy::{create_http_client, ProxySession};
use routekit::{BrowsingSession, Pipeline, StagedResponse};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Minimal origin server for the proxy to forward to. Counts every request
/// it receives.
async fn start_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        let (status, content_type, body) = match req.uri().path() {
                            "/api/user" => {
                                (200, "application/json", r#"{"name":"ada","admin":false}"#)
                            }
                            "/api/save" => (204, "application/json", ""),
                            _ => (200, "text/plain", "origin"),
                        };
                        let response = Response::builder()
                            .status(status)
                            .header("content-type", content_type)
                            .header("set-cookie", "sid=abc; Path=/; Max-Age=3600")
                            .body(Full::new(Bytes::from(body)))
                            .unwrap();
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    (addr, hits)
}

async fn start_proxy() -> ProxySession {
    let mut pipeline = Pipeline::new();
    pipeline
        .mock("**/mocked", StagedResponse::new().body("from mock"))
        .unwrap()
        .modify_json("**/api/user", |mut user: Value| async move {
            user["admin"] = true.into();
            anyhow::Ok(user)
        })
        .unwrap()
        .modify_json("**/api/save", |saved: Value| async move { anyhow::Ok(saved) })
        .unwrap();

    let client = create_http_client(&UpstreamConfig::default()).unwrap();
    let session = ProxySession::bind(
        "127.0.0.1:0".parse().unwrap(),
        client,
        pipeline.build().unwrap(),
    )
    .await
    .unwrap();
    session.open(None).await.unwrap();
    session
}

fn browser(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy}")).unwrap())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_proxy_applies_pipeline() {
    let (origin, _) = start_upstream().await;
    let session = start_proxy().await;
    let client = browser(session.local_addr());

    let mocked = client
        .get(format!("http://{origin}/mocked"))
        .send()
        .await
        .unwrap();
    assert_eq!(mocked.status(), 200);
    assert_eq!(mocked.text().await.unwrap(), "from mock");

    let user: Value = client
        .get(format!("http://{origin}/api/user"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(user, json!({"name": "ada", "admin": true}));

    let plain = client
        .get(format!("http://{origin}/plain"))
        .send()
        .await
        .unwrap();
    assert_eq!(plain.text().await.unwrap(), "origin");

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_modified_post_reaches_origin_once() {
    let (origin, hits) = start_upstream().await;
    let session = start_proxy().await;
    let client = browser(session.local_addr());

    let saved = client
        .post(format!("http://{origin}/api/save"))
        .body(r#"{"draft":true}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(saved.status(), 204);
    assert!(saved.bytes().await.unwrap().is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let plain = client
        .get(format!("http://{origin}/plain"))
        .send()
        .await
        .unwrap();
    assert_eq!(plain.text().await.unwrap(), "origin");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_cookies_persist_as_storage_state() {
    let (origin, _) = start_upstream().await;
    let session = start_proxy().await;
    let client = browser(session.local_addr());

    client
        .get(format!("http://{origin}/plain"))
        .send()
        .await
        .unwrap();
    assert_eq!(session.jar().snapshot().cookies.len(), 1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("demo.json");
    session.save_storage_state(&path).await.unwrap();
    let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved["cookies"][0]["name"], "sid");
    assert!(saved["cookies"][0]["expires"].is_string());

    session.close().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), session.closed())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_origin_form_requests_hit_the_proxy() {
    let session = start_proxy().await;
    let direct = reqwest::Client::new();

    let metrics = direct
        .get(format!("http://{}/metrics", session.local_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(metrics.status(), 200);

    let other = direct
        .get(format!("http://{}/elsewhere", session.local_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), 400);

    session.close().await.unwrap();
}
