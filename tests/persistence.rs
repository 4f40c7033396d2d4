//! Connection reuse, persistent scopes, and the cache hook.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use common::{TestServer, ROOT_BODY};
use wirebound::cache::{Cache, CacheFuture, Dispatch};
use wirebound::{Client, HeaderMap, Request, Response, StatusCode};

#[tokio::test]
async fn persistent_client_reuses_one_connection() {
    common::init_tracing();
    let server = TestServer::spawn().await;
    let client = Client::new().persistent(&server.base_url()).unwrap();

    for _ in 0..3 {
        let response = client.get("/").send().await.unwrap();
        assert_eq!(response.text().await.unwrap(), ROOT_BODY);
    }

    assert_eq!(server.connection_count(), 1);
    client.close().await;
}

#[tokio::test]
async fn non_persistent_requests_each_open_a_connection() {
    let server = TestServer::spawn().await;
    let client = Client::new();

    for _ in 0..2 {
        let response = client.get(&server.url("/")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn close_discards_the_pooled_connection() {
    let server = TestServer::spawn().await;
    let client = Client::new().persistent(&server.base_url()).unwrap();

    client.get("/").send().await.unwrap().text().await.unwrap();
    assert_eq!(server.connection_count(), 1);

    client.close().await;

    client.get("/").send().await.unwrap().text().await.unwrap();
    assert_eq!(server.connection_count(), 2);
    client.close().await;
}

#[tokio::test]
async fn persistent_scope_closes_connections_on_exit() {
    let server = TestServer::spawn().await;
    let base = server.base_url();

    let client = Client::new();
    let body: String = client
        .persistent_scope(&base, |session| async move {
            session.get("/").send().await?.text().await?;
            session.get("/landing").send().await?.text().await
        })
        .await
        .unwrap();
    assert_eq!(body, "landed");
    assert_eq!(server.connection_count(), 1);

    // The scope closed its pool, so a fresh request dials again.
    client.get(&server.url("/")).send().await.unwrap();
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn persistent_scope_closes_connections_on_error_too() {
    let server = TestServer::spawn().await;
    let base = server.base_url();

    let result: wirebound::Result<()> = Client::new()
        .persistent_scope(&base, |session| async move {
            session.get("/").send().await?.text().await?;
            Err(wirebound::Error::Protocol("scope failed".into()))
        })
        .await;
    assert!(result.is_err());

    // Connection was opened, used once, and closed with the scope.
    assert_eq!(server.connection_count(), 1);
}

/// Cache that serves one canned response for a fixed path and falls
/// through for everything else, counting the fallthroughs.
struct CannedCache {
    path: &'static str,
    misses: AtomicUsize,
}

impl Cache for CannedCache {
    fn perform<'a>(&'a self, request: Request, default_behavior: Dispatch<'a>) -> CacheFuture<'a> {
        Box::pin(async move {
            if request.url().path() == self.path {
                return Ok(Response::from_parts(
                    StatusCode::OK,
                    HeaderMap::new(),
                    Bytes::from_static(b"from cache"),
                ));
            }
            self.misses.fetch_add(1, Ordering::SeqCst);
            default_behavior.run(request).await
        })
    }
}

#[tokio::test]
async fn cache_hits_never_touch_the_network() {
    let server = TestServer::spawn().await;
    let cache = Arc::new(CannedCache {
        path: "/cached",
        misses: AtomicUsize::new(0),
    });
    let client = Client::new().cache(cache.clone());

    let response = client.get(&server.url("/cached")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "from cache");
    assert_eq!(server.connection_count(), 0);

    let response = client.get(&server.url("/")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), ROOT_BODY);
    assert_eq!(cache.misses.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 1);
}
