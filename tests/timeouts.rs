//! Timeout policies applied to live requests.

mod common;

use std::time::Duration;

use common::{TestServer, ROOT_BODY};
use wirebound::{Client, Error, TimeoutOp, TimeoutOptions};

#[tokio::test]
async fn per_operation_read_budget_cuts_off_a_slow_response() {
    common::init_tracing();
    let server = TestServer::spawn().await;
    let client = Client::new().timeout(TimeoutOptions::new().read(Duration::from_millis(50)));

    let err = client.get(&server.url("/slow")).send().await.unwrap_err();
    assert!(
        matches!(err, Error::Timeout { op: TimeoutOp::Read }),
        "expected read timeout, got {err:?}"
    );
}

#[tokio::test]
async fn per_operation_budget_allows_a_fast_response() {
    let server = TestServer::spawn().await;
    let client = Client::new().timeout(
        TimeoutOptions::new()
            .connect(Duration::from_secs(5))
            .read(Duration::from_secs(5))
            .write(Duration::from_secs(5)),
    );

    let response = client.get(&server.url("/")).send().await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn global_deadline_covers_the_whole_request() {
    let server = TestServer::spawn().await;
    let client = Client::new()
        .timeout_policy(
            "global",
            TimeoutOptions::new().global(Duration::from_millis(80)),
        )
        .unwrap();

    let err = client.get(&server.url("/slow")).send().await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err:?}");
}

#[tokio::test]
async fn null_policy_waits_out_a_slow_response() {
    let server = TestServer::spawn().await;
    let client = Client::new()
        .timeout_policy("null", TimeoutOptions::new())
        .unwrap();

    let response = client.get(&server.url("/slow")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "late");
}

#[tokio::test]
async fn unknown_policy_fails_before_any_io() {
    // No server is running; the error must surface anyway.
    let err = Client::new()
        .timeout_policy("foobar", TimeoutOptions::new().read(Duration::from_secs(1)))
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("foobar"));
}

#[tokio::test]
async fn timed_out_connections_are_not_reused() {
    let server = TestServer::spawn().await;
    // One persistent client for both requests, so the second request
    // hits the same pool the timed-out connection would have landed in.
    let client = Client::new()
        .persistent(&server.base_url())
        .unwrap()
        .timeout(TimeoutOptions::new().read(Duration::from_millis(100)));

    let err = client.get("/slow").send().await.unwrap_err();
    assert!(err.is_timeout());
    let connections_after_timeout = server.connection_count();

    // A fast route fits the same read budget; it must open a fresh
    // connection rather than reuse the aborted one.
    let response = client.get("/").send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), ROOT_BODY);
    assert!(server.connection_count() > connections_after_timeout);
    client.close().await;
}
