//! End-to-end request/response cycles against a local backend.

mod common;

use common::{TestServer, ROOT_BODY};
use wirebound::{BasicAuth, Client, StatusCode};

#[tokio::test]
async fn get_returns_the_resource_body() {
    common::init_tracing();
    let server = TestServer::spawn().await;
    let response = Client::new().get(&server.url("/")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.header("content-type"), Some("text/html"));
    let body = response.text().await.unwrap();
    assert!(body.starts_with("<!DOCTYPE html>"));
    assert_eq!(body, ROOT_BODY);
}

#[tokio::test]
async fn post_sends_the_body_verbatim() {
    let server = TestServer::spawn().await;
    let response = Client::new()
        .post(&server.url("/echo"))
        .body("payload bytes")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "payload bytes");
}

#[tokio::test]
async fn form_bodies_are_encoded_and_typed() {
    let server = TestServer::spawn().await;
    let response = Client::new()
        .post(&server.url("/echo"))
        .form(&[("name", "wire bound"), ("kind", "engine")])
        .send()
        .await
        .unwrap();

    assert_eq!(
        response.header("x-echo-content-type"),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(
        response.text().await.unwrap(),
        "name=wire+bound&kind=engine"
    );
}

#[tokio::test]
async fn query_params_merge_from_url_and_options() {
    let server = TestServer::spawn().await;
    let response = Client::new()
        .get(&server.url("/params?foo=bar"))
        .query(&[("baz", "quux")])
        .send()
        .await
        .unwrap();

    let query = response.text().await.unwrap();
    assert!(query.contains("foo=bar"), "url params dropped: {query}");
    assert!(query.contains("baz=quux"), "option params dropped: {query}");
}

#[tokio::test]
async fn chunked_responses_are_reassembled() {
    let server = TestServer::spawn().await;
    let response = Client::new()
        .get(&server.url("/chunked"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.text().await.unwrap(), "hello chunked world");
}

#[tokio::test]
async fn head_reports_headers_but_never_a_body() {
    let server = TestServer::spawn().await;
    let response = Client::new().head(&server.url("/")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.header("content-type"), Some("text/html"));
    // Content-Length advertises the resource size, but no body follows.
    assert_eq!(
        response.header("content-length"),
        Some(ROOT_BODY.len().to_string().as_str())
    );
    let body = response.bytes().await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn auth_header_reaches_the_wire() {
    let server = TestServer::spawn().await;
    let client = Client::new().auth("token-abc").unwrap();
    let response = client.get(&server.url("/auth-echo")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "token-abc");
}

#[tokio::test]
async fn basic_auth_header_shape_on_the_wire() {
    let server = TestServer::spawn().await;
    let client = Client::new()
        .basic_auth(BasicAuth::new("user", "pass"))
        .unwrap();
    let response = client.get(&server.url("/auth-echo")).send().await.unwrap();

    let value = response.text().await.unwrap();
    let encoded = value.strip_prefix("Basic ").unwrap();
    assert!(encoded
        .trim_end_matches('=')
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/'));
    assert_eq!(value, "Basic dXNlcjpwYXNz");
}

#[tokio::test]
async fn explicit_request_headers_override_defaults() {
    let server = TestServer::spawn().await;
    let client = Client::new().auth("default-token").unwrap();
    let response = client
        .get(&server.url("/auth-echo"))
        .header("authorization", "explicit-token")
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "explicit-token");
}

#[tokio::test]
async fn body_streams_lazily_in_chunks() {
    let server = TestServer::spawn().await;
    let mut response = Client::new().get(&server.url("/")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let mut collected = Vec::new();
    while let Some(chunk) = response.chunk().await.unwrap() {
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, ROOT_BODY.as_bytes());
}

#[tokio::test]
async fn json_round_trip() {
    let server = TestServer::spawn().await;
    let response = Client::new()
        .post(&server.url("/echo"))
        .json(&serde_json::json!({"kind": "engine", "version": 1}))
        .send()
        .await
        .unwrap();

    assert_eq!(
        response.header("x-echo-content-type"),
        Some("application/json")
    );
    let value: serde_json::Value = response.json().await.unwrap();
    assert_eq!(value["kind"], "engine");
    assert_eq!(value["version"], 1);
}
