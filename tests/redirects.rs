//! Redirect following: hop limits, relative targets, and opt-out.

mod common;

use common::{TestServer, LANDING_BODY, ROOT_BODY};
use wirebound::{Client, Error, StatusCode};

#[tokio::test]
async fn follows_a_301_to_the_final_body() {
    common::init_tracing();
    let server = TestServer::spawn().await;

    let client = Client::new().follow(5);
    let response = client.get(&server.url("/redirect-301")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), ROOT_BODY);
}

#[tokio::test]
async fn follows_a_302_to_the_final_body() {
    let server = TestServer::spawn().await;

    let client = Client::new().follow(5);
    let response = client.get(&server.url("/redirect-302")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), ROOT_BODY);
}

#[tokio::test]
async fn resolves_relative_location_against_the_request_url() {
    let server = TestServer::spawn().await;

    let client = Client::new().follow(5);
    let response = client
        .get(&server.url("/relative-redirect"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), LANDING_BODY);
}

#[tokio::test]
async fn see_other_converts_to_a_bodyless_get() {
    let server = TestServer::spawn().await;

    let client = Client::new().follow(5);
    let response = client
        .post(&server.url("/see-other"))
        .body("submitted payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "GET 0");
}

#[tokio::test]
async fn redirect_loops_stop_at_the_hop_limit() {
    let server = TestServer::spawn().await;

    let client = Client::new().follow(3);
    let err = client.get(&server.url("/loop")).send().await.unwrap_err();

    assert!(matches!(err, Error::TooManyRedirects { limit: 3 }));
}

#[tokio::test]
async fn without_follow_the_redirect_is_returned_verbatim() {
    let server = TestServer::spawn().await;

    let client = Client::new();
    let response = client.get(&server.url("/redirect-301")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.header("location"), Some("/"));
}

#[tokio::test]
async fn redirect_without_location_is_returned_as_is() {
    let server = TestServer::spawn().await;

    let client = Client::new().follow(5);
    let response = client.get(&server.url("/no-location")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(response.header("location").is_none());
}
