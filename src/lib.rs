//! HTTP/1.1 client engine.
//!
//! The core is the request-dispatch pipeline: connection acquisition and
//! keep-alive reuse, proxy-tunnel establishment (CONNECT with a single
//! 407 challenge/retry), timeout-policy application around every socket
//! operation, and redirect-following control flow. The same pipeline
//! serves plaintext and TLS transports, fresh or reused.
//!
//! ```no_run
//! use wirebound::{Client, TimeoutOptions};
//! use std::time::Duration;
//!
//! # async fn run() -> wirebound::Result<()> {
//! let client = Client::new()
//!     .timeout(TimeoutOptions::new().read(Duration::from_secs(5)))
//!     .follow(5);
//!
//! let response = client
//!     .get("http://example.com/search?foo=bar")
//!     .query(&[("baz", "quux")])
//!     .send()
//!     .await?;
//!
//! println!("{} {}", response.status(), response.text().await?);
//! # Ok(())
//! # }
//! ```
//!
//! Clients are immutable: chaining methods (`auth`, `via`, `timeout`,
//! `persistent`, ...) derive a new client and never mutate the original.

pub mod cache;
pub mod client;
pub mod error;
pub mod net;
pub mod options;
pub mod proxy;
pub mod redirect;
pub mod request;
pub mod response;
pub mod timeout;

pub use cache::{Cache, Dispatch};
pub use client::{Client, RequestBuilder};
pub use error::{Error, Result, TimeoutOp};
pub use net::tls::TlsContext;
pub use options::{BasicAuth, ClientOptions, FollowPolicy};
pub use proxy::ProxyOptions;
pub use request::{Request, RequestBody};
pub use response::{Body, Response};
pub use timeout::{TimeoutOptions, TimeoutPolicy};

// Re-exported vocabulary types from the `http` collaborator crate.
pub use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
pub use url::Url;
