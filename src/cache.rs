//! Injectable cache collaborator.
//!
//! The engine does not implement caching. When a cache is attached, the
//! dispatcher hands each request to it first, together with a handle to
//! the default dispatch behavior; the cache decides whether to serve
//! from storage or fall through.

use std::future::Future;
use std::pin::Pin;

use crate::client::Client;
use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

/// Future type returned by cache collaborators.
pub type CacheFuture<'a> = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'a>>;

/// A caching strategy injected into a `Client`.
///
/// Implementations receive the request plus the client's default
/// behavior; calling `default_behavior.run(request)` performs a normal
/// dispatch.
pub trait Cache: Send + Sync {
    fn perform<'a>(&'a self, request: Request, default_behavior: Dispatch<'a>) -> CacheFuture<'a>;
}

/// The default dispatch behavior, handed to a cache as its fallback.
pub struct Dispatch<'a> {
    client: &'a Client,
}

impl<'a> Dispatch<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Dispatch the request the way the client would without a cache.
    pub async fn run(self, request: Request) -> Result<Response> {
        self.client.perform_uncached(request).await
    }
}
