//! Redirect following around the dispatcher.
//!
//! # Responsibilities
//! - Re-issue requests against `Location` targets, resolving relative
//!   locations against the current URL
//! - Preserve the method across 301/302; convert 303 to a bodyless GET
//! - Enforce the hop limit
//!
//! Each hop is an independent dispatch; connections are only shared when
//! the persistent pool happens to match the next destination.

use http::{Method, StatusCode};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::request::{Request, RequestBody};
use crate::response::Response;
use crate::options::FollowPolicy;

pub(crate) async fn follow(
    client: &Client,
    request: Request,
    policy: FollowPolicy,
) -> Result<Response> {
    let mut hops = 0usize;
    let mut current = request;
    loop {
        // Snapshot what a follow-up hop would need before the request is
        // consumed by dispatch.
        let method = current.method().clone();
        let url = current.url().clone();
        let headers = current.headers().clone();
        let body_snapshot = current.body().try_clone();

        let response = client.dispatch(current).await?;
        if !response.status().is_redirection() {
            return Ok(response);
        }
        let Some(location) = response.header("location").map(str::to_string) else {
            // A 3xx without a target is handed to the caller verbatim.
            return Ok(response);
        };

        hops += 1;
        if hops > policy.max_hops {
            return Err(Error::TooManyRedirects {
                limit: policy.max_hops,
            });
        }

        let target = url.join(&location)?;
        tracing::debug!(
            status = response.status().as_u16(),
            location = %target,
            hop = hops,
            "following redirect"
        );

        current = if response.status() == StatusCode::SEE_OTHER {
            Request::from_parts(Method::GET, target, headers, RequestBody::Empty)
        } else {
            let body = body_snapshot.ok_or_else(|| {
                Error::Protocol("cannot follow a redirect with a streaming request body".into())
            })?;
            Request::from_parts(method, target, headers, body)
        };
        // The redirect response is dropped here; a streaming body closes
        // its transport on drop.
    }
}
