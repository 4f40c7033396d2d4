//! Response values and lazy body consumption.
//!
//! # Responsibilities
//! - Expose status, version, and headers as soon as the head is parsed
//! - Stream the body on demand; a consumed stream is not rewindable
//! - Close a non-reusable transport once its body is exhausted
//!
//! # Design Decisions
//! - Non-persistent responses carry their Connection inside the body;
//!   dropping the body drops the socket
//! - Persistent dispatch drains the body up front so the connection can
//!   return to the pool before the caller touches the payload

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::net::connection::{BodyFraming, Connection};
use crate::timeout::TimeoutGuard;

/// A parsed response: status and headers up front, body on demand.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Body,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        body: Body,
    ) -> Self {
        Self {
            status,
            version,
            headers,
            body,
        }
    }

    /// Assemble a response from buffered parts. Intended for [`Cache`]
    /// implementations replaying stored entries.
    ///
    /// [`Cache`]: crate::cache::Cache
    pub fn from_parts(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers,
            body: Body::buffered(body),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Convenience accessor for a single header value as text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Read the next body fragment; `None` once the body is exhausted.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.body.chunk().await
    }

    /// Buffer the full body.
    pub async fn bytes(self) -> Result<Bytes> {
        self.body.bytes().await
    }

    /// Buffer the full body and decode it as UTF-8.
    pub async fn text(self) -> Result<String> {
        let bytes = self.body.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Protocol("response body is not valid UTF-8".into()))
    }

    /// Buffer the full body and deserialize it as JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.body.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Protocol(format!("response body is not valid JSON: {e}")))
    }
}

/// A response body. Once consumed it cannot be re-read.
pub struct Body {
    inner: BodyInner,
}

enum BodyInner {
    /// No body (HEAD responses, 204/304).
    Empty,
    /// Already drained into memory.
    Buffered(Bytes),
    /// Streamed lazily off the owned connection.
    Streaming {
        conn: Connection,
        framing: BodyFraming,
        guard: TimeoutGuard,
    },
}

impl Body {
    pub(crate) fn empty() -> Self {
        Self {
            inner: BodyInner::Empty,
        }
    }

    pub(crate) fn buffered(bytes: Bytes) -> Self {
        Self {
            inner: BodyInner::Buffered(bytes),
        }
    }

    pub(crate) fn streaming(conn: Connection, framing: BodyFraming, guard: TimeoutGuard) -> Self {
        Self {
            inner: BodyInner::Streaming {
                conn,
                framing,
                guard,
            },
        }
    }

    /// Read the next fragment of the body.
    ///
    /// Reads run under the same timeout guard as the rest of the
    /// request, so a global deadline also bounds body consumption.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match &mut self.inner {
            BodyInner::Empty => Ok(None),
            BodyInner::Buffered(bytes) => {
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(bytes)))
                }
            }
            BodyInner::Streaming {
                conn,
                framing,
                guard,
            } => {
                let chunk = conn.read_body_chunk(framing, guard).await;
                match chunk {
                    Ok(Some(bytes)) => Ok(Some(bytes)),
                    Ok(None) => {
                        // Exhausted; the transport was checked out for this
                        // request alone, so it closes here.
                        conn.close().await;
                        Ok(None)
                    }
                    Err(e) => {
                        conn.close().await;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Buffer whatever remains of the body.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            BodyInner::Empty => f.write_str("Body::Empty"),
            BodyInner::Buffered(b) => write!(f, "Body::Buffered({} bytes)", b.len()),
            BodyInner::Streaming { conn, .. } => {
                write!(f, "Body::Streaming({})", conn.id())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_body_reads_once() {
        let mut body = Body::buffered(Bytes::from_static(b"hello"));
        assert_eq!(body.chunk().await.unwrap().unwrap(), "hello");
        assert_eq!(body.chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_body_yields_nothing() {
        let mut body = Body::empty();
        assert_eq!(body.chunk().await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_decoding() {
        let response = Response::new(
            StatusCode::OK,
            Version::HTTP_11,
            HeaderMap::new(),
            Body::buffered(Bytes::from_static(br#"{"name":"wire"}"#)),
        );
        let value: serde_json::Value = response.json().await.unwrap();
        assert_eq!(value["name"], "wire");
    }
}
