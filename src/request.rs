//! Request values and wire-level serialization.
//!
//! # Responsibilities
//! - Hold one immutable request: method, URL, headers, body
//! - Merge query parameters from the URL and from option pairs
//! - Serialize the request line and headers for the wire, in
//!   origin-form or in absolute-form for plaintext proxying
//!
//! # Design Decisions
//! - A built Request is never mutated mid-flight; redirects produce a
//!   new Request
//! - Default headers merge beneath explicit ones; explicit wins on a
//!   key collision
//! - Framing is chosen by body knowledge: known length gets
//!   `Content-Length`, streaming bodies get chunked encoding

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method};
use tokio::io::AsyncRead;
use url::Url;

use crate::error::{Error, Result};

/// A request body, classified by whether its length is known up front.
#[derive(Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Fully buffered payload; framed with `Content-Length`.
    Bytes(Bytes),
    /// Streaming payload of unknown length; framed with chunked
    /// encoding. Not replayable, so not clonable for redirects.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl RequestBody {
    /// Body length when known ahead of time.
    pub fn len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(b) => Some(b.len() as u64),
            RequestBody::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }

    pub(crate) fn try_clone(&self) -> Option<RequestBody> {
        match self {
            RequestBody::Empty => Some(RequestBody::Empty),
            RequestBody::Bytes(b) => Some(RequestBody::Bytes(b.clone())),
            RequestBody::Stream(_) => None,
        }
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            RequestBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Which request-target form goes on the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetForm {
    /// `/path?query` — direct connections and tunneled proxying.
    Origin,
    /// Full URL — plaintext HTTP through a forward proxy.
    Absolute,
}

/// An immutable request: method, target URL, headers, body.
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: RequestBody,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub(crate) fn from_parts(
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: RequestBody,
    ) -> Self {
        Self {
            method,
            url,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut RequestBody {
        &mut self.body
    }

    /// Serialize the request line and headers.
    ///
    /// `defaults` merges beneath the request's own headers. `proxy_auth`
    /// carries the `Proxy-Authorization` value for the single 407 retry.
    pub(crate) fn encode_head(
        &self,
        defaults: &HeaderMap,
        target: TargetForm,
        persistent: bool,
        proxy_auth: Option<&HeaderValue>,
    ) -> Result<Vec<u8>> {
        let target_str = match target {
            TargetForm::Origin => origin_form(&self.url),
            TargetForm::Absolute => {
                let mut absolute = self.url.clone();
                absolute.set_fragment(None);
                absolute.to_string()
            }
        };

        let mut merged = merge_headers(defaults, &self.headers);
        if let Some(auth) = proxy_auth {
            merged.insert(header::PROXY_AUTHORIZATION, auth.clone());
        }

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(self.method.as_str().as_bytes());
        head.push(b' ');
        head.extend_from_slice(target_str.as_bytes());
        head.extend_from_slice(b" HTTP/1.1\r\n");

        // Host goes first; an explicitly supplied value wins.
        let host = match merged.remove(header::HOST) {
            Some(explicit) => explicit,
            None => host_header(&self.url)?,
        };
        write_header(&mut head, header::HOST.as_str(), host.as_bytes());

        match self.body.len() {
            Some(0) if !body_allowed(&self.method) => {}
            Some(len) => {
                if !merged.contains_key(header::CONTENT_LENGTH) {
                    write_header(
                        &mut head,
                        header::CONTENT_LENGTH.as_str(),
                        len.to_string().as_bytes(),
                    );
                }
            }
            None => {
                merged.remove(header::TRANSFER_ENCODING);
                write_header(&mut head, header::TRANSFER_ENCODING.as_str(), b"chunked");
            }
        }

        if !persistent && !merged.contains_key(header::CONNECTION) {
            write_header(&mut head, header::CONNECTION.as_str(), b"close");
        }

        for (name, value) in merged.iter() {
            write_header(&mut head, name.as_str(), value.as_bytes());
        }
        head.extend_from_slice(b"\r\n");
        Ok(head)
    }
}

/// Merge default headers beneath explicit ones. Every explicitly set key
/// replaces all default values for that key; multi-valued explicit
/// headers survive intact.
pub(crate) fn merge_headers(defaults: &HeaderMap, explicit: &HeaderMap) -> HeaderMap {
    let mut merged = defaults.clone();
    for name in explicit.keys() {
        merged.remove(name);
    }
    for (name, value) in explicit.iter() {
        merged.append(name.clone(), value.clone());
    }
    merged
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn host_header(url: &Url) -> Result<HeaderValue> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Configuration(format!("URL has no host: {url}")))?;
    // `Url::port` already strips scheme-default ports.
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value)
        .map_err(|_| Error::Configuration(format!("invalid host header: {value}")))
}

/// GET and HEAD requests with empty bodies skip `Content-Length: 0`.
fn body_allowed(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD
}
