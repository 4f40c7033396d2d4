//! Forward-proxy configuration and tunnel negotiation.
//!
//! # Data Flow
//! ```text
//! ClientOptions.proxy (validated ProxyOptions)
//!     → plaintext destination: absolute-form request line, no tunnel
//!     → TLS destination: CONNECT handshake, then TLS through the tunnel
//!
//! 407 handling (per connection attempt):
//!     unauthenticated CONNECT → 407 → retry once with credentials
//!     second 407, or no credentials → surfaced as a normal Response
//! ```
//!
//! # Design Decisions
//! - Credentials are never attached to the first attempt; the proxy asks
//!   via 407 first
//! - The challenged flag lives on the Connection so the retry-once
//!   invariant is auditable and challenged transports are never pooled
//! - A proxy address without a port is a configuration error raised
//!   before any socket is opened

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http::HeaderValue;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::net::connection::{body_framing, Connection, ResponseHead};
use crate::timeout::TimeoutGuard;

/// User-facing proxy configuration, consumed by `Client::via`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// Proxy host name or address.
    pub address: String,
    /// Proxy port. Required; absence is a configuration error, not a
    /// network error.
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Unrecognized trailing arguments, accepted and ignored as a
    /// forward-compatibility knob.
    pub extra: Vec<String>,
}

impl ProxyOptions {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port: Some(port),
            ..Self::default()
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Build options from loose positional parts:
    /// `[address, port, username, password, ...]`. Anything beyond the
    /// fourth part is ignored.
    pub fn from_parts(parts: &[&str]) -> Result<Self> {
        let mut options = ProxyOptions::default();
        match parts {
            [] => {
                return Err(Error::Configuration(
                    "proxy options require at least an address".into(),
                ))
            }
            [address, rest @ ..] => {
                options.address = (*address).to_string();
                if let Some(port) = rest.first() {
                    let port = port.parse::<u16>().map_err(|_| {
                        Error::Configuration(format!("invalid proxy port: {port:?}"))
                    })?;
                    options.port = Some(port);
                }
                if let Some(username) = rest.get(1) {
                    options.username = Some((*username).to_string());
                }
                if let Some(password) = rest.get(2) {
                    options.password = Some((*password).to_string());
                }
                if rest.len() > 3 {
                    options.extra = rest[3..].iter().map(|s| (*s).to_string()).collect();
                    tracing::debug!(
                        count = options.extra.len(),
                        "ignoring extra proxy arguments"
                    );
                }
            }
        }
        Ok(options)
    }

    /// Validate eagerly, before any network activity.
    pub(crate) fn resolve(&self) -> Result<ResolvedProxy> {
        if self.address.is_empty() {
            return Err(Error::Configuration("proxy address is empty".into()));
        }
        let port = self.port.ok_or_else(|| {
            Error::Configuration(format!("proxy \"{}\" is missing a port", self.address))
        })?;
        let credentials = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some(basic_credentials(user, pass)),
            (Some(user), None) => Some(basic_credentials(user, "")),
            _ => None,
        };
        Ok(ResolvedProxy {
            address: self.address.clone(),
            port,
            credentials,
        })
    }
}

/// Validated proxy settings ready for dispatch.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedProxy {
    pub(crate) address: String,
    pub(crate) port: u16,
    /// Pre-built `Basic` credential value, when configured.
    pub(crate) credentials: Option<HeaderValue>,
}

/// `Basic base64(user:pass)` header value, shared by proxy authorization
/// and `Client::basic_auth`.
pub(crate) fn basic_credentials(user: &str, pass: &str) -> HeaderValue {
    let encoded = BASE64.encode(format!("{user}:{pass}"));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic"));
    value.set_sensitive(true);
    value
}

/// Result of a CONNECT negotiation.
pub(crate) enum TunnelOutcome {
    /// The proxy agreed to forward bytes; TLS can now run through it.
    Established(Connection),
    /// The proxy refused (407 or otherwise). Surfaced to the caller as a
    /// normal response, never an error.
    Denied(ResponseHead, Bytes),
}

/// Negotiate a byte tunnel to `host:port` through the proxy.
///
/// Retries exactly once with credentials after a 407 challenge; a second
/// challenge is surfaced, not retried.
pub(crate) async fn establish_tunnel(
    proxy: &ResolvedProxy,
    host: &str,
    port: u16,
    guard: &TimeoutGuard,
) -> Result<TunnelOutcome> {
    let mut conn = Connection::open(&proxy.address, proxy.port, guard).await?;
    let head = connect_exchange(&mut conn, host, port, None, guard).await?;

    if head.status.is_success() {
        tracing::debug!(id = %conn.id(), host, port, "proxy tunnel established");
        return Ok(TunnelOutcome::Established(conn));
    }

    if head.status == http::StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        conn.mark_challenged();
        if let Some(credentials) = proxy.credentials.clone() {
            tracing::debug!(id = %conn.id(), "proxy challenged tunnel, retrying with credentials");
            // The challenge response may close the transport; negotiate the
            // authenticated attempt on a fresh connection.
            drain_and_close(&mut conn, &head, guard).await?;
            let mut retry = Connection::open(&proxy.address, proxy.port, guard).await?;
            retry.mark_challenged();
            let retry_head =
                connect_exchange(&mut retry, host, port, Some(&credentials), guard).await?;
            if retry_head.status.is_success() {
                tracing::debug!(id = %retry.id(), host, port, "proxy tunnel established");
                return Ok(TunnelOutcome::Established(retry));
            }
            let body = drain_denied(&mut retry, &retry_head, guard).await?;
            return Ok(TunnelOutcome::Denied(retry_head, body));
        }
    }

    let body = drain_denied(&mut conn, &head, guard).await?;
    Ok(TunnelOutcome::Denied(head, body))
}

/// Write one CONNECT request and parse the proxy's response head.
async fn connect_exchange(
    conn: &mut Connection,
    host: &str,
    port: u16,
    credentials: Option<&HeaderValue>,
    guard: &TimeoutGuard,
) -> Result<ResponseHead> {
    let request = encode_connect(host, port, credentials);
    conn.write_all(&request, guard).await?;
    conn.read_head(guard).await
}

fn encode_connect(host: &str, port: u16, credentials: Option<&HeaderValue>) -> Vec<u8> {
    let mut head = Vec::with_capacity(128);
    head.extend_from_slice(format!("CONNECT {host}:{port} HTTP/1.1\r\n").as_bytes());
    head.extend_from_slice(format!("host: {host}:{port}\r\n").as_bytes());
    if let Some(credentials) = credentials {
        head.extend_from_slice(b"proxy-authorization: ");
        head.extend_from_slice(credentials.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Drain a refusal body so it can be surfaced, then close the transport.
async fn drain_denied(
    conn: &mut Connection,
    head: &ResponseHead,
    guard: &TimeoutGuard,
) -> Result<Bytes> {
    let mut framing = body_framing(head, false);
    let body = conn.drain_body(&mut framing, guard).await?;
    conn.close().await;
    Ok(body)
}

async fn drain_and_close(
    conn: &mut Connection,
    head: &ResponseHead,
    guard: &TimeoutGuard,
) -> Result<()> {
    let mut framing = body_framing(head, false);
    let _ = conn.drain_body(&mut framing, guard).await?;
    conn.close().await;
    Ok(())
}
