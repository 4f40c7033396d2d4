//! Connection lifecycle, request serialization, and response framing.
//!
//! # Responsibilities
//! - Resolve + connect to a destination (optionally upgrading to TLS)
//! - Write a serialized request head and body onto the wire
//! - Parse the response head and stream the body per its framing
//! - Track state for keep-alive reuse (Idle → InUse → Idle | Closed)
//!
//! # Design Decisions
//! - One transport per Connection, no pipelining
//! - All socket operations run under the caller's TimeoutGuard
//! - A connection that saw a 407 proxy challenge carries a `challenged`
//!   flag and is never returned to the reuse pool

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result, TimeoutOp};
use crate::net::stream::Stream;
use crate::net::tls::TlsContext;
use crate::request::RequestBody;
use crate::timeout::TimeoutGuard;

/// Upper bound on a response head (status line + headers).
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on a single framing line (status, chunk size, trailer).
const MAX_LINE_BYTES: usize = 16 * 1024;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is sufficient; only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection, used in tracing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Ready for checkout (keep-alive).
    Idle,
    /// Exclusively held by one in-flight request.
    InUse,
    /// Transport released; never reused.
    Closed,
}

/// Parsed status line and headers of a response.
///
/// Available before any body consumption begins.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// How the remaining response body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head (HEAD, 1xx, 204, 304).
    Empty,
    /// `Content-Length` framing with this many bytes left to read.
    Length { remaining: u64 },
    /// `Transfer-Encoding: chunked` framing.
    Chunked(ChunkPhase),
    /// No length information; the body ends when the peer closes.
    UntilClose,
    /// Body fully consumed.
    Done,
}

/// Position within the chunked-encoding state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPhase {
    /// Expecting a hex chunk-size line.
    Size,
    /// Inside a chunk with this many payload bytes left.
    Data { remaining: u64 },
    /// Expecting the CRLF that terminates a chunk's payload.
    DataEnd,
    /// Expecting trailer lines after the zero-size chunk.
    Trailers,
}

/// One live transport plus its read buffer and lifecycle state.
pub struct Connection {
    id: ConnectionId,
    stream: Stream,
    buf: BytesMut,
    state: ConnState,
    challenged: bool,
}

impl Connection {
    /// Resolve and connect a plaintext socket under the guard's connect
    /// budget. The new connection starts in `InUse`.
    pub(crate) async fn open(host: &str, port: u16, guard: &TimeoutGuard) -> Result<Self> {
        let stream = guard
            .run(TimeoutOp::Connect, TcpStream::connect((host, port)))
            .await?;
        let _ = stream.set_nodelay(true);
        let conn = Self {
            id: ConnectionId::new(),
            stream: Stream::Plain(stream),
            buf: BytesMut::with_capacity(8 * 1024),
            state: ConnState::InUse,
            challenged: false,
        };
        tracing::debug!(id = %conn.id, host, port, "connection opened");
        Ok(conn)
    }

    /// Upgrade a plaintext connection to TLS for `server_name`.
    ///
    /// The socket may point at the destination directly or at a proxy
    /// tunnel established beforehand; both are plain byte pipes here.
    /// The handshake runs under the connect budget.
    pub(crate) async fn upgrade_tls(
        self,
        ctx: &TlsContext,
        server_name: &str,
        guard: &TimeoutGuard,
    ) -> Result<Self> {
        if !self.buf.is_empty() {
            return Err(Error::Protocol(
                "unexpected bytes on the wire before TLS handshake".into(),
            ));
        }
        let Self {
            id,
            stream,
            buf,
            state,
            challenged,
        } = self;
        let tcp = match stream {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(_) => {
                return Err(Error::Protocol("TLS session already established".into()))
            }
        };
        let tls = guard
            .run(TimeoutOp::Connect, ctx.handshake(server_name, tcp))
            .await?;
        tracing::debug!(id = %id, server_name, "TLS handshake complete");
        Ok(Self {
            id,
            stream: Stream::Tls(Box::new(tls)),
            buf,
            state,
            challenged,
        })
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Whether this connection received a 407 proxy challenge. Challenged
    /// connections are never pooled; the handshake must be redone.
    pub(crate) fn challenged(&self) -> bool {
        self.challenged
    }

    pub(crate) fn mark_challenged(&mut self) {
        self.challenged = true;
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.state = ConnState::InUse;
    }

    /// Return the connection to the reusable state after a drained,
    /// keep-alive response.
    pub(crate) fn mark_idle(&mut self) {
        self.state = ConnState::Idle;
    }

    /// Unconditional, idempotent close.
    pub(crate) async fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        let _ = self.stream.shutdown().await;
        tracing::trace!(id = %self.id, "connection closed");
    }

    /// Write raw bytes under the guard's write budget.
    pub(crate) async fn write_all(&mut self, bytes: &[u8], guard: &TimeoutGuard) -> Result<()> {
        guard
            .run(TimeoutOp::Write, self.stream.write_all(bytes))
            .await
    }

    /// Write a serialized request head and its body.
    ///
    /// Bodies with a known length were already announced via
    /// `Content-Length` in the head; streaming bodies go out with
    /// chunked framing as announced by `Transfer-Encoding`.
    pub(crate) async fn send(
        &mut self,
        head: &[u8],
        body: &mut RequestBody,
        guard: &TimeoutGuard,
    ) -> Result<()> {
        self.write_all(head, guard).await?;
        match body {
            RequestBody::Empty => {}
            RequestBody::Bytes(bytes) => {
                let payload = bytes.clone();
                self.write_all(&payload, guard).await?;
            }
            RequestBody::Stream(reader) => {
                let mut chunk = vec![0u8; 8 * 1024];
                loop {
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    let mut framed = Vec::with_capacity(n + 16);
                    framed.extend_from_slice(format!("{n:x}\r\n").as_bytes());
                    framed.extend_from_slice(&chunk[..n]);
                    framed.extend_from_slice(b"\r\n");
                    self.write_all(&framed, guard).await?;
                }
                self.write_all(b"0\r\n\r\n", guard).await?;
            }
        }
        guard.run(TimeoutOp::Write, self.stream.flush()).await
    }

    /// Read and parse the response head. Returns as soon as the final
    /// CRLF CRLF arrives; body bytes stay buffered for the framing reader.
    pub(crate) async fn read_head(&mut self, guard: &TimeoutGuard) -> Result<ResponseHead> {
        loop {
            if let Some(end) = find_subsequence(&self.buf, b"\r\n\r\n") {
                let raw = self.buf.split_to(end + 4);
                return parse_head(&raw[..end]);
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(Error::Protocol("response head exceeds 64 KiB".into()));
            }
            if self.fill(guard).await? == 0 {
                if self.buf.is_empty() {
                    // Clean EOF before any head byte: the peer dropped a
                    // kept-alive connection. Report it as I/O so the
                    // dispatcher can retry on a fresh socket.
                    return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
                return Err(Error::Protocol(
                    "connection closed before response head was complete".into(),
                ));
            }
        }
    }

    /// Read the next piece of the body per `framing`, advancing its
    /// state. `Ok(None)` means the body is fully consumed.
    pub(crate) async fn read_body_chunk(
        &mut self,
        framing: &mut BodyFraming,
        guard: &TimeoutGuard,
    ) -> Result<Option<Bytes>> {
        loop {
            match *framing {
                BodyFraming::Done => return Ok(None),
                BodyFraming::Empty => {
                    *framing = BodyFraming::Done;
                    return Ok(None);
                }
                BodyFraming::Length { remaining } => {
                    if remaining == 0 {
                        *framing = BodyFraming::Done;
                        return Ok(None);
                    }
                    if self.buf.is_empty() && self.fill(guard).await? == 0 {
                        return Err(Error::Protocol("connection closed mid-body".into()));
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    *framing = BodyFraming::Length {
                        remaining: remaining - take as u64,
                    };
                    return Ok(Some(self.buf.split_to(take).freeze()));
                }
                BodyFraming::UntilClose => {
                    if !self.buf.is_empty() {
                        return Ok(Some(self.buf.split().freeze()));
                    }
                    if self.fill(guard).await? == 0 {
                        *framing = BodyFraming::Done;
                        return Ok(None);
                    }
                }
                BodyFraming::Chunked(ChunkPhase::Size) => {
                    let line = self.read_line(guard).await?;
                    let size = parse_chunk_size(&line)?;
                    *framing = if size == 0 {
                        BodyFraming::Chunked(ChunkPhase::Trailers)
                    } else {
                        BodyFraming::Chunked(ChunkPhase::Data { remaining: size })
                    };
                }
                BodyFraming::Chunked(ChunkPhase::Data { remaining }) => {
                    if self.buf.is_empty() && self.fill(guard).await? == 0 {
                        return Err(Error::Protocol("connection closed mid-chunk".into()));
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    let left = remaining - take as u64;
                    *framing = if left == 0 {
                        BodyFraming::Chunked(ChunkPhase::DataEnd)
                    } else {
                        BodyFraming::Chunked(ChunkPhase::Data { remaining: left })
                    };
                    return Ok(Some(self.buf.split_to(take).freeze()));
                }
                BodyFraming::Chunked(ChunkPhase::DataEnd) => {
                    let line = self.read_line(guard).await?;
                    if !line.is_empty() {
                        return Err(Error::Protocol("missing CRLF after chunk payload".into()));
                    }
                    *framing = BodyFraming::Chunked(ChunkPhase::Size);
                }
                BodyFraming::Chunked(ChunkPhase::Trailers) => {
                    // Trailers are read for framing correctness and discarded.
                    let line = self.read_line(guard).await?;
                    if line.is_empty() {
                        *framing = BodyFraming::Done;
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Read the body to completion, buffering it in memory.
    pub(crate) async fn drain_body(
        &mut self,
        framing: &mut BodyFraming,
        guard: &TimeoutGuard,
    ) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.read_body_chunk(framing, guard).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Pull more bytes from the transport into the read buffer under the
    /// guard's read budget. Returns the number of bytes read (0 on EOF).
    async fn fill(&mut self, guard: &TimeoutGuard) -> Result<usize> {
        guard
            .run(TimeoutOp::Read, self.stream.read_buf(&mut self.buf))
            .await
    }

    /// Consume one CRLF-terminated line, excluding the terminator.
    async fn read_line(&mut self, guard: &TimeoutGuard) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = find_subsequence(&self.buf, b"\r\n") {
                let line = self.buf.split_to(pos).to_vec();
                self.buf.advance(2);
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_BYTES {
                return Err(Error::Protocol("framing line exceeds 16 KiB".into()));
            }
            if self.fill(guard).await? == 0 {
                return Err(Error::Protocol(
                    "connection closed inside a framing line".into(),
                ));
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("tls", &self.stream.is_tls())
            .field("challenged", &self.challenged)
            .finish()
    }
}

/// Decide body framing from a parsed head.
///
/// HEAD responses never carry a body even when `Content-Length` claims
/// one; the header still describes the resource.
pub(crate) fn body_framing(head: &ResponseHead, for_head_request: bool) -> BodyFraming {
    if for_head_request
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return BodyFraming::Empty;
    }
    let chunked = head
        .headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return BodyFraming::Chunked(ChunkPhase::Size);
    }
    if let Some(len) = head
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return BodyFraming::Length { remaining: len };
    }
    BodyFraming::UntilClose
}

/// Whether the response permits transport reuse after a full drain.
pub(crate) fn allows_reuse(head: &ResponseHead, framing: &BodyFraming) -> bool {
    if matches!(framing, BodyFraming::UntilClose) {
        return false;
    }
    let connection_tokens: Vec<String> = head
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect();
    match head.version {
        Version::HTTP_11 => !connection_tokens.iter().any(|t| t == "close"),
        Version::HTTP_10 => connection_tokens.iter().any(|t| t == "keep-alive"),
        _ => false,
    }
}

/// Parse a status line + header block (without the trailing CRLF CRLF).
pub(crate) fn parse_head(raw: &[u8]) -> Result<ResponseHead> {
    let mut lines = raw.split(|&b| b == b'\n').map(|line| {
        line.strip_suffix(b"\r").unwrap_or(line)
    });
    let status_line = lines
        .next()
        .ok_or_else(|| Error::Protocol("empty response head".into()))?;
    let status_line = std::str::from_utf8(status_line)
        .map_err(|_| Error::Protocol("status line is not valid UTF-8".into()))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        Some(other) => {
            return Err(Error::Protocol(format!(
                "unsupported HTTP version in status line: {other}"
            )))
        }
        None => return Err(Error::Protocol("malformed status line".into())),
    };
    let status = parts
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or_else(|| Error::Protocol(format!("malformed status line: {status_line}")))?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| Error::Protocol("header line missing colon".into()))?;
        let name = HeaderName::from_bytes(trim_bytes(&line[..colon]))
            .map_err(|e| Error::Protocol(format!("invalid header name: {e}")))?;
        let value = HeaderValue::from_bytes(trim_bytes(&line[colon + 1..]))
            .map_err(|e| Error::Protocol(format!("invalid header value: {e}")))?;
        headers.append(name, value);
    }
    Ok(ResponseHead {
        version,
        status,
        headers,
    })
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let line = std::str::from_utf8(line)
        .map_err(|_| Error::Protocol("chunk size line is not valid UTF-8".into()))?;
    // Chunk extensions after ';' are allowed and ignored.
    let size = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| Error::Protocol(format!("invalid chunk size: {size:?}")))
}

fn trim_bytes(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
