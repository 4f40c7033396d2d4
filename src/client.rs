//! Dispatcher and the chainable client surface.
//!
//! # Data Flow
//! ```text
//! Client.perform(request)
//!     → cache collaborator (optional, with default dispatch as fallback)
//!     → redirect.rs (optional hop loop)
//!     → dispatch: pool checkout | open (proxy.rs negotiates when set)
//!     → connection.send / read_head under the TimeoutGuard
//!     → Response (body streamed, or drained + pooled in persistent mode)
//! ```
//!
//! # Design Decisions
//! - Chaining methods clone the option bag into a brand-new client;
//!   shared option state is never mutated
//! - The persistent pool holds one connection per (scheme, host, port);
//!   concurrent calls that miss the pool open fresh connections
//! - A reused keep-alive connection that dies before yielding a response
//!   head is retried once on a fresh connection

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use url::Url;

use crate::cache::{Cache, Dispatch};
use crate::error::{Error, Result};
use crate::net::connection::{allows_reuse, body_framing, BodyFraming, Connection, ResponseHead};
use crate::net::tls::TlsContext;
use crate::options::{BasicAuth, ClientOptions, FollowPolicy};
use crate::proxy::{self, ProxyOptions, ResolvedProxy, TunnelOutcome};
use crate::redirect;
use crate::request::{Request, RequestBody, TargetForm};
use crate::response::{Body, Response};
use crate::timeout::{TimeoutGuard, TimeoutOptions, TimeoutPolicy};

/// Destination identity for connection reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnectionKey {
    scheme: SchemeKind,
    host: String,
    port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SchemeKind {
    Http,
    Https,
}

/// One pooled connection per destination key.
///
/// Checkout removes the connection from the pool, giving the in-flight
/// request exclusive ownership; concurrent calls that miss simply open
/// fresh connections.
#[derive(Default)]
struct ConnectionPool {
    slots: Mutex<HashMap<ConnectionKey, Connection>>,
}

impl ConnectionPool {
    async fn checkout(&self, key: &ConnectionKey) -> Option<Connection> {
        let mut slots = self.slots.lock().await;
        let mut conn = slots.remove(key)?;
        if conn.state() == crate::net::connection::ConnState::Idle && !conn.challenged() {
            conn.mark_in_use();
            Some(conn)
        } else {
            conn.close().await;
            None
        }
    }

    async fn checkin(&self, key: ConnectionKey, mut conn: Connection) {
        let mut slots = self.slots.lock().await;
        if slots.contains_key(&key) {
            // The slot was refilled by a concurrent call; keep the
            // resident connection and discard this one.
            conn.close().await;
            return;
        }
        slots.insert(key, conn);
    }

    async fn close_all(&self) {
        let mut slots = self.slots.lock().await;
        for (_, mut conn) in slots.drain() {
            conn.close().await;
        }
    }
}

/// The HTTP client: an immutable option bag plus a connection pool.
///
/// Cloning is cheap and shares the pool; chaining methods (`auth`,
/// `via`, `timeout`, ...) derive a *new* client and never mutate the
/// original.
#[derive(Clone)]
pub struct Client {
    options: ClientOptions,
    pool: Arc<ConnectionPool>,
}

impl Client {
    pub fn new() -> Self {
        Self::with_options(ClientOptions::default())
    }

    pub fn with_options(options: ClientOptions) -> Self {
        Self {
            options,
            pool: Arc::new(ConnectionPool::default()),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Derive a new client from adjusted options. The derived client
    /// starts with an empty connection pool.
    fn derive(&self, options: ClientOptions) -> Client {
        Client::with_options(options)
    }

    /// Derived client whose default `Authorization` header is the textual
    /// form of `token`. Anything displayable works, not just strings.
    pub fn auth<T: std::fmt::Display>(&self, token: T) -> Result<Client> {
        let text = token.to_string();
        let value = HeaderValue::from_str(&text)
            .map_err(|_| Error::Configuration(format!("invalid authorization value: {text:?}")))?;
        let mut options = self.options.clone();
        options
            .default_headers
            .insert(http::header::AUTHORIZATION, value);
        Ok(self.derive(options))
    }

    /// Derived client with `Authorization: Basic base64(user:pass)`.
    /// Missing keys fail eagerly with a configuration error.
    pub fn basic_auth(&self, credentials: BasicAuth) -> Result<Client> {
        let (user, pass) = credentials.require()?;
        let value = proxy::basic_credentials(user, pass);
        let mut options = self.options.clone();
        options
            .default_headers
            .insert(http::header::AUTHORIZATION, value);
        Ok(self.derive(options))
    }

    /// Derived client routing through a forward proxy. The options are
    /// validated now, before any connection attempt.
    pub fn via(&self, proxy: ProxyOptions) -> Result<Client> {
        proxy.resolve()?;
        let mut options = self.options.clone();
        options.proxy = Some(proxy);
        Ok(self.derive(options))
    }

    /// `via` from loose positional parts: address, port, credentials,
    /// and ignored extras.
    pub fn via_parts(&self, parts: &[&str]) -> Result<Client> {
        self.via(ProxyOptions::from_parts(parts)?)
    }

    /// Derived client with the per-operation timeout policy.
    pub fn timeout(&self, timeouts: TimeoutOptions) -> Client {
        let mut options = self.options.clone();
        options.timeout = TimeoutPolicy::per_operation(&timeouts);
        self.derive(options)
    }

    /// Derived client with the named timeout policy (`per_operation`,
    /// `global`, or `null`). An unknown name is a configuration error
    /// carrying the offending identifier.
    pub fn timeout_policy(&self, policy: &str, timeouts: TimeoutOptions) -> Result<Client> {
        let mut options = self.options.clone();
        options.timeout = TimeoutPolicy::from_name(policy, &timeouts)?;
        Ok(self.derive(options))
    }

    /// Derived client with extra default headers.
    pub fn headers(&self, entries: &[(&str, &str)]) -> Result<Client> {
        let mut options = self.options.clone();
        for (name, value) in entries {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Configuration(format!("invalid header name: {name:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::Configuration(format!("invalid header value: {value:?}")))?;
            options.default_headers.insert(name, value);
        }
        Ok(self.derive(options))
    }

    /// Derived client that follows redirects up to `max_hops`.
    pub fn follow(&self, max_hops: usize) -> Client {
        let mut options = self.options.clone();
        options.follow = Some(FollowPolicy { max_hops });
        self.derive(options)
    }

    /// Derived client with an injected TLS trust configuration.
    pub fn tls_context(&self, tls: TlsContext) -> Client {
        let mut options = self.options.clone();
        options.tls = Some(tls);
        self.derive(options)
    }

    /// Derived client with an injected cache collaborator.
    pub fn cache(&self, cache: Arc<dyn Cache>) -> Client {
        let mut options = self.options.clone();
        options.cache = Some(cache);
        self.derive(options)
    }

    /// Derived persistent-mode client pinned to `host`. Connections are
    /// kept alive across calls until [`Client::close`].
    pub fn persistent(&self, host: &str) -> Result<Client> {
        let base = Url::parse(host)?;
        if base.host_str().is_none() {
            return Err(Error::Configuration(format!(
                "persistent host has no authority: {host}"
            )));
        }
        let mut options = self.options.clone();
        options.persistent = true;
        options.base_url = Some(base);
        Ok(self.derive(options))
    }

    /// Scoped persistent client: runs `scope` with a persistent client
    /// and closes its connections on every exit path, returning the
    /// scope's result.
    pub async fn persistent_scope<F, Fut, T>(&self, host: &str, scope: F) -> Result<T>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = self.persistent(host)?;
        let result = scope(client.clone()).await;
        client.close().await;
        result
    }

    /// Close all pooled connections. Idempotent.
    pub async fn close(&self) {
        self.pool.close_all().await;
    }

    /// Start building a request. Relative targets resolve against the
    /// persistent base URL when one is set.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let resolved = match Url::parse(url) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.options.base_url {
                Some(base) => base.join(url).map_err(Error::from),
                None => Err(Error::Configuration(format!(
                    "relative URL {url:?} without a persistent base"
                ))),
            },
            Err(e) => Err(e.into()),
        };
        RequestBuilder {
            client: self.clone(),
            inner: resolved.map(|url| RequestParts {
                method,
                url,
                headers: HeaderMap::new(),
                body: RequestBody::Empty,
            }),
        }
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    pub fn patch(&self, url: &str) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    pub fn head(&self, url: &str) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Perform a request: the single entry point of the engine.
    pub async fn perform(&self, request: Request) -> Result<Response> {
        if let Some(cache) = &self.options.cache {
            let cache = Arc::clone(cache);
            return cache.perform(request, Dispatch::new(self)).await;
        }
        self.perform_uncached(request).await
    }

    /// Dispatch without consulting the cache collaborator; this is the
    /// `default_behavior` handed to caches.
    pub(crate) async fn perform_uncached(&self, request: Request) -> Result<Response> {
        match self.options.follow {
            Some(policy) => redirect::follow(self, request, policy).await,
            None => self.dispatch(request).await,
        }
    }

    /// One dispatch hop: acquire a connection, exchange, frame the body.
    pub(crate) async fn dispatch(&self, mut request: Request) -> Result<Response> {
        let (scheme, host, port) = target_of(request.url())?;
        let proxy = match &self.options.proxy {
            Some(options) => Some(options.resolve()?),
            None => None,
        };
        let guard = self.options.timeout.start();
        let key = ConnectionKey {
            scheme,
            host: host.clone(),
            port,
        };
        let is_head = *request.method() == Method::HEAD;
        let target_form = match (&proxy, scheme) {
            (Some(_), SchemeKind::Http) => TargetForm::Absolute,
            _ => TargetForm::Origin,
        };

        tracing::debug!(
            method = %request.method(),
            url = %request.url(),
            proxied = proxy.is_some(),
            "dispatching request"
        );

        // Acquire a connection: pool checkout in persistent mode, a
        // fresh open otherwise. Opening may already end the request when
        // the proxy denies the tunnel.
        let (mut conn, reused) = if self.options.persistent {
            match self.pool.checkout(&key).await {
                Some(conn) => {
                    tracing::trace!(id = %conn.id(), "reusing pooled connection");
                    (conn, true)
                }
                None => match self.open(proxy.as_ref(), scheme, &host, port, &guard).await? {
                    Opened::Conn(conn) => (conn, false),
                    Opened::Denied(head, body) => return Ok(denied_response(head, body)),
                },
            }
        } else {
            match self.open(proxy.as_ref(), scheme, &host, port, &guard).await? {
                Opened::Conn(conn) => (conn, false),
                Opened::Denied(head, body) => return Ok(denied_response(head, body)),
            }
        };

        let head = match self
            .exchange(&mut conn, &mut request, target_form, None, &guard)
            .await
        {
            Ok(head) => head,
            Err(e) if reused && matches!(e, Error::Io(_)) && replayable(&request) => {
                // The kept-alive socket died between requests. Retry once
                // on a fresh connection; the request body is replayable.
                tracing::debug!(id = %conn.id(), error = %e, "stale pooled connection, retrying");
                conn.close().await;
                let mut fresh = match self.open(proxy.as_ref(), scheme, &host, port, &guard).await? {
                    Opened::Conn(conn) => conn,
                    Opened::Denied(head, body) => return Ok(denied_response(head, body)),
                };
                match self
                    .exchange(&mut fresh, &mut request, target_form, None, &guard)
                    .await
                {
                    Ok(head) => {
                        conn = fresh;
                        head
                    }
                    Err(e) => {
                        fresh.close().await;
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };

        // Plaintext proxying gets its 407 challenge on the request
        // itself rather than on a CONNECT exchange. Retry once with
        // credentials, then surface whatever comes back.
        if head.status == http::StatusCode::PROXY_AUTHENTICATION_REQUIRED
            && target_form == TargetForm::Absolute
            && !conn.challenged()
        {
            conn.mark_challenged();
            if let Some(resolved) = proxy.as_ref() {
                if let (Some(credentials), true) =
                    (resolved.credentials.clone(), replayable(&request))
                {
                    tracing::debug!("proxy challenged request, retrying with credentials");
                    let mut framing = body_framing(&head, is_head);
                    let _ = conn.drain_body(&mut framing, &guard).await;
                    conn.close().await;

                    let mut retry =
                        Connection::open(&resolved.address, resolved.port, &guard).await?;
                    retry.mark_challenged();
                    match self
                        .exchange(
                            &mut retry,
                            &mut request,
                            target_form,
                            Some(&credentials),
                            &guard,
                        )
                        .await
                    {
                        Ok(retry_head) => {
                            return self.finish(retry, key, is_head, retry_head, guard).await;
                        }
                        Err(e) => {
                            retry.close().await;
                            return Err(e);
                        }
                    }
                }
            }
        }

        self.finish(conn, key, is_head, head, guard).await
    }

    /// Open a connection to the destination, negotiating proxy and TLS
    /// as configured.
    async fn open(
        &self,
        proxy: Option<&ResolvedProxy>,
        scheme: SchemeKind,
        host: &str,
        port: u16,
        guard: &TimeoutGuard,
    ) -> Result<Opened> {
        match (proxy, scheme) {
            (None, SchemeKind::Http) => {
                Ok(Opened::Conn(Connection::open(host, port, guard).await?))
            }
            (None, SchemeKind::Https) => {
                let conn = Connection::open(host, port, guard).await?;
                let tls = self.tls_config();
                Ok(Opened::Conn(conn.upgrade_tls(&tls, host, guard).await?))
            }
            (Some(proxy), SchemeKind::Http) => Ok(Opened::Conn(
                Connection::open(&proxy.address, proxy.port, guard).await?,
            )),
            (Some(proxy), SchemeKind::Https) => {
                match proxy::establish_tunnel(proxy, host, port, guard).await? {
                    TunnelOutcome::Established(conn) => {
                        let tls = self.tls_config();
                        Ok(Opened::Conn(conn.upgrade_tls(&tls, host, guard).await?))
                    }
                    TunnelOutcome::Denied(head, body) => Ok(Opened::Denied(head, body)),
                }
            }
        }
    }

    fn tls_config(&self) -> TlsContext {
        self.options.tls.clone().unwrap_or_default()
    }

    /// Serialize + send the request and parse the response head.
    async fn exchange(
        &self,
        conn: &mut Connection,
        request: &mut Request,
        target: TargetForm,
        proxy_auth: Option<&HeaderValue>,
        guard: &TimeoutGuard,
    ) -> Result<ResponseHead> {
        let head = request.encode_head(
            &self.options.default_headers,
            target,
            self.options.persistent,
            proxy_auth,
        )?;
        conn.send(&head, request.body_mut(), guard).await?;
        conn.read_head(guard).await
    }

    /// Turn a parsed head into a Response, deciding the connection's
    /// fate: pooled, carried inside the body, or closed.
    async fn finish(
        &self,
        mut conn: Connection,
        key: ConnectionKey,
        is_head: bool,
        head: ResponseHead,
        guard: TimeoutGuard,
    ) -> Result<Response> {
        let mut framing = body_framing(&head, is_head);
        let reusable = allows_reuse(&head, &framing) && !conn.challenged();

        if self.options.persistent {
            // Drain up front so the transport is reusable before the
            // caller touches the payload.
            let body = match conn.drain_body(&mut framing, &guard).await {
                Ok(body) => body,
                Err(e) => {
                    conn.close().await;
                    return Err(e);
                }
            };
            if reusable {
                conn.mark_idle();
                self.pool.checkin(key, conn).await;
            } else {
                conn.close().await;
            }
            return Ok(Response::new(
                head.status,
                head.version,
                head.headers,
                Body::buffered(body),
            ));
        }

        if matches!(framing, BodyFraming::Empty) {
            conn.close().await;
            return Ok(Response::new(
                head.status,
                head.version,
                head.headers,
                Body::empty(),
            ));
        }
        Ok(Response::new(
            head.status,
            head.version,
            head.headers,
            Body::streaming(conn, framing, guard),
        ))
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.options)
            .finish()
    }
}

enum Opened {
    Conn(Connection),
    Denied(ResponseHead, Bytes),
}

fn denied_response(head: ResponseHead, body: Bytes) -> Response {
    Response::new(head.status, head.version, head.headers, Body::buffered(body))
}

fn replayable(request: &Request) -> bool {
    request.body().len().is_some()
}

fn target_of(url: &Url) -> Result<(SchemeKind, String, u16)> {
    let scheme = match url.scheme() {
        "http" => SchemeKind::Http,
        "https" => SchemeKind::Https,
        other => {
            return Err(Error::Configuration(format!(
                "unsupported URL scheme: {other}"
            )))
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| Error::Configuration(format!("URL has no host: {url}")))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Configuration(format!("URL has no port: {url}")))?;
    Ok((scheme, host, port))
}

/// Builder for one request, tied to the client that will send it.
pub struct RequestBuilder {
    client: Client,
    inner: Result<RequestParts>,
}

struct RequestParts {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: RequestBody,
}

impl RequestBuilder {
    fn map(mut self, f: impl FnOnce(RequestParts) -> Result<RequestParts>) -> Self {
        self.inner = self.inner.and_then(f);
        self
    }

    /// Add a header to this request (overrides any default header of
    /// the same name).
    pub fn header(self, name: &str, value: &str) -> Self {
        let name = name.to_string();
        let value = value.to_string();
        self.map(move |mut parts| {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Configuration(format!("invalid header name: {name:?}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| Error::Configuration(format!("invalid header value: {value:?}")))?;
            parts.headers.append(name, value);
            Ok(parts)
        })
    }

    /// Merge query parameters into the URL, keeping any parameters the
    /// URL string already carried.
    pub fn query(self, pairs: &[(&str, &str)]) -> Self {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.map(move |mut parts| {
            parts.url.query_pairs_mut().extend_pairs(pairs);
            Ok(parts)
        })
    }

    /// Raw request body with a known length.
    pub fn body(self, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        self.map(move |mut parts| {
            parts.body = RequestBody::Bytes(bytes);
            Ok(parts)
        })
    }

    /// URL-encoded form body.
    pub fn form(self, fields: &[(&str, &str)]) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        self.map(move |mut parts| {
            parts.headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
            parts.body = RequestBody::Bytes(Bytes::from(encoded));
            Ok(parts)
        })
    }

    /// JSON body.
    pub fn json<T: Serialize>(self, value: &T) -> Self {
        let encoded = serde_json::to_vec(value)
            .map_err(|e| Error::Configuration(format!("unserializable JSON body: {e}")));
        self.map(move |mut parts| {
            parts.headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            parts.body = RequestBody::Bytes(Bytes::from(encoded?));
            Ok(parts)
        })
    }

    /// Streaming body of unknown length, sent with chunked framing.
    pub fn stream_body(self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        self.map(move |mut parts| {
            parts.body = RequestBody::Stream(reader);
            Ok(parts)
        })
    }

    /// Build the immutable request value.
    pub fn build(self) -> Result<Request> {
        let parts = self.inner?;
        Ok(Request::from_parts(
            parts.method,
            parts.url,
            parts.headers,
            parts.body,
        ))
    }

    /// Build and perform in one step.
    pub async fn send(self) -> Result<Response> {
        let client = self.client.clone();
        let request = self.build()?;
        client.perform(request).await
    }
}
