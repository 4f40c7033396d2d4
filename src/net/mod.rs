//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher resolves (host, port, scheme)
//!     → connection.rs (resolve + connect, request/response framing)
//!     → tls.rs (optional TLS handshake, possibly through a proxy tunnel)
//!     → stream.rs (unified plaintext/TLS transport handle)
//!
//! Connection States:
//!     Idle → InUse → { Idle (keep-alive) | Closed }
//! ```
//!
//! # Design Decisions
//! - One transport per Connection, strictly sequential request/response
//! - TLS is optional and handled transparently behind the Stream enum
//! - Every socket operation runs under the request's TimeoutGuard

pub mod connection;
pub mod stream;
pub mod tls;

pub use connection::{BodyFraming, Connection, ConnectionId, ResponseHead};
pub use stream::Stream;
pub use tls::TlsContext;
