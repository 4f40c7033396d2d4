//! Timeout enforcement subsystem.
//!
//! # Data Flow
//! ```text
//! ClientOptions.timeout (policy selection)
//!     → strategy.rs (policy → per-request TimeoutGuard)
//!     → guard wraps every connect/read/write future in net/connection.rs
//! ```
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from connection-reset errors and carry
//!   the operation that exceeded its budget
//! - A global deadline is computed once per request; once it has passed,
//!   further operations fail without attempting I/O

pub mod strategy;

pub use strategy::{TimeoutGuard, TimeoutOptions, TimeoutPolicy};
