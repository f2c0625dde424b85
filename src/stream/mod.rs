//! Stream modules.
//!
//! - `transport`: duplex transport contract and the in-memory channel pair.
//! - `json_lines`: newline-delimited JSON transport over tokio byte streams.
//! - `proto`: user-service messages shared with the remote peer.
//! - `session`: bidirectional session with half-close, cancellation, and a
//!   single join point.
//! - `client`: typed client for the four user-service RPCs.

/// Typed user-service client and connector contract.
pub mod client;
/// JSON-lines transport.
pub mod json_lines;
/// User-service protocol messages.
pub mod proto;
/// Stream session driving concurrent send and receive loops.
pub mod session;
/// Transport trait, errors, and channel transport.
pub mod transport;
