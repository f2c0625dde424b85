//! User-facing Rust SDK for the user service.
//!
//! The crate is organized around one streaming surface:
//! - `stream::session`: runs a send loop and a receive loop concurrently over
//!   one duplex transport and joins them into a single result.
//! - `stream::client`: typed client for the unary, server-streamed,
//!   client-streamed, and bidirectional user RPCs.
//! - `stream::transport` / `stream::json_lines`: the transport contract and
//!   two implementations of it.

/// Stream transports, protocol types, sessions, and the RPC client.
pub mod stream;

