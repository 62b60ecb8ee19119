//! Shared protocol layer for the snowgate JSON-RPC gateway.
//!
//! This crate contains everything both the gateway core and the CLI need to
//! agree on:
//!
//! - [`protocol`] - JSON-RPC 2.0 types, request validation, and the gateway
//!   error taxonomy
//! - [`http`] - helpers for turning HTTP bodies into validated payloads and
//!   JSON-RPC responses back into HTTP responses

pub mod http;
pub mod protocol;

pub use protocol::*;
