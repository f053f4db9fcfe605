//! RouterOS API transport.
//!
//! Plain-text API on TCP 8728: length-prefixed words grouped into
//! sentences, replies tagged `!re`, `!done`, `!trap`, `!fatal` or `!empty`.

mod client;
pub mod codec;

pub use client::{
    DEFAULT_IO_TIMEOUT, DEFAULT_PORT, RouterOsConnector, RouterOsSession, resolve_address,
};
