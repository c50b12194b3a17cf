//! Wire-level types shared across the weft overlay connection stack.
//!
//! This crate provides:
//! - Peer identity and protocol version types ([`types`])
//! - The 38-byte meta preamble codec ([`preamble`])
//!
//! Everything here is pure data and codec logic; no I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod preamble;
pub mod types;

pub use preamble::{MetaPreamble, PreambleError, META_HEADER, PREAMBLE_LEN};
pub use types::{fmt_key, PeerKey, ProtoVersion, PEER_KEY_LEN, PROTO_VERSION};
