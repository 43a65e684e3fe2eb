//! Core library for the mptun multipath tunnel.
//!
//! mptun splits one stream of UDP datagrams across several TCP and UDP links
//! between a client and a server, and reassembles it on the other side with
//! duplicates removed.
//!
//! # Architecture
//!
//! - `buffer`: pooled, reference-counted packet buffers
//! - `proto`: wire frame codec with a CRC-8 header check
//! - `filter`: duplicate detection over the 16-bit packet id space
//! - `scatter` / `gather`: fan-out to and fan-in from the live links
//! - `transport`: offload-aware UDP I/O and TCP stream framing loops
//! - `link`: dial, retry and teardown of relay links
//! - `session`: server-side UDP sessions with idle eviction
//! - `stats`: throughput counters and the periodic reporter
//! - `control`: configuration shared by every role
//! - `config_file`: per-role TOML files under the platform config directory

pub mod buffer;
pub mod config_file;
pub mod control;
pub mod filter;
pub mod gather;
pub mod link;
pub mod proto;
pub mod scatter;
pub mod session;
pub mod stats;
pub mod transport;

pub use buffer::{BufferHandle, BufferPool, PackedBuffer};
pub use proto::{Packet, ProtocolError};
