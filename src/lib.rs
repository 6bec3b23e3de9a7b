//! replink - async nREPL client with a resumable bencode codec.
//!
//! This library provides two components:
//!
//! - `bencode` - the wire value model and codec: canonical encoding,
//!   plus a single-pass decoder that reports consumed bytes so callers
//!   can decode from an accumulating stream buffer
//! - `nrepl` - the protocol client: one persistent TCP connection,
//!   session establishment, concurrent request/response correlation,
//!   multi-message response aggregation, timeouts, and lazy reconnect
//!
//! # Usage
//!
//! ```ignore
//! use replink::NreplClient;
//!
//! let client = NreplClient::new(7888);
//! client.connect().await?;
//! println!("{}", client.eval("(map inc [1 2 3])").await?);
//! ```

pub mod bencode;
pub mod nrepl;

pub use bencode::{decode, encode, BencodeError, Value};
pub use nrepl::{NreplClient, NreplError, Status};
