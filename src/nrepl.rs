//! nREPL protocol client.
//!
//! This module owns the connection lifecycle, session management, and
//! request/response correlation for talking to an nREPL server.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐          TCP           ┌───────────────┐
//! │  NreplClient │ ◄────────────────────► │  nREPL server │
//! │  (this crate)│   bencode dictionaries │               │
//! └──────────────┘                        └───────────────┘
//! ```
//!
//! Every request carries a caller-generated correlation id; the server
//! may answer with several responses, terminated by one whose `status`
//! list contains `"done"`. The client multiplexes concurrent `eval`
//! calls over the single socket by routing each inbound response to the
//! pending request with the matching id.
//!
//! # Usage
//!
//! ```ignore
//! use replink::NreplClient;
//!
//! let client = NreplClient::new(7888);
//! client.connect().await?;
//! let result = client.eval("(+ 1 2)").await?;
//! assert_eq!(result, "3");
//! ```

mod client;
mod message;

pub use client::{NreplClient, NreplError, Status};
pub use message::{clone_request, collect_error, collect_output, eval_request, Response};
