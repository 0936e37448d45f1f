//! Wire format for the SIP server management interface (MI).
//!
//! Commands are JSON-RPC 2.0 requests; every transport (FIFO, datagram,
//! HTTP) carries the same envelope:
//!
//! ```text
//! {"jsonrpc": "2.0", "id": "<0-32767>", "method": "<name>", "params": <list-or-map>}
//! ```
//!
//! Replies carry either `result` or an `error` object. Events pushed by the
//! server are bare JSON documents written back to back on a socket with no
//! framing bytes; [`FrameBuffer`] splits them apart again.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use sipmi_protocol::{decode_reply, encode_command};
//!
//! let command = encode_command("uptime", None).unwrap();
//! assert!(command.contains("\"method\":\"uptime\""));
//!
//! let result = decode_reply(r#"{"result": {"Up time": 42}}"#).unwrap();
//! assert_eq!(result, json!({"Up time": 42}));
//! ```

mod codec;
mod error;
mod framing;

pub use codec::{Request, decode_reply, encode_command, normalize_params};
pub use error::{CodecError, CodecResult, FramingError, RpcError};
pub use framing::FrameBuffer;

/// JSON-RPC protocol version sent in every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Upper bound (inclusive) of the random request id.
pub const MAX_REQUEST_ID: u16 = 32767;

/// Reserved JSON-RPC code for replies that carry neither `result` nor `error`.
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// Code used when the server sends an `error` object without a `code`.
pub const DEFAULT_ERROR_CODE: i64 = 500;

/// Consecutive non-completing pushes tolerated by [`FrameBuffer`].
pub const DEFAULT_MAX_RETRIES: u32 = 10;
