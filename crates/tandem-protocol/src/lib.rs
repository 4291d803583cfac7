//! # tandem-protocol
//!
//! Wire protocol for the Tandem live channel.
//!
//! ## Events
//!
//! - client → server: `join-conversation`, `typing`, `stop-typing`, `send-message`
//! - server → client: `new-message`, `typing`, `stop-typing`, `ack`, `error`, `connected`
//! - both directions: `ping` / `pong`
//!
//! ## Example
//!
//! ```rust
//! use tandem_protocol::{Frame, codec};
//!
//! let frame = Frame::send_message(Some(1), "conv-42", "hello");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{codes, Frame, FrameType, MessagePayload, ReadMark};

/// Current protocol version, reported in the `connected` frame.
pub const PROTOCOL_VERSION: u8 = 1;
