//! # parley-protocol
//!
//! Wire protocol for the Parley chat relay.
//!
//! Clients and the server exchange named events over a WebSocket:
//!
//! - `register` / `user_status` - Presence announcements
//! - `send_message` / `receive_message` - Chat relay
//! - `typing` - Typing indicators
//! - `connected` / `error` - Connection bookkeeping
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::send_message("bob", "alice", "Hello!");
//!
//! let text = codec::encode_json(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_json(&text).unwrap();
//! assert_eq!(decoded, event);
//! ```

pub mod codec;
pub mod events;
pub mod version;

pub use codec::{decode, encode, Encoding, EventCodec, ProtocolError, WireFrame};
pub use events::{
    ClientEvent, PresenceStatus, SendMessage, ServerEvent, StatusChange, TypingNotice,
};
pub use version::{Version, PROTOCOL_VERSION};
