//! # parley-core
//!
//! Presence tracking and message relay for the Parley chat backend.
//!
//! - **PresenceRegistry** - Username to live connection, one per user
//! - **Hub** - Every open connection, targeted send and broadcast
//! - **Relay** - Inbound event handlers (register, send, typing, disconnect)
//! - **store** - Identity store and conversation log traits
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────────┐
//! │  Connection │────▶│    Relay    │────▶│ IdentityStore / │
//! │  (Session)  │     └─────────────┘     │ ConversationLog │
//! └─────────────┘        │       │        └─────────────────┘
//!        ▲               ▼       ▼
//!        │        ┌──────────┐ ┌─────┐
//!        └────────│ Registry │ │ Hub │
//!                 └──────────┘ └─────┘
//! ```

pub mod connection;
pub mod hub;
pub mod registry;
pub mod relay;
pub mod store;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionState, Outbox, Session};
pub use hub::Hub;
pub use registry::{validate_username, PresenceRegistry};
pub use relay::{Delivery, Outcome, Relay, RelayConfig, RelayError, RelayStats};
pub use store::{ConversationLog, Identity, IdentityStore, Message, NewMessage, StoreError};
