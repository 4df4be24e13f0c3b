//! Crosstalk - real-time chat delivery core
//!
//! A WebSocket connection hub that fans chat messages out to channel
//! subscribers and tracks per-user presence across multiple devices.
//!
//! ## Architecture
//!
//! ```text
//! Client (WS) → Connection Adapter → Hub control loop → subscriber queues → wire
//!                      │
//!                      └→ MembershipChecker / MessageStore (external collaborators)
//! ```
//!
//! All subscription and presence state is owned by a single control
//! loop ([`Hub`]); connections talk to it only through asynchronous
//! hand-offs. Each connection runs two pumps and owns a bounded
//! outbound queue; a queue that fills up gets its connection evicted
//! instead of stalling delivery to everyone else.

pub mod config;
pub mod connection;
pub mod envelope;
pub mod hub;
pub mod presence;
pub mod server;
pub mod store;

pub use config::{Config, ConfigError};
pub use connection::{CloseSignal, run_connection};
pub use envelope::{ClientEnvelope, EnvelopeError, PresenceStatus, ServerEnvelope};
pub use hub::{ChannelId, ConnId, Hub, UserId};
pub use presence::PresenceTracker;
pub use store::{ChatMessage, MembershipChecker, MemoryStore, MessageStore};
