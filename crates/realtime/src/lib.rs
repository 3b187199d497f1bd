//! Self-healing realtime channel.
//!
//! [`RealtimeManager`] keeps one bidirectional channel open, pings it on a
//! fixed heartbeat, reconnects with doubling delay after an unintentional
//! loss and fans inbound [`Envelope`]s out to subscribers by tag. The wire is
//! abstracted behind [`Connector`]; [`WebSocketConnector`] is the default.

pub mod config;
pub mod envelope;
pub mod error;
pub mod manager;
pub mod transport;

mod serde_millis;

pub use config::RealtimeConfig;
pub use envelope::{Envelope, PING_TAG};
pub use error::RealtimeError;
pub use manager::{ConnectionPhase, RealtimeManager, SubscriptionId};
#[cfg(feature = "websocket")]
pub use transport::WebSocketConnector;
pub use transport::{Connection, Connector, FrameSink, FrameStream};
