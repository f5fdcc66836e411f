//! Realtime vitals telemetry stream client.
//!
//! The crate is organized by concern:
//! - `stream`: connection lifecycle, handshake, heartbeat, and typed event
//!   dispatch for a push-based vitals stream.
//! - `reconnect`: opt-in reconnection policy layered on lifecycle changes,
//!   plus a shared timeout helper.

/// Reconnection policy and timeout helpers.
pub mod reconnect;
/// Realtime stream client, protocol types, and lifecycle state.
pub mod stream;

pub use stream::client::{StreamClient, StreamClientError, StreamConfig};
pub use stream::dispatch::{LifecycleChange, MetricKind, MetricSample};
pub use stream::state::{ConnectionState, ErrorReason, SessionId};
