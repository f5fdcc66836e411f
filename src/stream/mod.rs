//! Realtime stream modules.
//!
//! - `proto`: wire frames and the typed server messages built from them.
//! - `state`: connection lifecycle states and the transition table.
//! - `heartbeat`: server-driven keep-alive timer.
//! - `dispatch`: typed observers for metric samples and lifecycle changes.
//! - `transport`: duplex transport seam and its websocket implementation.
//! - `client`: public facade and the connection worker.

/// Client facade, configuration, and connection worker.
pub mod client;
/// Typed event dispatch.
pub mod dispatch;
/// Keep-alive timer.
pub mod heartbeat;
/// Stream protocol frames.
pub mod proto;
/// Connection state machine.
pub mod state;
/// Transport abstraction.
pub mod transport;
