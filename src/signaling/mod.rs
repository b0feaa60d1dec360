//! Signaling: wire protocol types and the WebSocket adapter

mod client;
pub mod protocol;

pub use client::SignalingAdapter;
pub use protocol::{InboundMessage, OutboundMessage};

use crate::Result;
use async_trait::async_trait;

/// Inbound signaling event surface
///
/// The adapter dispatches events sequentially: a handler call completes
/// before the next frame is processed, which is what serializes per-viewer
/// lifecycle handling.
#[async_trait]
pub trait SignalingHandler: Send + Sync {
    /// A new viewer requests the stream
    async fn on_viewer_joined(&self, viewer_id: String);

    /// SDP answer from a viewer
    async fn on_answer(&self, viewer_id: String, sdp: String);

    /// Trickled remote candidate; empty candidate = end-of-candidates
    async fn on_ice_candidate(&self, viewer_id: String, candidate: String, sdp_mline_index: u16);

    /// A viewer disconnected
    async fn on_viewer_left(&self, viewer_id: String);
}

/// Outbound signaling operations
///
/// Implemented by the WebSocket adapter and by test doubles.
#[async_trait]
pub trait SignalingOutbound: Send + Sync {
    /// Send the SDP offer for one viewer
    async fn send_offer(&self, to: &str, sdp: &str) -> Result<()>;

    /// Send one locally gathered candidate for one viewer
    async fn send_ice_candidate(&self, to: &str, candidate: &str, sdp_mline_index: u16)
        -> Result<()>;
}
