//! Single-source, many-viewer WebRTC broadcaster
//!
//! Captures one live audio/video feed, encodes it once, and fans it out to
//! an arbitrary number of browser peers over independent WebRTC peer
//! connections. A WebSocket signaling relay announces viewer arrivals and
//! departures and carries SDP offers/answers and trickled ICE candidates.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  capture → encode once (H.264 / Opus, RTP-payloaded)      │
//! │      ↓                 ↓                                  │
//! │  video tee         audio tee      ← CaptureEncoder        │
//! │   ├─ null sink      ├─ null sink    (always consuming)    │
//! │   ├─ queue → sink   ├─ queue → sink ← ViewerAttachment A  │
//! │   └─ queue → sink   └─ queue → sink ← ViewerAttachment B  │
//! │            ↓                 ↓                            │
//! │        PeerSession per viewer (offer/answer, ICE gate)    │
//! │            ↕                                              │
//! │  SignalingAdapter (JSON over WebSocket)  TurnProvider     │
//! │            ↕ wired by BroadcastManager ──────┘            │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Every viewer gets a fresh pair of tee branches with bounded leaky
//! queues, so a slow peer drops its own oldest buffers instead of stalling
//! the shared encoder. Candidates from signaling are gated behind the
//! remote description per session, and a keyframe is forced when a viewer's
//! answer lands so it can start decoding immediately.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod manager;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod turn;

pub use config::{BroadcastConfig, CameraKind, TurnSetup};
pub use error::{Error, Result};
pub use manager::{BroadcastManager, ViewerRecord};
pub use media::{CaptureEncoder, ExternalEncoderSource, GraphEvent, GraphState, SyntheticSource};
pub use peer::{IceCandidate, PeerSession, SessionFactory, SessionSetup, SessionState};
pub use signaling::{SignalingAdapter, SignalingHandler, SignalingOutbound};
pub use turn::{TurnCredentials, TurnProvider};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
