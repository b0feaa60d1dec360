//! Boundary between the shared graph and the capture/encode back-end
//!
//! The capture elements, encoders and RTP payloaders are external
//! collaborators. They appear to the core as a [`MediaSource`] that pushes
//! payloaded RTP into the two tees, plus an [`EncoderControl`] handle for
//! keyframe forcing.

use crate::media::tee::Tee;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::rtp::packet::Packet;

/// RTP payload type for H.264 video
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;

/// RTP payload type for Opus audio
pub const AUDIO_PAYLOAD_TYPE: u8 = 97;

/// Running state of the shared graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    /// Graph constructed but not producing
    Stopped,
    /// Source spinning up
    Starting,
    /// Data flowing through the tees
    Running,
    /// Draining; no new attachments accepted
    Stopping,
}

/// Asynchronous notifications from the graph to its owner
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// Unrecoverable capture/encode failure; the broadcaster must stop
    Fatal(String),
}

/// Write handle pushing payloaded RTP into one tee
///
/// Cheap to clone; the back-end holds one per media.
#[derive(Clone)]
pub struct TeeInput {
    tee: Arc<Tee>,
}

impl TeeInput {
    pub(crate) fn new(tee: Arc<Tee>) -> Self {
        Self { tee }
    }

    /// Push one packet into the tee; never blocks
    pub fn push(&self, packet: Packet) {
        self.tee.push(packet);
    }
}

/// Capture/encode back-end producing the two payloaded RTP streams
///
/// `start` must return only once the back-end is delivering (or has
/// verifiably begun spinning up); errors at that point are fatal to the
/// graph. Runtime failures after a successful start are reported through
/// the graph event channel by the implementation's reader tasks.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Begin producing; video and audio packets go into the given inputs
    async fn start(
        &self,
        video: TeeInput,
        audio: TeeInput,
        events: tokio::sync::mpsc::UnboundedSender<GraphEvent>,
    ) -> Result<()>;

    /// Stop producing and release capture devices
    async fn stop(&self) -> Result<()>;

    /// Control handle of the video encoder
    fn encoder_control(&self) -> Arc<dyn EncoderControl>;
}

/// Keyframe control surface of the video encoder
///
/// Mirrors the two mechanisms hardware/software encoders expose: an
/// explicit key-unit request (may be refused) and the GOP length ceiling.
pub trait EncoderControl: Send + Sync {
    /// Request an immediate IDR frame with parameter sets; `true` if honored
    fn request_key_unit(&self) -> bool;

    /// Current GOP length ceiling in frames
    fn key_int_max(&self) -> u32;

    /// Override the GOP length ceiling
    fn set_key_int_max(&self, frames: u32);
}
