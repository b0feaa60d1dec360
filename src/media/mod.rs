//! Shared media graph: capture boundary, tees, per-viewer branches

pub mod attachment;
pub mod capture;
pub mod graph;
pub mod queue;
pub mod source;
pub mod tee;

pub use attachment::ViewerAttachment;
pub use capture::CaptureEncoder;
pub use graph::{EncoderControl, GraphEvent, GraphState, MediaSource, TeeInput};
pub use source::{ExternalEncoderSource, SyntheticSource};
