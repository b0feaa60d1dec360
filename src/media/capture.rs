//! Shared capture-and-encode graph
//!
//! One graph per process: the capture back-end pushes H.264 and Opus RTP
//! into two tees, and every viewer branches off a pair of tee request pads.
//! Each tee carries a permanent null-sink branch so the upstream chain keeps
//! flowing even with zero viewers; without an always-on consumer, dynamic
//! branches added later would join a stalled stream.

use crate::media::graph::{EncoderControl, GraphEvent, GraphState, MediaSource, TeeInput};
use crate::media::queue::LeakyQueue;
use crate::media::tee::{Tee, TeePad};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long the GOP ceiling stays lowered when forcing a keyframe by property
const KEYFRAME_GOP_RESTORE_DELAY: Duration = Duration::from_millis(100);

/// Bound on null-sink task teardown during stop
const NULL_SINK_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Owner of the shared media graph
pub struct CaptureEncoder {
    state: RwLock<GraphState>,
    video_tee: Arc<Tee>,
    audio_tee: Arc<Tee>,
    source: Arc<dyn MediaSource>,
    encoder: Arc<dyn EncoderControl>,
    events_tx: mpsc::UnboundedSender<GraphEvent>,
    null_sinks: Mutex<Vec<NullSink>>,
    live_elements: AtomicUsize,
    gop_override_pending: Arc<AtomicBool>,
}

/// Permanent always-consuming branch keeping a tee in the flowing state
struct NullSink {
    tee: Arc<Tee>,
    pad: Option<TeePad>,
    queue: Arc<LeakyQueue>,
    task: JoinHandle<()>,
}

impl CaptureEncoder {
    /// Construct the graph around a capture back-end
    ///
    /// Returns the graph and the receiver for fatal graph events.
    pub fn new(
        source: Arc<dyn MediaSource>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<GraphEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let encoder = source.encoder_control();
        let graph = Arc::new(Self {
            state: RwLock::new(GraphState::Stopped),
            video_tee: Tee::new("video_tee"),
            audio_tee: Tee::new("audio_tee"),
            source,
            encoder,
            events_tx,
            null_sinks: Mutex::new(Vec::new()),
            live_elements: AtomicUsize::new(0),
            gop_override_pending: Arc::new(AtomicBool::new(false)),
        });
        (graph, events_rx)
    }

    /// Current graph state
    pub async fn state(&self) -> GraphState {
        *self.state.read().await
    }

    /// Start capturing and encoding
    ///
    /// Transitions `Stopped -> Starting -> Running`. Fails if the back-end
    /// cannot begin producing; such a failure is fatal to the broadcaster.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                GraphState::Running => {
                    debug!("graph already running");
                    return Ok(());
                }
                GraphState::Stopped => *state = GraphState::Starting,
                other => {
                    return Err(Error::Graph(format!(
                        "cannot start graph from state {:?}",
                        other
                    )))
                }
            }
        }

        // Null sinks first: the tees must be consuming before the source
        // begins pushing.
        {
            let mut sinks = self.null_sinks.lock().await;
            sinks.push(NullSink::attach(&self.video_tee));
            sinks.push(NullSink::attach(&self.audio_tee));
        }

        let started = self
            .source
            .start(
                TeeInput::new(Arc::clone(&self.video_tee)),
                TeeInput::new(Arc::clone(&self.audio_tee)),
                self.events_tx.clone(),
            )
            .await;

        match started {
            Ok(()) => {
                *self.state.write().await = GraphState::Running;
                info!("shared graph running");
                Ok(())
            }
            Err(e) => {
                self.teardown_null_sinks().await;
                *self.state.write().await = GraphState::Stopped;
                Err(Error::Graph(format!("capture source failed to start: {}", e)))
            }
        }
    }

    /// Stop the graph and release capture resources
    ///
    /// Viewers still holding request pads are the owner's responsibility to
    /// detach before calling this; any leftover pads are logged.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if *state == GraphState::Stopped {
                return;
            }
            *state = GraphState::Stopping;
        }
        info!("stopping shared graph");

        if let Err(e) = self.source.stop().await {
            warn!("capture source stop error: {}", e);
        }

        self.teardown_null_sinks().await;

        let leftover = self.video_tee.pad_count() + self.audio_tee.pad_count();
        if leftover > 0 {
            warn!(pads = leftover, "tee request pads still allocated at stop");
        }

        *self.state.write().await = GraphState::Stopped;
        info!("shared graph stopped");
    }

    /// Allocate a pair of tee request pads for a new viewer branch
    ///
    /// Fails unless the graph is `Running`; once `Stopping`, no new
    /// attachments are handed out. Each returned pad stays valid until
    /// [`release_attachment`](Self::release_attachment).
    pub async fn request_attachment(&self) -> Result<(TeePad, TeePad)> {
        let state = *self.state.read().await;
        if state != GraphState::Running {
            return Err(Error::Graph(format!(
                "graph not running (state {:?}), refusing attachment",
                state
            )));
        }
        let video = self.video_tee.request_pad();
        let audio = self.audio_tee.request_pad();
        debug!(video_pad = video.id(), audio_pad = audio.id(), "attachment pads allocated");
        Ok((video, audio))
    }

    /// Release both tee request pads of a viewer branch
    ///
    /// Must be called exactly once per `request_attachment`.
    pub fn release_attachment(&self, video: TeePad, audio: TeePad) {
        self.video_tee.release_pad(video);
        self.audio_tee.release_pad(audio);
    }

    /// Request an immediate IDR frame plus parameter-set repetition
    ///
    /// Strategy one asks the encoder for a key unit directly; if the encoder
    /// refuses, the GOP ceiling is dropped to 1 and restored after 100 ms.
    /// Safe to call concurrently with viewer add/remove; no graph locks are
    /// taken.
    pub fn force_keyframe(&self) {
        if self.encoder.request_key_unit() {
            debug!("keyframe request accepted by encoder");
            return;
        }

        if self.gop_override_pending.swap(true, Ordering::SeqCst) {
            // A restore is already scheduled; the lowered GOP will cover
            // this request too.
            return;
        }

        let previous = self.encoder.key_int_max();
        self.encoder.set_key_int_max(1);
        debug!(previous, "keyframe forced via GOP ceiling");

        let encoder = Arc::clone(&self.encoder);
        let pending = Arc::clone(&self.gop_override_pending);
        tokio::spawn(async move {
            tokio::time::sleep(KEYFRAME_GOP_RESTORE_DELAY).await;
            encoder.set_key_int_max(previous);
            pending.store(false, Ordering::SeqCst);
            debug!(restored = previous, "GOP ceiling restored");
        });
    }

    /// Tee feeding viewer video branches
    pub fn video_tee(&self) -> &Arc<Tee> {
        &self.video_tee
    }

    /// Tee feeding viewer audio branches
    pub fn audio_tee(&self) -> &Arc<Tee> {
        &self.audio_tee
    }

    /// Number of request pads currently allocated across both tees,
    /// excluding the permanent null-sink branches
    pub async fn attachment_pad_count(&self) -> usize {
        let total = self.video_tee.pad_count() + self.audio_tee.pad_count();
        let null_pads = self.null_sinks.lock().await.len();
        total.saturating_sub(null_pads)
    }

    /// Dynamic elements (queues, sinks) currently registered by attachments
    pub fn live_elements(&self) -> usize {
        self.live_elements.load(Ordering::Relaxed)
    }

    pub(crate) fn register_elements(&self, n: usize) {
        self.live_elements.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn unregister_elements(&self, n: usize) {
        self.live_elements.fetch_sub(n, Ordering::Relaxed);
    }

    async fn teardown_null_sinks(&self) {
        let mut sinks = self.null_sinks.lock().await;
        for sink in sinks.drain(..) {
            sink.stop().await;
        }
    }
}

impl NullSink {
    /// Attach an always-consuming branch to a tee
    fn attach(tee: &Arc<Tee>) -> Self {
        let pad = tee.request_pad();
        let queue = Arc::new(LeakyQueue::new(8));
        pad.link(Arc::clone(&queue));

        let drain = Arc::clone(&queue);
        let task = tokio::spawn(async move {
            // fakesink: consume and discard so the tee is never the blocker
            while drain.pop().await.is_some() {}
        });

        Self {
            tee: Arc::clone(tee),
            pad: Some(pad),
            queue,
            task,
        }
    }

    async fn stop(mut self) {
        if let Some(pad) = self.pad.take() {
            pad.unlink();
            self.tee.release_pad(pad);
        }
        self.queue.close();
        if tokio::time::timeout(NULL_SINK_STOP_TIMEOUT, &mut self.task)
            .await
            .is_err()
        {
            warn!("null sink drain task did not stop in time, aborting");
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::source::SyntheticSource;

    fn graph_from(source: Arc<SyntheticSource>) -> Arc<CaptureEncoder> {
        let (graph, _events) = CaptureEncoder::new(source as Arc<dyn MediaSource>);
        graph
    }

    #[tokio::test]
    async fn test_start_stop_state_machine() {
        let graph = graph_from(SyntheticSource::manual());
        assert_eq!(graph.state().await, GraphState::Stopped);

        graph.start().await.unwrap();
        assert_eq!(graph.state().await, GraphState::Running);

        // A second start is a no-op
        graph.start().await.unwrap();
        assert_eq!(graph.state().await, GraphState::Running);

        graph.stop().await;
        assert_eq!(graph.state().await, GraphState::Stopped);
    }

    #[tokio::test]
    async fn test_attachment_refused_unless_running() {
        let graph = graph_from(SyntheticSource::manual());
        assert!(graph.request_attachment().await.is_err());

        graph.start().await.unwrap();
        let (v, a) = graph.request_attachment().await.unwrap();
        graph.release_attachment(v, a);

        graph.stop().await;
        assert!(graph.request_attachment().await.is_err());
    }

    #[tokio::test]
    async fn test_null_sink_consumes_with_zero_viewers() {
        let source = SyntheticSource::manual();
        let graph = graph_from(Arc::clone(&source));
        graph.start().await.unwrap();

        // No viewer pads allocated; pushes must still be consumed.
        source.pump_video(200).await;
        assert_eq!(graph.video_tee().buffers_in(), 200);
        assert_eq!(graph.attachment_pad_count().await, 0);

        graph.stop().await;
    }

    #[tokio::test]
    async fn test_force_keyframe_accepted_by_encoder() {
        let source = SyntheticSource::manual();
        let graph = graph_from(Arc::clone(&source));
        graph.start().await.unwrap();

        let control = source.control();
        graph.force_keyframe();
        assert_eq!(control.key_unit_requests(), 1);
        // Accepted directly: the GOP ceiling stays untouched
        assert_eq!(control.key_int_max(), 30);

        graph.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_keyframe_gop_fallback_and_restore() {
        let source = SyntheticSource::with_stubborn_encoder();
        let graph = graph_from(Arc::clone(&source));
        graph.start().await.unwrap();

        let control = source.control();
        graph.force_keyframe();
        assert_eq!(control.key_int_max(), 1);

        // Restore fires after the 100 ms override window
        tokio::time::sleep(KEYFRAME_GOP_RESTORE_DELAY + Duration::from_millis(10)).await;
        assert_eq!(control.key_int_max(), 30);

        graph.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_keyframe_overrides_do_not_nest() {
        let source = SyntheticSource::with_stubborn_encoder();
        let graph = graph_from(Arc::clone(&source));
        graph.start().await.unwrap();

        let control = source.control();
        graph.force_keyframe();
        graph.force_keyframe();
        assert_eq!(control.key_int_max(), 1);

        tokio::time::sleep(KEYFRAME_GOP_RESTORE_DELAY + Duration::from_millis(10)).await;
        // Restored to the pre-override ceiling, not to the lowered value
        assert_eq!(control.key_int_max(), 30);

        graph.stop().await;
    }

    #[tokio::test]
    async fn test_stop_with_leftover_pads_still_stops() {
        let graph = graph_from(SyntheticSource::manual());
        graph.start().await.unwrap();

        let (v, a) = graph.request_attachment().await.unwrap();
        graph.stop().await;
        assert_eq!(graph.state().await, GraphState::Stopped);

        // Cleanup after the fact keeps the accounting sane
        graph.release_attachment(v, a);
    }
}
