//! Per-viewer branch of the shared graph
//!
//! An attachment owns one video and one audio branch: a tee request pad, a
//! leaky bounded queue and a pump task feeding the viewer's RTP sink. The
//! linking order is load-bearing: the downstream must already be consuming
//! before the tee pad is linked, and teardown must sever callbacks and
//! probes before anything downstream is shut down.

use crate::media::capture::CaptureEncoder;
use crate::media::queue::LeakyQueue;
use crate::media::tee::{ProbeHandle, TeePad};
use crate::peer::PeerSession;
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

/// Video branch buffer: about one second at 30 fps
const VIDEO_QUEUE_CAPACITY: usize = 30;

/// Audio branch buffer: about one second of 20 ms frames
const AUDIO_QUEUE_CAPACITY: usize = 50;

/// Bound on pump-task termination during detach
const PUMP_STOP_TIMEOUT: Duration = Duration::from_millis(500);

/// Bound on the session's async ICE/TURN teardown during detach
const SESSION_TEARDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// One viewer's downstream branch pair
///
/// Always either fully linked or fully detached; `detach` is idempotent.
pub struct ViewerAttachment {
    id: String,
    graph: Weak<CaptureEncoder>,
    video_forwarded: Arc<AtomicU64>,
    audio_forwarded: Arc<AtomicU64>,
    // Teardown lock; `None` once detached
    inner: Mutex<Option<Linked>>,
}

struct Linked {
    session: Arc<PeerSession>,
    video_pad: TeePad,
    audio_pad: TeePad,
    video_queue: Arc<LeakyQueue>,
    audio_queue: Arc<LeakyQueue>,
    video_probe: ProbeHandle,
    audio_probe: ProbeHandle,
    video_pump: JoinHandle<()>,
    audio_pump: JoinHandle<()>,
}

impl ViewerAttachment {
    /// Build and link a new branch pair for one viewer
    ///
    /// Acquires the tee request pads, inserts the leaky queues, starts the
    /// sink pumps, and links the tee pads last so data only starts flowing
    /// into a fully consuming branch. On any failure all allocations are
    /// reversed.
    pub async fn link(
        id: &str,
        graph: &Arc<CaptureEncoder>,
        session: Arc<PeerSession>,
    ) -> Result<Self> {
        info!(viewer_id = id, "linking viewer attachment");

        // 1. Request pads; kept valid until release_attachment.
        let (video_pad, audio_pad) = match graph.request_attachment().await {
            Ok(pads) => pads,
            Err(e) => return Err(e),
        };

        // 2. Queues into the graph's element accounting (two queues plus
        //    the sink element).
        let video_queue = Arc::new(LeakyQueue::new(VIDEO_QUEUE_CAPACITY));
        let audio_queue = Arc::new(LeakyQueue::new(AUDIO_QUEUE_CAPACITY));
        graph.register_elements(3);

        // 3. Sink ports from the session's uninitialized RTP sinks.
        let video_track = session.video_track();
        let audio_track = session.audio_track();

        // 4./5. Pumps first: the downstream must consume before the tee is
        //       linked, or the new branch would join stalled.
        let video_forwarded = Arc::new(AtomicU64::new(0));
        let audio_forwarded = Arc::new(AtomicU64::new(0));
        let video_pump = tokio::spawn(Self::pump(
            id.to_string(),
            "video",
            Arc::clone(&video_queue),
            video_track,
            Arc::clone(&video_forwarded),
        ));
        let audio_pump = tokio::spawn(Self::pump(
            id.to_string(),
            "audio",
            Arc::clone(&audio_queue),
            audio_track,
            Arc::clone(&audio_forwarded),
        ));

        // 6. Probes, then tee -> queue last; data starts flowing here.
        let video_probe = video_pad.add_probe();
        let audio_probe = audio_pad.add_probe();
        video_pad.link(Arc::clone(&video_queue));
        audio_pad.link(Arc::clone(&audio_queue));

        debug!(viewer_id = id, "attachment linked");
        Ok(Self {
            id: id.to_string(),
            graph: Arc::downgrade(graph),
            video_forwarded,
            audio_forwarded,
            inner: Mutex::new(Some(Linked {
                session,
                video_pad,
                audio_pad,
                video_queue,
                audio_queue,
                video_probe,
                audio_probe,
                video_pump,
                audio_pump,
            })),
        })
    }

    async fn pump(
        viewer: String,
        media: &'static str,
        queue: Arc<LeakyQueue>,
        track: Arc<TrackLocalStaticRTP>,
        forwarded: Arc<AtomicU64>,
    ) {
        while let Some(packet) = queue.pop().await {
            if let Err(e) = track.write_rtp(&packet).await {
                trace!(viewer = %viewer, media, "sink write failed: {}", e);
                continue;
            }
            let sent = forwarded.fetch_add(1, Ordering::Relaxed) + 1;
            if sent % 100 == 0 {
                trace!(viewer = %viewer, media, buffers = sent, "buffers reaching sink");
            }
        }
        debug!(viewer = %viewer, media, "branch pump ended");
    }

    /// Viewer this attachment belongs to
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the branches are currently linked
    pub async fn is_linked(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Video packets handed to the sink so far
    pub fn forwarded_video(&self) -> u64 {
        self.video_forwarded.load(Ordering::Relaxed)
    }

    /// Audio packets handed to the sink so far
    pub fn forwarded_audio(&self) -> u64 {
        self.audio_forwarded.load(Ordering::Relaxed)
    }

    /// Tear the branch pair down; idempotent
    ///
    /// A concurrent second call returns immediately once the teardown lock
    /// is released. The shared graph is never locked across the bounded
    /// waits below.
    pub async fn detach(&self) {
        let mut guard = self.inner.lock().await;
        let Some(linked) = guard.take() else {
            debug!(viewer_id = %self.id, "already detached");
            return;
        };
        info!(viewer_id = %self.id, "detaching viewer attachment");

        // (a) No callbacks may fire against torn-down state.
        linked.session.detach_handlers();

        // (b) Probes off before the branch stops moving.
        linked.video_pad.remove_probe(&linked.video_probe);
        linked.audio_pad.remove_probe(&linked.audio_probe);

        // (c) Unlink tee -> queue, then close queue -> sink.
        linked.video_pad.unlink();
        linked.audio_pad.unlink();
        linked.video_queue.close();
        linked.audio_queue.close();

        // (d) Release the request pads while downstream is still alive;
        //     releasing a linked pad is undefined, hence the unlink above.
        match self.graph.upgrade() {
            Some(graph) => {
                graph.release_attachment(linked.video_pad, linked.audio_pad);
                graph.unregister_elements(3);
            }
            None => warn!(viewer_id = %self.id, "graph gone before attachment release"),
        }

        // (e) Release the sink ports.
        linked.session.release_senders().await;

        // (f) Bounded wait for the pumps to drain out.
        for (media, pump) in [
            ("video", linked.video_pump),
            ("audio", linked.audio_pump),
        ] {
            match tokio::time::timeout(PUMP_STOP_TIMEOUT, pump).await {
                Ok(_) => {}
                Err(_) => warn!(viewer_id = %self.id, media, "branch pump did not stop in time"),
            }
        }

        // (g) Bounded asynchronous ICE/TURN teardown.
        if tokio::time::timeout(SESSION_TEARDOWN_TIMEOUT, linked.session.close())
            .await
            .is_err()
        {
            warn!(viewer_id = %self.id, "session close exceeded teardown bound");
        }

        // (h) Queues and sink references drop with `linked`.
        debug!(viewer_id = %self.id, "attachment detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::capture::CaptureEncoder;
    use crate::media::graph::MediaSource;
    use crate::media::source::SyntheticSource;
    use crate::peer::{PeerSession, SessionSetup};

    async fn graph_with_manual_source() -> (
        Arc<CaptureEncoder>,
        Arc<SyntheticSource>,
    ) {
        let source = SyntheticSource::manual();
        let (graph, _events) = CaptureEncoder::new(
            Arc::clone(&source) as Arc<dyn MediaSource>,
        );
        graph.start().await.unwrap();
        (graph, source)
    }

    async fn test_session(viewer: &str) -> Arc<PeerSession> {
        PeerSession::new(
            viewer,
            &SessionSetup {
                stun_server: "stun:stun.l.google.com:19302".to_string(),
                turn_uri: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_link_then_detach_releases_everything() {
        let (graph, _source) = graph_with_manual_source().await;
        let session = test_session("viewer-a").await;

        let attachment = ViewerAttachment::link("viewer-a", &graph, session)
            .await
            .unwrap();
        assert!(attachment.is_linked().await);
        assert_eq!(graph.attachment_pad_count().await, 2);
        assert_eq!(graph.live_elements(), 3);

        attachment.detach().await;
        assert!(!attachment.is_linked().await);
        assert_eq!(graph.attachment_pad_count().await, 0);
        assert_eq!(graph.live_elements(), 0);

        graph.stop().await;
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let (graph, _source) = graph_with_manual_source().await;
        let session = test_session("viewer-a").await;
        let attachment = ViewerAttachment::link("viewer-a", &graph, session)
            .await
            .unwrap();

        attachment.detach().await;
        let pads_after_first = graph.attachment_pad_count().await;
        let elements_after_first = graph.live_elements();

        attachment.detach().await;
        attachment.detach().await;
        assert_eq!(graph.attachment_pad_count().await, pads_after_first);
        assert_eq!(graph.live_elements(), elements_after_first);

        graph.stop().await;
    }

    #[tokio::test]
    async fn test_packets_flow_through_linked_branch() {
        let (graph, source) = graph_with_manual_source().await;
        let session = test_session("viewer-a").await;
        let attachment = ViewerAttachment::link("viewer-a", &graph, session)
            .await
            .unwrap();

        source.pump_video(10).await;
        source.pump_audio(5).await;

        // The pumps consume asynchronously; poll briefly.
        for _ in 0..100 {
            if attachment.forwarded_video() >= 10 && attachment.forwarded_audio() >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(attachment.forwarded_video() >= 10);
        assert!(attachment.forwarded_audio() >= 5);

        attachment.detach().await;
        graph.stop().await;
    }

    #[tokio::test]
    async fn test_detached_branch_receives_nothing() {
        let (graph, source) = graph_with_manual_source().await;
        let session = test_session("viewer-a").await;
        let attachment = ViewerAttachment::link("viewer-a", &graph, session)
            .await
            .unwrap();

        attachment.detach().await;
        let before = attachment.forwarded_video();
        source.pump_video(10).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(attachment.forwarded_video(), before);

        graph.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_detach_single_teardown() {
        let (graph, _source) = graph_with_manual_source().await;
        let session = test_session("viewer-a").await;
        let attachment = Arc::new(
            ViewerAttachment::link("viewer-a", &graph, session)
                .await
                .unwrap(),
        );

        let a = Arc::clone(&attachment);
        let b = Arc::clone(&attachment);
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.detach().await }),
            tokio::spawn(async move { b.detach().await }),
        );
        ra.unwrap();
        rb.unwrap();

        assert_eq!(graph.attachment_pad_count().await, 0);
        assert_eq!(graph.live_elements(), 0);
        graph.stop().await;
    }
}
