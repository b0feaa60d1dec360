//! Top-level orchestrator
//!
//! Owns the shared graph and the viewer registry, wires signaling events to
//! per-viewer operations, and enforces the keyframe-on-join policy. The
//! registry mutex is held only for map operations, never across media or
//! peer-connection calls; per-viewer ordering comes from the adapter's
//! sequential event dispatch.

use crate::media::{CaptureEncoder, GraphEvent, ViewerAttachment};
use crate::peer::{IceCandidate, PeerSession, SessionFactory, SessionState};
use crate::signaling::{SignalingHandler, SignalingOutbound};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Per-viewer bound on teardown during shutdown
const SHUTDOWN_DETACH_TIMEOUT: Duration = Duration::from_secs(2);

/// One connected viewer
pub struct ViewerRecord {
    pub id: String,
    pub attachment: ViewerAttachment,
    pub session: Arc<PeerSession>,
    pub joined_at: Instant,
}

enum ManagerEvent {
    /// A session failed; the viewer must be detached and removed
    ViewerFatal(String),
    /// The shared graph died; the broadcaster must stop
    GraphFatal(String),
}

/// Broadcast orchestrator
pub struct BroadcastManager {
    graph: Arc<CaptureEncoder>,
    sessions: SessionFactory,
    signaling: Arc<dyn SignalingOutbound>,
    viewers: Mutex<HashMap<String, Arc<ViewerRecord>>>,
    shutting_down: AtomicBool,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ManagerEvent>>>,
}

impl BroadcastManager {
    /// Build the manager around a running (or about-to-run) graph
    ///
    /// Graph fatals are forwarded into the manager's event loop.
    pub fn new(
        graph: Arc<CaptureEncoder>,
        mut graph_events: mpsc::UnboundedReceiver<GraphEvent>,
        sessions: SessionFactory,
        signaling: Arc<dyn SignalingOutbound>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let forward_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = graph_events.recv().await {
                match event {
                    GraphEvent::Fatal(message) => {
                        let _ = forward_tx.send(ManagerEvent::GraphFatal(message));
                    }
                }
            }
        });

        Arc::new(Self {
            graph,
            sessions,
            signaling,
            viewers: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Number of registered viewers
    pub async fn viewer_count(&self) -> usize {
        self.viewers.lock().await.len()
    }

    /// Whether a viewer is registered
    pub async fn has_viewer(&self, viewer_id: &str) -> bool {
        self.viewers.lock().await.contains_key(viewer_id)
    }

    /// Look up a viewer record
    pub async fn viewer(&self, viewer_id: &str) -> Option<Arc<ViewerRecord>> {
        self.viewers.lock().await.get(viewer_id).cloned()
    }

    /// Process manager events until the graph dies or the channel closes
    ///
    /// Returns an error when the shared graph reported a fatal failure; the
    /// binary maps that to a non-zero exit.
    pub async fn run_events(&self) -> Result<()> {
        let mut rx = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::InvalidConfig("run_events called twice".to_string()))?;

        while let Some(event) = rx.recv().await {
            match event {
                ManagerEvent::ViewerFatal(viewer_id) => {
                    warn!(%viewer_id, "session failed, detaching viewer");
                    self.remove_viewer(&viewer_id).await;
                }
                ManagerEvent::GraphFatal(message) => {
                    warn!("graph fatal: {}", message);
                    self.shutdown().await;
                    return Err(Error::Graph(message));
                }
            }
        }
        Ok(())
    }

    /// Detach every viewer and stop the graph
    ///
    /// New viewers are refused from the first line on; detaches run in
    /// parallel, each under a bounded timeout.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down broadcaster");

        let records: Vec<Arc<ViewerRecord>> = {
            let mut viewers = self.viewers.lock().await;
            viewers.drain().map(|(_, record)| record).collect()
        };

        let teardowns = records.iter().map(|record| {
            let record = Arc::clone(record);
            async move {
                if tokio::time::timeout(SHUTDOWN_DETACH_TIMEOUT, record.attachment.detach())
                    .await
                    .is_err()
                {
                    warn!(viewer_id = %record.id, "viewer detach exceeded shutdown bound");
                }
            }
        });
        futures::future::join_all(teardowns).await;

        self.graph.stop().await;
        info!("broadcaster stopped");
    }

    /// Remove one viewer: atomic registry removal, then detach
    async fn remove_viewer(&self, viewer_id: &str) {
        let record = {
            let mut viewers = self.viewers.lock().await;
            viewers.remove(viewer_id)
        };
        match record {
            Some(record) => {
                record.attachment.detach().await;
                let remaining = self.viewer_count().await;
                info!(viewer_id, remaining, "viewer removed");
            }
            None => debug!(%viewer_id, "remove for unknown viewer ignored"),
        }
    }
}

#[async_trait]
impl SignalingHandler for BroadcastManager {
    /// Attach a branch, create the session, send the offer, register
    ///
    /// Any step failing reverses all allocations for this viewer; other
    /// viewers are unaffected.
    async fn on_viewer_joined(&self, viewer_id: String) {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(%viewer_id, "shutting down, refusing new viewer");
            return;
        }
        if self.has_viewer(&viewer_id).await {
            warn!(%viewer_id, "viewer already registered, ignoring join");
            return;
        }
        info!(%viewer_id, "viewer joined");

        let session = match self.sessions.create(&viewer_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(%viewer_id, "failed to create session: {}", e);
                return;
            }
        };

        let attachment = match ViewerAttachment::link(&viewer_id, &self.graph, Arc::clone(&session))
            .await
        {
            Ok(attachment) => attachment,
            Err(e) => {
                warn!(%viewer_id, "failed to link attachment: {}", e);
                session.close().await;
                return;
            }
        };

        // Trickle gathered candidates out; the empty candidate only marks
        // gathering complete and is not relayed.
        {
            let signaling = Arc::clone(&self.signaling);
            let viewer = viewer_id.clone();
            session.on_ice_candidate(move |candidate: IceCandidate| {
                if candidate.is_end_of_candidates() {
                    debug!(viewer_id = %viewer, "local ICE gathering complete");
                    return;
                }
                let signaling = Arc::clone(&signaling);
                let viewer = viewer.clone();
                tokio::spawn(async move {
                    if let Err(e) = signaling
                        .send_ice_candidate(&viewer, &candidate.candidate, candidate.sdp_mline_index)
                        .await
                    {
                        warn!(viewer_id = %viewer, "failed to relay candidate: {}", e);
                    }
                });
            });
        }

        // A failed session surfaces as a viewer-fatal event.
        {
            let events = self.events_tx.clone();
            let viewer = viewer_id.clone();
            session.on_connection_state_change(move |state: SessionState| {
                if state == SessionState::Failed {
                    let _ = events.send(ManagerEvent::ViewerFatal(viewer.clone()));
                }
            });
        }

        let sdp = match session.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(%viewer_id, "failed to create offer: {}", e);
                attachment.detach().await;
                return;
            }
        };
        if let Err(e) = self.signaling.send_offer(&viewer_id, &sdp).await {
            warn!(%viewer_id, "failed to send offer: {}", e);
            attachment.detach().await;
            return;
        }

        let record = Arc::new(ViewerRecord {
            id: viewer_id.clone(),
            attachment,
            session,
            joined_at: Instant::now(),
        });
        let active = {
            let mut viewers = self.viewers.lock().await;
            viewers.insert(viewer_id.clone(), record);
            viewers.len()
        };
        info!(%viewer_id, active, "offer sent, viewer registered");
    }

    /// Apply the answer, then force a keyframe so the viewer can decode
    /// immediately instead of waiting for the next natural IDR
    async fn on_answer(&self, viewer_id: String, sdp: String) {
        let Some(record) = self.viewer(&viewer_id).await else {
            // Races on disconnect are expected; a late answer is dropped.
            debug!(%viewer_id, "answer for unknown viewer dropped");
            return;
        };

        if let Err(e) = record.session.set_remote_answer(sdp).await {
            warn!(%viewer_id, "failed to apply answer: {}", e);
            self.remove_viewer(&viewer_id).await;
            return;
        }

        debug!(%viewer_id, "answer applied, forcing keyframe");
        self.graph.force_keyframe();
    }

    async fn on_ice_candidate(&self, viewer_id: String, candidate: String, sdp_mline_index: u16) {
        let Some(record) = self.viewer(&viewer_id).await else {
            debug!(%viewer_id, "candidate for unknown viewer dropped");
            return;
        };

        if let Err(e) = record
            .session
            .add_ice_candidate(IceCandidate {
                sdp_mline_index,
                candidate,
            })
            .await
        {
            warn!(%viewer_id, "failed to add candidate: {}", e);
        }
    }

    async fn on_viewer_left(&self, viewer_id: String) {
        info!(%viewer_id, "viewer left");
        self.remove_viewer(&viewer_id).await;
    }
}
