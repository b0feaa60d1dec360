//! Shared helpers for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use beamcast::media::graph::MediaSource;
use beamcast::{
    BroadcastConfig, BroadcastManager, CaptureEncoder, Result, SessionFactory, SignalingOutbound,
    SyntheticSource,
};
use std::sync::{Arc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// One outbound message captured by the recording double
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Offer {
        to: String,
        sdp: String,
    },
    Candidate {
        to: String,
        candidate: String,
        sdp_mline_index: u16,
    },
}

/// Signaling double recording everything the manager sends
pub struct RecordingSignaling {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn offers_to(&self, viewer: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Sent::Offer { to, sdp } if to == viewer => Some(sdp),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SignalingOutbound for RecordingSignaling {
    async fn send_offer(&self, to: &str, sdp: &str) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::Offer {
            to: to.to_string(),
            sdp: sdp.to_string(),
        });
        Ok(())
    }

    async fn send_ice_candidate(
        &self,
        to: &str,
        candidate: &str,
        sdp_mline_index: u16,
    ) -> Result<()> {
        self.sent.lock().unwrap().push(Sent::Candidate {
            to: to.to_string(),
            candidate: candidate.to_string(),
            sdp_mline_index,
        });
        Ok(())
    }
}

/// A broadcaster wired to a manual synthetic source and a recording relay
pub struct TestBroadcaster {
    pub manager: Arc<BroadcastManager>,
    pub graph: Arc<CaptureEncoder>,
    pub source: Arc<SyntheticSource>,
    pub signaling: Arc<RecordingSignaling>,
}

/// Spin up a full broadcaster against in-process doubles
pub async fn spawn_broadcaster() -> TestBroadcaster {
    let source = SyntheticSource::manual();
    let (graph, graph_events) = CaptureEncoder::new(Arc::clone(&source) as Arc<dyn MediaSource>);
    graph.start().await.unwrap();

    let signaling = RecordingSignaling::new();
    let factory = SessionFactory::new(&BroadcastConfig::default(), None);
    let manager = BroadcastManager::new(
        Arc::clone(&graph),
        graph_events,
        factory,
        Arc::clone(&signaling) as Arc<dyn SignalingOutbound>,
    );

    TestBroadcaster {
        manager,
        graph,
        source,
        signaling,
    }
}

/// Act as a browser viewer: answer the broadcaster's offer
pub async fn answer_offer(offer_sdp: &str) -> String {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let registry = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .unwrap();

    let offer = RTCSessionDescription::offer(offer_sdp.to_string()).unwrap();
    pc.set_remote_description(offer).await.unwrap();
    let answer = pc.create_answer(None).await.unwrap();
    pc.set_local_description(answer).await.unwrap();
    let sdp = pc.local_description().await.unwrap().sdp;
    pc.close().await.unwrap();
    sdp
}

/// A syntactically valid host candidate
pub fn host_candidate(n: u16) -> String {
    format!("candidate:{} 1 udp 2122260223 192.0.2.1 54400 typ host", n)
}
