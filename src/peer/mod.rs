//! Per-viewer WebRTC peer sessions

mod session;

pub use session::{
    IceCandidate, PeerSession, PendingCandidate, SessionSetup, SessionState,
};

use crate::config::{BroadcastConfig, TurnSetup};
use crate::turn::TurnProvider;
use crate::Result;
use std::sync::Arc;
use tracing::warn;

/// How a new session obtains its TURN relay URL
enum TurnMode {
    /// STUN-only ICE
    Disabled,
    /// Fixed, credential-embedded TURN URI
    Static(String),
    /// Per-session fetch from the credential cache, so the embedded
    /// credentials always reflect the current lease
    Cloudflare(Arc<TurnProvider>),
}

/// Factory stamping out per-viewer sessions with a uniform ICE setup
///
/// Built once at startup from explicit configuration; there is no global
/// mutable TURN state.
pub struct SessionFactory {
    stun_server: String,
    turn: TurnMode,
}

impl SessionFactory {
    /// Build the factory from the broadcast configuration
    ///
    /// `provider` must be supplied when the configuration selects
    /// Cloudflare TURN.
    pub fn new(config: &BroadcastConfig, provider: Option<Arc<TurnProvider>>) -> Self {
        let turn = match (&config.turn, provider) {
            (TurnSetup::Cloudflare(_), Some(provider)) => TurnMode::Cloudflare(provider),
            (TurnSetup::Cloudflare(_), None) => {
                warn!("Cloudflare TURN configured but no provider supplied; STUN-only");
                TurnMode::Disabled
            }
            (TurnSetup::Static(st), _) => TurnMode::Static(st.authenticated_uri()),
            (TurnSetup::Disabled, _) => {
                warn!("No TURN server configured - NAT traversal may fail for remote viewers");
                TurnMode::Disabled
            }
        };
        Self {
            stun_server: config.stun_server.clone(),
            turn,
        }
    }

    /// Create a session for one viewer
    ///
    /// A failed TURN credential fetch degrades this session to STUN-only
    /// instead of failing the viewer.
    pub async fn create(&self, viewer_id: &str) -> Result<Arc<PeerSession>> {
        let turn_uri = match &self.turn {
            TurnMode::Disabled => None,
            TurnMode::Static(uri) => Some(uri.clone()),
            TurnMode::Cloudflare(provider) => match provider.build_turn_uri().await {
                Ok(uri) => Some(uri),
                Err(e) => {
                    warn!(viewer_id, "TURN credential fetch failed, proceeding STUN-only: {}", e);
                    None
                }
            },
        };

        let setup = SessionSetup {
            stun_server: self.stun_server.clone(),
            turn_uri,
        };
        PeerSession::new(viewer_id, &setup).await
    }
}
