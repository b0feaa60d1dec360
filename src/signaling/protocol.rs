//! Signaling wire protocol (JSON text frames)
//!
//! The relay speaks flat JSON objects discriminated by a `type` field.
//! Inbound messages announce viewer lifecycle and carry the answer and
//! trickled candidates; outbound messages register the broadcaster and
//! carry the offer and local candidates.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Messages arriving from the signaling relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// A new viewer requests the stream
    #[serde(rename = "viewer-joined")]
    ViewerJoined {
        /// Viewer identifier, unique among connected viewers
        viewer_id: String,
    },

    /// SDP answer from a viewer
    #[serde(rename = "answer")]
    Answer {
        /// Answering viewer
        from: String,
        /// SDP answer text
        sdp: String,
    },

    /// Trickled remote candidate; an empty candidate means end-of-candidates
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// Originating viewer
        from: String,
        /// Candidate string
        candidate: String,
        /// SDP media line index
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: u16,
    },

    /// A viewer disconnected
    #[serde(rename = "viewer-left")]
    ViewerLeft {
        /// Viewer identifier
        viewer_id: String,
    },
}

/// Messages sent to the signaling relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// Register this process as the broadcaster of a stream
    #[serde(rename = "register")]
    Register {
        /// Always "broadcaster"
        role: String,
        /// Stream identifier viewers subscribe to
        stream_id: String,
    },

    /// SDP offer for one viewer
    #[serde(rename = "offer")]
    Offer {
        /// Destination viewer
        to: String,
        /// SDP offer text
        sdp: String,
    },

    /// Locally gathered candidate for one viewer
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// Destination viewer
        to: String,
        /// Candidate string
        candidate: String,
        /// SDP media line index
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: u16,
    },
}

impl InboundMessage {
    /// Parse a text frame
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Serialization(format!("failed to parse signaling message: {}", e)))
    }
}

impl OutboundMessage {
    /// Broadcaster registration message
    pub fn register(stream_id: &str) -> Self {
        OutboundMessage::Register {
            role: "broadcaster".to_string(),
            stream_id: stream_id.to_string(),
        }
    }

    /// Serialize to a text frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::Serialization(format!("failed to serialize signaling message: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewer_joined_wire_shape() {
        let msg = InboundMessage::from_json(r#"{"type":"viewer-joined","viewer_id":"A"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::ViewerJoined {
                viewer_id: "A".to_string()
            }
        );
    }

    #[test]
    fn test_answer_wire_shape() {
        let msg =
            InboundMessage::from_json(r#"{"type":"answer","from":"A","sdp":"v=0\r\n"}"#).unwrap();
        match msg {
            InboundMessage::Answer { from, sdp } => {
                assert_eq!(from, "A");
                assert!(sdp.starts_with("v=0"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_ice_candidate_field_casing() {
        let msg = InboundMessage::from_json(
            r#"{"type":"ice-candidate","from":"A","candidate":"candidate:1 1 udp 2122 192.0.2.1 54400 typ host","sdpMLineIndex":0}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::IceCandidate {
                from,
                candidate,
                sdp_mline_index,
            } => {
                assert_eq!(from, "A");
                assert!(candidate.starts_with("candidate:1"));
                assert_eq!(sdp_mline_index, 0);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_empty_candidate_is_preserved() {
        let msg = InboundMessage::from_json(
            r#"{"type":"ice-candidate","from":"A","candidate":"","sdpMLineIndex":1}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::IceCandidate { candidate, .. } => assert!(candidate.is_empty()),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_viewer_left_wire_shape() {
        let msg = InboundMessage::from_json(r#"{"type":"viewer-left","viewer_id":"D"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::ViewerLeft {
                viewer_id: "D".to_string()
            }
        );
    }

    #[test]
    fn test_register_serialization() {
        let json = OutboundMessage::register("pi-camera-stream").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["role"], "broadcaster");
        assert_eq!(value["stream_id"], "pi-camera-stream");
    }

    #[test]
    fn test_offer_serialization() {
        let json = OutboundMessage::Offer {
            to: "A".to_string(),
            sdp: "v=0\r\n".to_string(),
        }
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["to"], "A");
    }

    #[test]
    fn test_outbound_candidate_field_casing() {
        let json = OutboundMessage::IceCandidate {
            to: "A".to_string(),
            candidate: "candidate:2 1 udp 1686 198.51.100.4 61000 typ srflx".to_string(),
            sdp_mline_index: 1,
        }
        .to_json()
        .unwrap();
        assert!(json.contains("\"sdpMLineIndex\":1"));
        assert!(!json.contains("sdp_mline_index"));
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        assert!(InboundMessage::from_json(r#"{"type":"chat","text":"hi"}"#).is_err());
        assert!(InboundMessage::from_json("not json").is_err());
    }
}
