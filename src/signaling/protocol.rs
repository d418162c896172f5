#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use serde::{Deserialize, Serialize};

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join offer: a signed token plus the client's SDP
    Offer { token: String, sdp: String },
    /// Answer to a server-initiated renegotiation offer
    Answer { sdp: String },
    /// Trickle ICE candidate
    #[serde(rename_all = "camelCase")]
    Candidate {
        candidate: String,
        #[serde(default)]
        sdp_mid: Option<String>,
    },
    /// Client finished gathering candidates
    EndOfCandidates,
    /// Toggle the client's video-active hint
    Mode { active: bool },
    /// Liveness probe
    Ping,
}

impl ClientMessage {
    /// Message types this server understands. Anything else is logged and
    /// ignored rather than treated as a malformed frame.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "offer",
        "answer",
        "candidate",
        "endOfCandidates",
        "mode",
        "ping",
    ];
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Renegotiation offer from the server
    Offer { sdp: String },
    /// Answer to the client's join offer
    Answer { sdp: String },
    /// Trickle ICE candidate gathered by the server
    #[serde(rename_all = "camelCase")]
    Candidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
    },
    /// Another participant toggled their video; `ssrc` names the video
    /// track that participant publishes into the receiver's connection
    Mode { ssrc: u64, active: bool },
    /// Reply to ping
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"offer","token":"tok","sdp":"v=0"}"#).unwrap();
        match msg {
            ClientMessage::Offer { token, sdp } => {
                assert_eq!(token, "tok");
                assert_eq!(sdp, "v=0");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_candidate_parses_with_and_without_mid() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"candidate","candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Candidate { candidate, sdp_mid } => {
                assert!(candidate.starts_with("candidate:"));
                assert_eq!(sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"candidate","candidate":"candidate:1"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Candidate { sdp_mid: None, .. }
        ));
    }

    #[test]
    fn test_end_of_candidates_is_camel_cased() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"endOfCandidates"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::EndOfCandidates));
    }

    #[test]
    fn test_mode_parses() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"mode","active":false}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Mode { active: false }));
    }

    #[test]
    fn test_pong_serializes() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_mode_notification_serializes() {
        let json = serde_json::to_string(&ServerMessage::Mode {
            ssrc: 151,
            active: true,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"mode","ssrc":151,"active":true}"#);
    }

    #[test]
    fn test_candidate_omits_missing_mid() {
        let json = serde_json::to_string(&ServerMessage::Candidate {
            candidate: "candidate:1".to_string(),
            sdp_mid: None,
        })
        .unwrap();
        assert!(!json.contains("sdpMid"));
    }

    #[test]
    fn test_unknown_type_fails_parse() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#);
        assert!(result.is_err());
        assert!(!ClientMessage::KNOWN_TYPES.contains(&"subscribe"));
    }
}
