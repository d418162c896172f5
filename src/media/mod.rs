#![forbid(unsafe_code)]

// Media module - construction of the webrtc-rs API and peer connections.
// The media engine is pinned to exactly the codecs of the wire contract:
// Opus (PT 109) on mid "0" and VP8 (PT 120) on mid "1".

pub mod track;

pub use track::OutboundTrack;

use crate::config::ServerConfig;
use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType,
};

/// Payload type for Opus audio, fixed by the signaling contract.
pub const AUDIO_PAYLOAD_TYPE: u8 = 109;
/// Payload type for VP8 video, fixed by the signaling contract.
pub const VIDEO_PAYLOAD_TYPE: u8 = 120;
/// Advertised VP8 target bitrate in kbps.
pub const VIDEO_TARGET_BITRATE_KBPS: u32 = 3000;
/// Transceiver mid carrying the client's audio.
pub const AUDIO_MID: &str = "0";
/// Transceiver mid carrying the client's video.
pub const VIDEO_MID: &str = "1";

/// Media kind of a track, audio or video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    /// Maps a webrtc codec type; `Unspecified` yields None.
    pub fn from_codec_type(codec_type: RTPCodecType) -> Option<Self> {
        match codec_type {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec capability for outbound Opus tracks.
#[must_use]
pub fn audio_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Codec capability for outbound VP8 tracks.
#[must_use]
pub fn video_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: format!("x-google-max-bitrate={VIDEO_TARGET_BITRATE_KBPS}"),
        rtcp_feedback: vec![],
    }
}

/// Builds the shared webrtc API: pinned codecs, the SDES mid header
/// extension (required so inbound RTP routes to the right transceiver),
/// default interceptors for RTCP report handling, and the configured ICE
/// UDP port range.
pub fn build_api(cfg: &ServerConfig) -> Result<API> {
    let mut media_engine = MediaEngine::default();

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: audio_codec_capability(),
            payload_type: AUDIO_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: video_codec_capability(),
            payload_type: VIDEO_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    for codec_type in [RTPCodecType::Audio, RTPCodecType::Video] {
        media_engine.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: "urn:ietf:params:rtp-hdrext:sdes:mid".to_owned(),
            },
            codec_type,
            None,
        )?;
    }

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    let ephemeral = EphemeralUDP::new(cfg.ice_port_min, cfg.ice_port_max)?;
    setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
    if let Some(ip) = cfg.announce_ip {
        setting_engine.set_nat_1to1_ips(vec![ip.to_string()], RTCIceCandidateType::Host);
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

/// Creates a peer connection configured with the single public STUN
/// server. Renegotiation is entirely server-driven; no negotiation-needed
/// handler is ever installed.
pub async fn create_peer_connection(
    api: &API,
    cfg: &ServerConfig,
) -> Result<Arc<RTCPeerConnection>> {
    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![cfg.stun_server.clone()],
            ..Default::default()
        }],
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await?;
    Ok(Arc::new(pc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kind_mapping() {
        assert_eq!(
            TrackKind::from_codec_type(RTPCodecType::Audio),
            Some(TrackKind::Audio)
        );
        assert_eq!(
            TrackKind::from_codec_type(RTPCodecType::Video),
            Some(TrackKind::Video)
        );
        assert_eq!(TrackKind::from_codec_type(RTPCodecType::Unspecified), None);
    }

    #[test]
    fn test_codec_capabilities_match_contract() {
        let audio = audio_codec_capability();
        assert_eq!(audio.mime_type, MIME_TYPE_OPUS);
        assert_eq!(audio.clock_rate, 48000);

        let video = video_codec_capability();
        assert_eq!(video.mime_type, MIME_TYPE_VP8);
        assert!(video
            .sdp_fmtp_line
            .contains(&VIDEO_TARGET_BITRATE_KBPS.to_string()));
    }

    #[tokio::test]
    async fn test_peer_connection_creation() {
        let cfg = ServerConfig::default();
        let api = build_api(&cfg).unwrap();
        let pc = create_peer_connection(&api, &cfg).await.unwrap();
        pc.close().await.unwrap();
    }
}
