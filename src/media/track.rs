#![forbid(unsafe_code)]

// Outbound track handle. Each subscription direction owns two of these,
// one per media kind; the id allocated by the room doubles as the RTP
// SSRC every forwarded packet carries on this track.

use super::{audio_codec_capability, video_codec_capability, TrackKind};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

/// A server-created track carrying one remote publisher's media to one
/// subscriber's peer connection.
pub struct OutboundTrack {
    /// Room-allocated id; also the SSRC stamped on forwarded packets
    id: u64,
    kind: TrackKind,
    sink: Arc<dyn TrackLocalWriter + Send + Sync>,
    sender: Option<Arc<RTCRtpSender>>,
    /// Non-owning handle to the subscriber's connection, for removal
    pc: Weak<RTCPeerConnection>,
    closed: AtomicBool,
}

impl OutboundTrack {
    /// Creates the local track, adds it to the subscriber's peer
    /// connection, and spawns the RTCP drain for its sender.
    pub async fn create(
        pc: &Arc<RTCPeerConnection>,
        kind: TrackKind,
        id: u64,
    ) -> Result<Self> {
        let capability = match kind {
            TrackKind::Audio => audio_codec_capability(),
            TrackKind::Video => video_codec_capability(),
        };

        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            format!("{kind}-{id}"),
            format!("stream-{id}"),
        ));

        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        spawn_rtcp_drain(Arc::clone(&sender));

        Ok(Self {
            id,
            kind,
            sink: track,
            sender: Some(sender),
            pc: Arc::downgrade(pc),
            closed: AtomicBool::new(false),
        })
    }

    /// Test constructor: a track bound to nothing but a recording sink.
    #[cfg(test)]
    pub fn detached(id: u64, kind: TrackKind, sink: Arc<dyn TrackLocalWriter + Send + Sync>) -> Self {
        Self {
            id,
            kind,
            sink,
            sender: None,
            pc: Weak::new(),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn ssrc(&self) -> u64 {
        self.id
    }

    /// The SSRC value written into the 32-bit RTP header field.
    #[must_use]
    pub fn rtp_ssrc(&self) -> u32 {
        self.id as u32
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Writes one RTP packet to the underlying track. The caller has
    /// already stamped the packet with this track's SSRC.
    pub async fn write(&self, packet: &webrtc::rtp::packet::Packet) -> webrtc::error::Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        self.sink.write_rtp(packet).await
    }

    /// Marks the track closed and removes it from its peer connection.
    /// Removal is best-effort; the subscriber may already be tearing down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (Some(sender), Some(pc)) = (self.sender.as_ref(), self.pc.upgrade()) else {
            return;
        };
        if let Err(e) = pc.remove_track(sender).await {
            debug!("removing {} track {} failed: {e}", self.kind, self.id);
        }
    }
}

/// Drains RTCP on an RTP sender so sender reports and feedback are
/// consumed by the interceptor chain.
pub fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while let Ok((_, _)) = sender.read(&mut buf).await {}
        debug!("RTCP drain stopped");
    });
}

/// Asks a publisher for a keyframe via RTCP Picture Loss Indication, so
/// freshly wired subscribers get a decodable frame promptly.
pub async fn request_keyframe(pc: &RTCPeerConnection, media_ssrc: u32) {
    let pli = PictureLossIndication {
        sender_ssrc: 0,
        media_ssrc,
    };
    if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
        warn!("PLI send failed for ssrc {media_ssrc}: {e}");
    }
}
