#![forbid(unsafe_code)]

// Participant state and the RTP forwarding datapath.
//
// The subscriber map is guarded by a reader-writer lock: the signaling
// loop takes the writer side when wiring or tearing down subscriptions,
// the per-packet forwarding loops take the reader side. The forwarding
// loops run on media tasks and never touch the signaling loop.

use crate::media::{track, OutboundTrack, TrackKind};
use crate::metrics::ServerMetrics;
use crate::signaling::connection::OutboundFrame;
use crate::signaling::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_remote::TrackRemote;

use super::ClientId;

/// The pair of outbound tracks that carry one publisher's media to one
/// subscriber's peer connection.
pub struct SubscriberTracks {
    pub audio: OutboundTrack,
    pub video: OutboundTrack,
}

impl SubscriberTracks {
    #[must_use]
    pub fn by_kind(&self, kind: TrackKind) -> &OutboundTrack {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    async fn close(&self) {
        self.audio.close().await;
        self.video.close().await;
    }
}

type SubscriberMap = HashMap<ClientId, SubscriberTracks>;

/// One connected publisher/subscriber pair in a room.
pub struct Participant {
    id: ClientId,
    pc: Arc<RTCPeerConnection>,
    sender: mpsc::Sender<OutboundFrame>,
    inbound_audio: Option<Arc<TrackRemote>>,
    inbound_video: Option<Arc<TrackRemote>>,
    publishing: bool,
    subscribers: Arc<RwLock<SubscriberMap>>,
    metrics: ServerMetrics,
}

impl Participant {
    pub fn new(
        id: ClientId,
        pc: Arc<RTCPeerConnection>,
        sender: mpsc::Sender<OutboundFrame>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            id,
            pc,
            sender,
            inbound_audio: None,
            inbound_video: None,
            publishing: false,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            metrics,
        }
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Whether the forwarding datapath is active for this participant.
    #[must_use]
    pub fn is_publishing(&self) -> bool {
        self.publishing
    }

    #[cfg(test)]
    pub fn force_publishing(&mut self) {
        self.publishing = true;
    }

    /// Attaches the inbound track pair and starts one forwarding loop per
    /// track. Transitions the participant into its publishing state.
    pub fn set_tracks(&mut self, audio: Arc<TrackRemote>, video: Arc<TrackRemote>) {
        spawn_forwarding(
            TrackKind::Audio,
            Arc::clone(&audio),
            Arc::clone(&self.subscribers),
            self.metrics.clone(),
        );
        spawn_forwarding(
            TrackKind::Video,
            Arc::clone(&video),
            Arc::clone(&self.subscribers),
            self.metrics.clone(),
        );
        self.inbound_audio = Some(audio);
        self.inbound_video = Some(video);
        self.publishing = true;
    }

    /// Registers the outbound pair that carries this participant's media
    /// to `subscriber_id`.
    pub async fn add_remote_tracks(&self, subscriber_id: ClientId, tracks: SubscriberTracks) {
        if subscriber_id == self.id {
            warn!("refusing self-subscription for participant {}", self.id);
            tracks.close().await;
            return;
        }
        // The write guard is never held across the close calls below;
        // closing reaches back into the peer connection.
        let previous = self.subscribers.write().await.insert(subscriber_id, tracks);
        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    /// Closes and removes the outbound pair toward `subscriber_id`.
    pub async fn remove_remote_tracks(&self, subscriber_id: ClientId) {
        let removed = self.subscribers.write().await.remove(&subscriber_id);
        if let Some(tracks) = removed {
            tracks.close().await;
        }
    }

    /// Closes every outbound track and clears the subscriber map.
    pub async fn close_remote_tracks(&self) {
        let drained: Vec<SubscriberTracks> = {
            let mut subs = self.subscribers.write().await;
            subs.drain().map(|(_, tracks)| tracks).collect()
        };
        for tracks in drained {
            tracks.close().await;
        }
    }

    /// Releases the inbound track handles. The forwarding loops stop when
    /// the peer connection (and with it the receivers) shuts down.
    pub fn close_inbound_tracks(&mut self) {
        let audio = self.inbound_audio.take();
        let video = self.inbound_video.take();
        if audio.is_some() || video.is_some() {
            debug!("participant {} inbound tracks released", self.id);
        }
    }

    pub async fn has_subscriber(&self, subscriber_id: ClientId) -> bool {
        self.subscribers.read().await.contains_key(&subscriber_id)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// SSRC of the video track this participant publishes into
    /// `subscriber_id`'s connection, if wired.
    pub async fn subscriber_video_ssrc(&self, subscriber_id: ClientId) -> Option<u64> {
        self.subscribers
            .read()
            .await
            .get(&subscriber_id)
            .map(|tracks| tracks.video.ssrc())
    }

    /// All (subscriber, audio ssrc, video ssrc) triples currently wired.
    pub async fn subscriptions(&self) -> Vec<(ClientId, u64, u64)> {
        self.subscribers
            .read()
            .await
            .iter()
            .map(|(id, tracks)| (*id, tracks.audio.ssrc(), tracks.video.ssrc()))
            .collect()
    }

    /// Asks this participant's publisher leg for a keyframe.
    pub async fn request_keyframe(&self) {
        if let Some(video) = &self.inbound_video {
            track::request_keyframe(&self.pc, video.ssrc()).await;
        }
    }

    /// Delivers a signaling message to this participant's WebSocket.
    pub fn send(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("failed to serialize message for participant {}: {e}", self.id);
                return;
            }
        };
        match self.sender.try_send(OutboundFrame::Text(json)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("channel full for participant {}, dropping message", self.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("channel closed for participant {} (disconnected)", self.id);
            }
        }
    }
}

/// Spawns the per-track forwarding loop: read one RTP packet, fan it out
/// to every open subscriber track of the matching kind.
fn spawn_forwarding(
    kind: TrackKind,
    track: Arc<TrackRemote>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    metrics: ServerMetrics,
) {
    tokio::spawn(async move {
        loop {
            match track.read_rtp().await {
                Ok((mut packet, _)) => {
                    forward_packet(kind, &mut packet, &subscribers).await;
                    metrics.inc_rtp_forwarded(kind);
                }
                Err(e) => {
                    debug!("inbound {kind} track ended: {e}");
                    break;
                }
            }
        }
    });
}

/// The per-packet hot path. Holds the subscriber-map read lock for the
/// duration of the fan-out; the packet buffer is owned by this call, so
/// the SSRC rewrite happens in place, once per subscriber.
pub(crate) async fn forward_packet(
    kind: TrackKind,
    packet: &mut Packet,
    subscribers: &RwLock<SubscriberMap>,
) {
    let subs = subscribers.read().await;
    for (subscriber_id, tracks) in subs.iter() {
        let out = tracks.by_kind(kind);
        if !out.is_open() {
            continue;
        }
        packet.header.ssrc = out.rtp_ssrc();
        if let Err(e) = out.write(packet).await {
            debug!("forward to subscriber {subscriber_id} failed: {e}");
        }
    }
}
