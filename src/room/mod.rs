#![forbid(unsafe_code)]

// Room module - participant bookkeeping and full-mesh subscription wiring.
//
// Every mutation here runs on the single signaling loop, so the
// participant map needs no lock of its own. Only the per-participant
// subscriber maps are shared with the media tasks.

pub mod participant;

pub use participant::{Participant, SubscriberTracks};

use crate::media::{OutboundTrack, TrackKind};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::ServerMessage;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

/// Client identity asserted by the join token.
pub type ClientId = u64;
/// Room identity asserted by the join token.
pub type RoomId = u64;

/// First value handed out by a room's id allocator. Allocated values
/// serve as SSRCs and as the seed of track/stream labels.
const ID_COUNTER_BASE: u64 = 150;

/// One logical conference room: the participants and the allocator that
/// keeps SSRCs unique within it.
pub struct Room {
    id: RoomId,
    participants: HashMap<ClientId, Participant>,
    next_id: u64,
    metrics: ServerMetrics,
}

impl Room {
    pub fn new(id: RoomId, metrics: ServerMetrics) -> Self {
        Self {
            id,
            participants: HashMap::new(),
            next_id: ID_COUNTER_BASE,
            metrics,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    #[must_use]
    pub fn has_participant(&self, client_id: ClientId) -> bool {
        self.participants.contains_key(&client_id)
    }

    #[must_use]
    pub fn get_participant(&self, client_id: ClientId) -> Option<&Participant> {
        self.participants.get(&client_id)
    }

    #[must_use]
    pub fn participant_ids(&self) -> Vec<ClientId> {
        self.participants.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Inserts a participant and wires every already-publishing peer's
    /// media onto the newcomer's connection, then renegotiates the
    /// newcomer so its SDP declares the new tracks.
    pub async fn add_participant(
        &mut self,
        client_id: ClientId,
        participant: Participant,
    ) -> Result<()> {
        let existing: Vec<ClientId> = self
            .participants
            .iter()
            .filter(|(_, p)| p.is_publishing())
            .map(|(id, _)| *id)
            .collect();

        for publisher_id in existing {
            let audio_id = self.alloc_id();
            let video_id = self.alloc_id();
            let Some(publisher) = self.participants.get(&publisher_id) else {
                continue;
            };
            let tracks = self
                .wire_outbound(participant.connection(), audio_id, video_id)
                .await?;
            publisher.add_remote_tracks(client_id, tracks).await;
        }

        info!(
            "participant {} joined room {} ({} present)",
            client_id,
            self.id,
            self.participants.len() + 1
        );
        self.participants.insert(client_id, participant);
        self.negotiate(client_id).await;
        Ok(())
    }

    /// Attaches a publisher's inbound track pair, wires its media onto
    /// every other participant's connection (renegotiating each), and
    /// finally asks every publisher for a keyframe so the new
    /// subscriptions start decodable.
    pub async fn handle_tracks_for_participant(
        &mut self,
        client_id: ClientId,
        audio: Arc<TrackRemote>,
        video: Arc<TrackRemote>,
    ) -> Result<()> {
        match self.participants.get_mut(&client_id) {
            Some(p) => p.set_tracks(audio, video),
            None => {
                warn!("tracks for unknown participant {client_id} in room {}", self.id);
                return Ok(());
            }
        }

        self.wire_publisher(client_id).await?;

        for p in self.participants.values() {
            p.request_keyframe().await;
        }
        Ok(())
    }

    /// Wires `publisher_id`'s media onto every other participant's
    /// connection and renegotiates each of them.
    async fn wire_publisher(&mut self, publisher_id: ClientId) -> Result<()> {
        let others: Vec<ClientId> = self
            .participants
            .keys()
            .copied()
            .filter(|id| *id != publisher_id)
            .collect();

        for other_id in others {
            let audio_id = self.alloc_id();
            let video_id = self.alloc_id();
            let (Some(publisher), Some(other)) = (
                self.participants.get(&publisher_id),
                self.participants.get(&other_id),
            ) else {
                continue;
            };
            let tracks = self
                .wire_outbound(other.connection(), audio_id, video_id)
                .await?;
            publisher.add_remote_tracks(other_id, tracks).await;
            self.negotiate(other_id).await;
        }
        Ok(())
    }

    /// Removes a participant, closing its outbound tracks in both
    /// directions and renegotiating the survivors. Idempotent; returns
    /// whether the participant was present.
    pub async fn remove_participant(&mut self, client_id: ClientId) -> bool {
        let Some(mut participant) = self.participants.remove(&client_id) else {
            return false;
        };

        info!("removing participant {} from room {}", client_id, self.id);
        participant.close_remote_tracks().await;
        participant.close_inbound_tracks();

        let others: Vec<ClientId> = self.participants.keys().copied().collect();
        for other_id in others {
            if let Some(other) = self.participants.get(&other_id) {
                other.remove_remote_tracks(client_id).await;
            }
            self.negotiate(other_id).await;
        }
        true
    }

    /// SSRC of the video track `publisher_id` publishes into
    /// `subscriber_id`'s connection.
    pub async fn video_ssrc_for(
        &self,
        publisher_id: ClientId,
        subscriber_id: ClientId,
    ) -> Option<u64> {
        self.participants
            .get(&publisher_id)?
            .subscriber_video_ssrc(subscriber_id)
            .await
    }

    /// Creates the outbound audio+video pair on a subscriber's connection.
    async fn wire_outbound(
        &self,
        subscriber_pc: &Arc<RTCPeerConnection>,
        audio_id: u64,
        video_id: u64,
    ) -> Result<SubscriberTracks> {
        let audio = OutboundTrack::create(subscriber_pc, TrackKind::Audio, audio_id).await?;
        let video = OutboundTrack::create(subscriber_pc, TrackKind::Video, video_id).await?;
        self.metrics.inc_tracks_created(2);
        Ok(SubscriberTracks { audio, video })
    }

    /// Drives a fresh local offer on a participant's connection and sends
    /// it over the signaling channel. Only connections that are New or
    /// Connected are negotiated.
    async fn negotiate(&self, client_id: ClientId) {
        let Some(participant) = self.participants.get(&client_id) else {
            return;
        };
        let pc = participant.connection();
        let state = pc.connection_state();
        if state != RTCPeerConnectionState::New && state != RTCPeerConnectionState::Connected {
            return;
        }

        match pc.create_offer(None).await {
            Ok(offer) => {
                let sdp = offer.sdp.clone();
                if let Err(e) = pc.set_local_description(offer).await {
                    warn!("set_local_description failed for participant {client_id}: {e}");
                    return;
                }
                participant.send(&ServerMessage::Offer { sdp });
            }
            Err(e) => warn!("create_offer failed for participant {client_id}: {e}"),
        }
    }
}
