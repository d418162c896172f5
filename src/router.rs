#![forbid(unsafe_code)]

// Router - the serialized signaling loop.
//
// Every WebSocket event and every peer-connection callback is turned into
// a RouterEvent and pushed onto one unbounded queue with a single
// consumer. All client/room state lives on that consumer, so none of it
// needs locking; the RTP datapath never enters this loop.

use crate::auth::TokenValidator;
use crate::config::ServerConfig;
use crate::media;
use crate::metrics::ServerMetrics;
use crate::room::{ClientId, Participant, Room, RoomId};
use crate::signaling::connection::OutboundFrame;
use crate::signaling::protocol::{ClientMessage, ServerMessage};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

/// Identity of one WebSocket connection, assigned at open. Distinct from
/// the token-asserted ClientId, which only exists after authorization.
pub type ConnId = u64;

/// One event on the signaling loop. Each variant corresponds to exactly
/// one WebSocket or peer-connection callback.
pub enum RouterEvent {
    SocketOpened {
        conn: ConnId,
        sender: mpsc::Sender<OutboundFrame>,
    },
    SocketClosed {
        conn: ConnId,
    },
    SocketMessage {
        conn: ConnId,
        text: String,
    },
    LocalCandidate {
        conn: ConnId,
        candidate: RTCIceCandidateInit,
    },
    ConnectionState {
        conn: ConnId,
        state: RTCPeerConnectionState,
    },
    InboundTrack {
        conn: ConnId,
        mid: String,
        track: Arc<TrackRemote>,
    },
}

/// Cloneable producer side of the signaling loop. This is all that ever
/// gets captured into I/O tasks and library callbacks.
#[derive(Clone)]
pub struct RouterHandle {
    events: mpsc::UnboundedSender<RouterEvent>,
    next_conn: Arc<AtomicU64>,
}

impl RouterHandle {
    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub fn enqueue(&self, event: RouterEvent) {
        if self.events.send(event).is_err() {
            warn!("router loop is gone, dropping event");
        }
    }
}

/// Per-connection state, from WebSocket open to close.
struct Client {
    sender: mpsc::Sender<OutboundFrame>,
    /// Set exactly once, on the first successfully validated offer
    identity: Option<(ClientId, RoomId)>,
    pc: Option<Arc<RTCPeerConnection>>,
    inbound_audio: Option<Arc<TrackRemote>>,
    inbound_video: Option<Arc<TrackRemote>>,
    video_active: bool,
    published: bool,
}

impl Client {
    fn new(sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            sender,
            identity: None,
            pc: None,
            inbound_audio: None,
            inbound_video: None,
            video_active: true,
            published: false,
        }
    }
}

/// The single consumer of the signaling queue. Owns all rooms and
/// clients.
pub struct Router {
    cfg: ServerConfig,
    api: API,
    validator: TokenValidator,
    metrics: ServerMetrics,
    handle: RouterHandle,
    clients: HashMap<ConnId, Client>,
    rooms: HashMap<RoomId, Room>,
}

impl Router {
    pub fn new(
        cfg: ServerConfig,
        validator: TokenValidator,
        api: API,
        metrics: ServerMetrics,
    ) -> (Self, RouterHandle, mpsc::UnboundedReceiver<RouterEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = RouterHandle {
            events: events_tx,
            next_conn: Arc::new(AtomicU64::new(1)),
        };
        let router = Self {
            cfg,
            api,
            validator,
            metrics,
            handle: handle.clone(),
            clients: HashMap::new(),
            rooms: HashMap::new(),
        };
        (router, handle, events_rx)
    }

    /// Drains the signaling queue until every producer is gone. A failed
    /// event is logged and skipped; it never terminates the loop.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<RouterEvent>) {
        info!("signaling loop started");
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_event(event).await {
                self.metrics.inc_errors();
                warn!("signaling task failed: {e:#}");
            }
        }
        info!("signaling loop stopped");
    }

    async fn handle_event(&mut self, event: RouterEvent) -> Result<()> {
        match event {
            RouterEvent::SocketOpened { conn, sender } => {
                info!("[client {conn}] websocket connected");
                self.clients.insert(conn, Client::new(sender));
                Ok(())
            }
            RouterEvent::SocketClosed { conn } => {
                if self.clients.contains_key(&conn) {
                    info!("[client {conn}] websocket disconnected");
                    self.close_client(conn).await;
                }
                Ok(())
            }
            RouterEvent::SocketMessage { conn, text } => self.on_message(conn, &text).await,
            RouterEvent::LocalCandidate { conn, candidate } => {
                self.on_local_candidate(conn, candidate);
                Ok(())
            }
            RouterEvent::ConnectionState { conn, state } => {
                self.on_connection_state(conn, state).await
            }
            RouterEvent::InboundTrack { conn, mid, track } => {
                self.on_inbound_track(conn, mid, track).await
            }
        }
    }

    // --- WebSocket message handling ---

    async fn on_message(&mut self, conn: ConnId, text: &str) -> Result<()> {
        let Some(client) = self.clients.get(&conn) else {
            return Ok(());
        };
        let authorized = client.identity.is_some();

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("[client {conn}] invalid JSON signaling message: {e}");
                self.close_client(conn).await;
                return Ok(());
            }
        };
        let Some(msg_type) = value.get("type").and_then(|t| t.as_str()) else {
            warn!("[client {conn}] signaling message missing type");
            self.close_client(conn).await;
            return Ok(());
        };
        let msg_type = msg_type.to_string();
        debug!("[client {conn}] received signaling: {msg_type}");

        // Nothing but an offer is acceptable before authorization.
        if msg_type != "offer" && !authorized {
            warn!("[client {conn}] {msg_type} before authorization, closing");
            self.close_client(conn).await;
            return Ok(());
        }

        if !ClientMessage::KNOWN_TYPES.contains(&msg_type.as_str()) {
            debug!("[client {conn}] unknown message type: {msg_type}");
            return Ok(());
        }

        let message: ClientMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                warn!("[client {conn}] malformed {msg_type} message: {e}");
                self.close_client(conn).await;
                return Ok(());
            }
        };

        let start = Instant::now();
        let result = self.dispatch(conn, message).await;
        self.metrics.observe_message_handling(start.elapsed());
        result
    }

    async fn dispatch(&mut self, conn: ConnId, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Offer { token, sdp } => self.on_offer(conn, &token, sdp).await,
            ClientMessage::Answer { sdp } => {
                let Some(pc) = self.clients.get(&conn).and_then(|c| c.pc.clone()) else {
                    warn!("[client {conn}] answer without a peer connection");
                    return Ok(());
                };
                pc.set_remote_description(RTCSessionDescription::answer(sdp)?)
                    .await?;
                Ok(())
            }
            ClientMessage::Candidate { candidate, sdp_mid } => {
                if !candidate_is_forwardable(&candidate) {
                    debug!("[client {conn}] skipping candidate: {candidate:?}");
                    return Ok(());
                }
                let Some(pc) = self.clients.get(&conn).and_then(|c| c.pc.clone()) else {
                    return Ok(());
                };
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    ..Default::default()
                };
                if let Err(e) = pc.add_ice_candidate(init).await {
                    warn!("[client {conn}] failed to add candidate: {e}");
                }
                Ok(())
            }
            ClientMessage::EndOfCandidates => {
                debug!("[client {conn}] finished sending candidates");
                Ok(())
            }
            ClientMessage::Mode { active } => self.on_mode(conn, active).await,
            ClientMessage::Ping => {
                self.send_to(conn, &ServerMessage::Pong);
                Ok(())
            }
        }
    }

    async fn on_offer(&mut self, conn: ConnId, token: &str, sdp: String) -> Result<()> {
        let (client_id, room_id) = match self.validator.validate(token) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("[client {conn}] join token rejected: {e}");
                if let Some(client) = self.clients.get(&conn) {
                    let _ = client
                        .sender
                        .try_send(OutboundFrame::Text(Arc::new(e.to_string())));
                }
                self.close_client(conn).await;
                return Ok(());
            }
        };

        // Identity is assigned exactly once per connection.
        match self.clients.get(&conn) {
            Some(client) => {
                if let Some(identity) = client.identity {
                    if identity != (client_id, room_id) {
                        warn!("[client {conn}] offer validated to a different identity, closing");
                        self.close_client(conn).await;
                        return Ok(());
                    }
                }
            }
            None => return Ok(()),
        }

        // Last writer wins: evict any other connection holding this
        // client id before the new participant is created.
        let evicted: Option<ConnId> = self
            .clients
            .iter()
            .find(|(other_conn, c)| {
                **other_conn != conn && c.identity.map(|(cid, _)| cid) == Some(client_id)
            })
            .map(|(other_conn, _)| *other_conn);
        if let Some(old_conn) = evicted {
            info!("[client {old_conn}] evicted: client id {client_id} joined again");
            self.close_client(old_conn).await;
        }

        if let Some(client) = self.clients.get_mut(&conn) {
            client.identity = Some((client_id, room_id));
        }

        if !self.rooms.contains_key(&room_id) {
            self.rooms
                .insert(room_id, Room::new(room_id, self.metrics.clone()));
            self.metrics.inc_rooms_created();
            self.metrics.inc_rooms_active();
            info!("created room {room_id}");
        }

        let pc = match self.clients.get(&conn).and_then(|c| c.pc.clone()) {
            Some(pc) => pc,
            None => {
                debug!("[client {conn}] creating peer connection");
                let pc = media::create_peer_connection(&self.api, &self.cfg).await?;
                self.install_callbacks(&pc, conn);
                if let Some(client) = self.clients.get_mut(&conn) {
                    client.pc = Some(Arc::clone(&pc));
                }
                pc
            }
        };

        pc.set_remote_description(RTCSessionDescription::offer(sdp)?)
            .await?;
        let answer = pc.create_answer(None).await?;
        let answer_sdp = answer.sdp.clone();
        pc.set_local_description(answer).await?;
        self.send_to(conn, &ServerMessage::Answer { sdp: answer_sdp });

        info!("[client {conn}] authorized as client {client_id} in room {room_id}");
        Ok(())
    }

    async fn on_mode(&mut self, conn: ConnId, active: bool) -> Result<()> {
        let (client_id, room_id) = {
            let Some(client) = self.clients.get_mut(&conn) else {
                return Ok(());
            };
            debug!(
                "[client {conn}] video active {} -> {active}",
                client.video_active
            );
            client.video_active = active;
            let Some(identity) = client.identity else {
                return Ok(());
            };
            identity
        };
        let Some(room) = self.rooms.get(&room_id) else {
            return Ok(());
        };

        let peers: Vec<(ConnId, ClientId)> = self
            .clients
            .iter()
            .filter_map(|(other_conn, c)| match c.identity {
                Some((other_id, r)) if *other_conn != conn && r == room_id => {
                    Some((*other_conn, other_id))
                }
                _ => None,
            })
            .collect();

        for (other_conn, other_id) in peers {
            if let Some(ssrc) = room.video_ssrc_for(client_id, other_id).await {
                self.send_to(other_conn, &ServerMessage::Mode { ssrc, active });
            }
        }
        Ok(())
    }

    // --- Peer-connection events ---

    fn on_local_candidate(&self, conn: ConnId, candidate: RTCIceCandidateInit) {
        if !candidate_is_forwardable(&candidate.candidate) {
            debug!("[client {conn}] skipping local candidate: {:?}", candidate.candidate);
            return;
        }
        debug!("[client {conn}] local candidate: {}", candidate.candidate);
        self.send_to(
            conn,
            &ServerMessage::Candidate {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
            },
        );
    }

    async fn on_connection_state(
        &mut self,
        conn: ConnId,
        state: RTCPeerConnectionState,
    ) -> Result<()> {
        debug!("[client {conn}] peer connection state: {state}");
        match state {
            RTCPeerConnectionState::Connected => self.on_connected(conn).await,
            RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Closed => {
                let identity = self.clients.get(&conn).and_then(|c| c.identity);
                if let Some((client_id, room_id)) = identity {
                    warn!("[client {conn}] peer connection {state}; removing participant");
                    self.leave_room(client_id, room_id).await;
                    if let Some(client) = self.clients.get_mut(&conn) {
                        client.published = false;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_connected(&mut self, conn: ConnId) -> Result<()> {
        let (client_id, room_id, pc, sender) = {
            let Some(client) = self.clients.get(&conn) else {
                return Ok(());
            };
            let Some(identity) = client.identity else {
                return Ok(());
            };
            let Some(pc) = client.pc.clone() else {
                return Ok(());
            };
            (identity.0, identity.1, pc, client.sender.clone())
        };

        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Ok(());
        };
        if room.has_participant(client_id) {
            return Ok(());
        }

        let participant = Participant::new(client_id, pc, sender, self.metrics.clone());
        room.add_participant(client_id, participant).await?;
        self.metrics.inc_joins();
        self.metrics.inc_participants_active();

        self.maybe_publish(conn).await
    }

    async fn on_inbound_track(
        &mut self,
        conn: ConnId,
        mid: String,
        track: Arc<TrackRemote>,
    ) -> Result<()> {
        let Some(client) = self.clients.get_mut(&conn) else {
            return Ok(());
        };
        debug!(
            "[client {conn}] inbound {} track, mid {mid}, ssrc {}",
            track.kind(),
            track.ssrc()
        );
        match mid.as_str() {
            media::AUDIO_MID => client.inbound_audio = Some(track),
            media::VIDEO_MID => client.inbound_video = Some(track),
            other => {
                debug!("[client {conn}] ignoring track with unexpected mid {other}");
                return Ok(());
            }
        }
        self.maybe_publish(conn).await
    }

    /// Starts forwarding for a client once it is Connected and both
    /// inbound tracks have arrived, in whichever order that happens.
    async fn maybe_publish(&mut self, conn: ConnId) -> Result<()> {
        let (client_id, room_id, audio, video) = {
            let Some(client) = self.clients.get(&conn) else {
                return Ok(());
            };
            if client.published {
                return Ok(());
            }
            let Some((client_id, room_id)) = client.identity else {
                return Ok(());
            };
            let (Some(audio), Some(video)) =
                (client.inbound_audio.clone(), client.inbound_video.clone())
            else {
                return Ok(());
            };
            (client_id, room_id, audio, video)
        };

        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Ok(());
        };
        if !room.has_participant(client_id) {
            // Not Connected yet; the state-change event will retry.
            return Ok(());
        }

        room.handle_tracks_for_participant(client_id, audio, video)
            .await?;
        if let Some(client) = self.clients.get_mut(&conn) {
            client.published = true;
        }
        info!("[client {conn}] publishing as participant {client_id} in room {room_id}");
        Ok(())
    }

    // --- Teardown helpers ---

    /// Removes a client entirely: participant, peer connection, socket.
    async fn close_client(&mut self, conn: ConnId) {
        let Some(client) = self.clients.remove(&conn) else {
            return;
        };
        if let Some((client_id, room_id)) = client.identity {
            self.leave_room(client_id, room_id).await;
        }
        let _ = client.sender.try_send(OutboundFrame::Close);
        if let Some(pc) = client.pc {
            if let Err(e) = pc.close().await {
                debug!("[client {conn}] peer connection close failed: {e}");
            }
        }
    }

    async fn leave_room(&mut self, client_id: ClientId, room_id: RoomId) {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        if room.remove_participant(client_id).await {
            self.metrics.inc_leaves();
            self.metrics.dec_participants_active();
        }
        if room.is_empty() {
            self.rooms.remove(&room_id);
            self.metrics.dec_rooms_active();
            info!("room {room_id} is empty, tearing down");
        }
    }

    fn send_to(&self, conn: ConnId, message: &ServerMessage) {
        let Some(client) = self.clients.get(&conn) else {
            return;
        };
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("[client {conn}] failed to serialize message: {e}");
                return;
            }
        };
        match client.sender.try_send(OutboundFrame::Text(json)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("[client {conn}] channel full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("[client {conn}] channel closed (disconnected)");
            }
        }
    }

    // --- Peer-connection callback installation ---

    /// Installs the library callbacks for one connection. Callbacks
    /// capture only the connection id and the queue handle, never owning
    /// references to router state.
    fn install_callbacks(&self, pc: &Arc<RTCPeerConnection>, conn: ConnId) {
        let handle = self.handle.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let handle = handle.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => handle.enqueue(RouterEvent::LocalCandidate {
                            conn,
                            candidate: init,
                        }),
                        Err(e) => warn!("[client {conn}] candidate serialization failed: {e}"),
                    }
                }
            })
        }));

        let handle = self.handle.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let handle = handle.clone();
            Box::pin(async move {
                handle.enqueue(RouterEvent::ConnectionState { conn, state });
            })
        }));

        // The handler returns immediately after enqueueing so the
        // library's on_track dispatch is never blocked.
        let handle = self.handle.clone();
        pc.on_track(Box::new(move |track, _receiver, transceiver| {
            let handle = handle.clone();
            Box::pin(async move {
                let mid = transceiver.mid().unwrap_or_default().to_string();
                handle.enqueue(RouterEvent::InboundTrack { conn, mid, track });
            })
        }));
    }
}

/// The candidate filter: empty candidates and candidates without a `.`
/// (the IPv6 heuristic) are never forwarded or applied.
#[must_use]
pub fn candidate_is_forwardable(candidate: &str) -> bool {
    !candidate.is_empty() && candidate.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::{test_keys, JoinClaims};

    fn join_token(user_id: i64, room: i64) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &JoinClaims {
                user_id,
                room,
                exp: None,
            },
            &jsonwebtoken::EncodingKey::from_rsa_pem(test_keys::PRIVATE_PEM.as_bytes()).unwrap(),
        )
        .unwrap()
    }

    /// A minimal browser-style offer matching the wire contract: mids
    /// "0"/"1", Opus PT 109, VP8 PT 120. The ICE credentials and DTLS
    /// fingerprint are placeholders; nothing connects in these tests.
    fn client_offer_sdp() -> String {
        [
            "v=0",
            "o=- 4611731400430051336 2 IN IP4 127.0.0.1",
            "s=-",
            "t=0 0",
            "a=group:BUNDLE 0 1",
            "a=ice-ufrag:roomcast",
            "a=ice-pwd:roomcastroomcastroomcast",
            "a=fingerprint:sha-256 4A:AD:B9:B1:3F:82:18:3B:54:02:12:DF:3E:5D:49:6B:19:E5:7C:AB:3E:4B:65:2E:7D:46:3F:54:42:CD:54:F1",
            "m=audio 9 UDP/TLS/RTP/SAVPF 109",
            "c=IN IP4 0.0.0.0",
            "a=rtcp:9 IN IP4 0.0.0.0",
            "a=rtcp-mux",
            "a=mid:0",
            "a=sendrecv",
            "a=rtpmap:109 opus/48000/2",
            "a=setup:actpass",
            "m=video 9 UDP/TLS/RTP/SAVPF 120",
            "c=IN IP4 0.0.0.0",
            "a=rtcp:9 IN IP4 0.0.0.0",
            "a=rtcp-mux",
            "a=mid:1",
            "a=sendrecv",
            "a=rtpmap:120 VP8/90000",
            "a=setup:actpass",
            "",
        ]
        .join("\r\n")
    }

    #[test]
    fn test_candidate_filter() {
        assert!(candidate_is_forwardable(
            "candidate:1 1 udp 2122260223 192.168.1.10 50001 typ host"
        ));
        assert!(!candidate_is_forwardable(""));
        // The IPv6 heuristic: no dot anywhere means drop.
        assert!(!candidate_is_forwardable(
            "candidate:1 1 udp 2122260223 fe80::1 50001 typ host"
        ));
    }

    struct TestRouter {
        router: Router,
    }

    impl TestRouter {
        fn new() -> Self {
            let cfg = ServerConfig::default();
            let api = media::build_api(&cfg).unwrap();
            let validator =
                TokenValidator::from_rsa_pem(test_keys::PUBLIC_PEM.as_bytes()).unwrap();
            let (router, _handle, _rx) =
                Router::new(cfg, validator, api, ServerMetrics::new());
            Self { router }
        }

        async fn open(&mut self, conn: ConnId) -> mpsc::Receiver<OutboundFrame> {
            let (tx, rx) = mpsc::channel(8);
            self.router
                .handle_event(RouterEvent::SocketOpened { conn, sender: tx })
                .await
                .unwrap();
            rx
        }

        async fn message(&mut self, conn: ConnId, text: &str) {
            self.router
                .handle_event(RouterEvent::SocketMessage {
                    conn,
                    text: text.to_string(),
                })
                .await
                .unwrap();
        }
    }

    fn expect_close(rx: &mut mpsc::Receiver<OutboundFrame>) {
        loop {
            match rx.try_recv() {
                Ok(OutboundFrame::Close) => return,
                Ok(OutboundFrame::Text(_)) => continue,
                Err(_) => panic!("expected a close frame"),
            }
        }
    }

    #[tokio::test]
    async fn test_non_offer_before_authorization_closes() {
        let mut t = TestRouter::new();
        let mut rx = t.open(1).await;

        t.message(1, r#"{"type":"candidate","candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host"}"#)
            .await;

        expect_close(&mut rx);
        assert!(!t.router.clients.contains_key(&1));
        assert!(t.router.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_json_closes() {
        let mut t = TestRouter::new();
        let mut rx = t.open(1).await;

        t.message(1, "not json at all").await;

        expect_close(&mut rx);
        assert!(!t.router.clients.contains_key(&1));
    }

    #[tokio::test]
    async fn test_invalid_token_sends_error_then_closes() {
        let mut t = TestRouter::new();
        let mut rx = t.open(1).await;

        t.message(1, r#"{"type":"offer","token":"garbage","sdp":"v=0"}"#)
            .await;

        match rx.try_recv() {
            Ok(OutboundFrame::Text(text)) => assert_eq!(&*text, "invalid token"),
            other => panic!("expected error text frame, got {other:?}"),
        }
        match rx.try_recv() {
            Ok(OutboundFrame::Close) => {}
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(!t.router.clients.contains_key(&1));
        assert!(t.router.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored_when_authorized() {
        let mut t = TestRouter::new();
        let _rx = t.open(1).await;

        // Force authorization so the gate lets the unknown type through.
        t.router.clients.get_mut(&1).unwrap().identity = Some((7, 42));
        t.message(1, r#"{"type":"subscribe"}"#).await;

        assert!(t.router.clients.contains_key(&1));
    }

    #[tokio::test]
    async fn test_identity_collision_evicts_first_connection() {
        let mut t = TestRouter::new();
        let mut rx1 = t.open(1).await;
        let mut rx2 = t.open(2).await;

        let offer = serde_json::json!({
            "type": "offer",
            "token": join_token(7, 42),
            "sdp": client_offer_sdp(),
        })
        .to_string();

        t.message(1, &offer).await;
        t.router
            .handle_event(RouterEvent::ConnectionState {
                conn: 1,
                state: RTCPeerConnectionState::Connected,
            })
            .await
            .unwrap();
        assert_eq!(t.router.rooms.get(&42).unwrap().len(), 1);

        // Client 7 joins again on a fresh connection: the old one is
        // evicted before the new participant is created.
        t.message(2, &offer).await;
        t.router
            .handle_event(RouterEvent::ConnectionState {
                conn: 2,
                state: RTCPeerConnectionState::Connected,
            })
            .await
            .unwrap();

        expect_close(&mut rx1);
        assert!(!t.router.clients.contains_key(&1));
        assert!(t.router.clients.contains_key(&2));

        // Room size is unchanged across the transition.
        let room = t.router.rooms.get(&42).unwrap();
        assert_eq!(room.len(), 1);
        assert!(room.has_participant(7));

        // The surviving connection completed the offer exchange.
        let mut answered = false;
        while let Ok(frame) = rx2.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                if text.contains(r#""type":"answer""#) {
                    answered = true;
                }
            }
        }
        assert!(answered, "second connection never got an answer");
    }

    #[tokio::test]
    async fn test_mode_notifies_peers_with_their_ssrc() {
        let mut t = TestRouter::new();
        let mut rx_a = t.open(1).await;
        let mut rx_b = t.open(2).await;
        t.router.clients.get_mut(&1).unwrap().identity = Some((7, 42));
        t.router.clients.get_mut(&2).unwrap().identity = Some((9, 42));

        // Wire a two-participant room directly, the way the Connected
        // transitions would.
        let cfg = ServerConfig::default();
        let api = media::build_api(&cfg).unwrap();
        let mut room = Room::new(42, ServerMetrics::new());
        for (conn, client_id) in [(1u64, 7u64), (2, 9)] {
            let pc = media::create_peer_connection(&api, &cfg).await.unwrap();
            let sender = t.router.clients.get(&conn).unwrap().sender.clone();
            let mut participant =
                Participant::new(client_id, pc, sender, ServerMetrics::new());
            participant.force_publishing();
            room.add_participant(client_id, participant).await.unwrap();
        }
        t.router.rooms.insert(42, room);

        t.message(1, r#"{"type":"mode","active":false}"#).await;

        // B sees A's video through the track with SSRC 151.
        let mut found = false;
        while let Ok(frame) = rx_b.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                if text.contains(r#""type":"mode""#) {
                    assert_eq!(&*text, r#"{"type":"mode","ssrc":151,"active":false}"#);
                    found = true;
                }
            }
        }
        assert!(found, "peer did not receive the mode notification");

        // The sender itself gets no mode echo.
        while let Ok(frame) = rx_a.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                assert!(!text.contains(r#""type":"mode""#));
            }
        }
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let mut t = TestRouter::new();
        let mut rx = t.open(1).await;

        t.router.clients.get_mut(&1).unwrap().identity = Some((7, 42));
        t.message(1, r#"{"type":"ping"}"#).await;

        match rx.try_recv() {
            Ok(OutboundFrame::Text(text)) => assert_eq!(&*text, r#"{"type":"pong"}"#),
            other => panic!("expected pong, got {other:?}"),
        }
    }
}
