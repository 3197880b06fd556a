//! Peer connection manager: one negotiated connection per remote participant.
//!
//! The manager is driven from a single task. Every handler runs to
//! completion before the next signaling message or link event is applied,
//! so the connection map never needs locking. Failures are scoped to the
//! peer they came from.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::OfferStrategy;
use crate::connection::{
    LinkEvent, LinkEventKind, LinkEventSender, LinkFactory, LinkId, LinkState, NegotiationState,
    PeerConnection, PeerLink, RemoteTrack, Role,
};
use crate::error::{Error, PeerKey, Result};
use crate::media::MediaStream;
use crate::signaling::{Envelope, MeetingId, Signal, SignalSink, TeamId, UserId};

/// Live media from one connected peer, as exposed to renderers.
#[derive(Debug, Clone)]
pub struct RemoteMediaHandle {
    pub user_id: UserId,
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

pub type RemoteMediaMap = BTreeMap<UserId, RemoteMediaHandle>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub user_id: UserId,
    pub link_id: LinkId,
    pub role: Role,
    pub state: NegotiationState,
    pub queued_candidates: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Outbound,
    Peer(UserId),
}

pub struct PeerConnectionManager<F: LinkFactory> {
    local_id: UserId,
    meeting_id: Option<MeetingId>,
    team_id: Option<TeamId>,
    strategy: OfferStrategy,
    factory: F,
    signals: Arc<dyn SignalSink>,
    events: LinkEventSender,
    next_link: LinkId,
    local_media: Option<MediaStream>,
    outbound: Option<PeerConnection<F::Link>>,
    peers: HashMap<UserId, PeerConnection<F::Link>>,
    early_candidates: HashMap<UserId, Vec<RTCIceCandidateInit>>,
    remote_media: watch::Sender<RemoteMediaMap>,
}

impl<F: LinkFactory> PeerConnectionManager<F> {
    /// Returns the manager and the receiver its links report into; the
    /// owner feeds that receiver back through [`handle_link_event`].
    ///
    /// [`handle_link_event`]: PeerConnectionManager::handle_link_event
    pub fn new(
        local_id: UserId,
        strategy: OfferStrategy,
        factory: F,
        signals: Arc<dyn SignalSink>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (remote_media, _) = watch::channel(RemoteMediaMap::new());
        let manager = Self {
            local_id,
            meeting_id: None,
            team_id: None,
            strategy,
            factory,
            signals,
            events,
            next_link: 1,
            local_media: None,
            outbound: None,
            peers: HashMap::new(),
            early_candidates: HashMap::new(),
            remote_media,
        };
        (manager, events_rx)
    }

    pub fn with_meeting(mut self, meeting_id: MeetingId, team_id: TeamId) -> Self {
        self.meeting_id = Some(meeting_id);
        self.team_id = Some(team_id);
        self
    }

    pub fn local_id(&self) -> UserId {
        self.local_id
    }

    /// Registers the local stream and, in broadcast mode, sends the single
    /// shared offer for this session.
    pub async fn on_local_join(&mut self, media: MediaStream) -> Result<()> {
        self.local_media = Some(media.clone());

        if self.strategy == OfferStrategy::PerPeer {
            debug!("Per-peer offers: waiting for roster before offering");
            return Ok(());
        }
        if self.outbound.is_some() {
            warn!("Outbound offer already pending; ignoring repeated join");
            return Ok(());
        }

        let key = PeerKey::Outbound;
        let mut conn = PeerConnection::new(self.new_link(key).await?, Role::Initiator);
        let offer = match Self::start_offer(&conn, key, &media).await {
            Ok(offer) => offer,
            Err(e) => {
                conn.close(key).await;
                return Err(e);
            }
        };
        conn.set_state(NegotiationState::OfferSent);
        self.outbound = Some(conn);

        info!("Broadcasting session offer from user {}", self.local_id);
        self.send(None, Signal::Offer { offer })
    }

    /// Per-peer mode: opens an initiating connection towards every newly
    /// seen participant whose id is above ours.
    pub async fn on_peers_discovered(&mut self, ids: impl IntoIterator<Item = UserId>) {
        if self.strategy != OfferStrategy::PerPeer {
            return;
        }
        let Some(media) = self.local_media.clone() else {
            debug!("Local media not ready; deferring per-peer offers");
            return;
        };

        for id in ids {
            if id <= self.local_id || self.peers.contains_key(&id) {
                continue;
            }
            if let Err(e) = self.offer_to(id, &media).await {
                self.handle_failure(id, e).await;
            }
        }
    }

    async fn offer_to(&mut self, peer: UserId, media: &MediaStream) -> Result<()> {
        let key = PeerKey::User(peer);
        let mut conn = PeerConnection::new(self.new_link(key).await?, Role::Initiator);
        let offer = match Self::start_offer(&conn, key, media).await {
            Ok(offer) => offer,
            Err(e) => {
                conn.close(key).await;
                return Err(e);
            }
        };
        conn.set_state(NegotiationState::OfferSent);
        if let Some(early) = self.early_candidates.remove(&peer) {
            conn.queue_candidates(early);
        }
        self.peers.insert(peer, conn);

        info!("Sending offer to user {}", peer);
        self.send(Some(peer), Signal::Offer { offer })
    }

    async fn start_offer(
        conn: &PeerConnection<F::Link>,
        key: PeerKey,
        media: &MediaStream,
    ) -> Result<RTCSessionDescription> {
        conn.link()
            .attach_local_media(media)
            .await
            .map_err(|e| Error::negotiation(key, format!("addTrack: {}", e)))?;
        conn.link()
            .create_offer()
            .await
            .map_err(|e| Error::negotiation(key, format!("createOffer: {}", e)))
    }

    /// Dispatches one decoded envelope. Never fails: problems are logged and
    /// confined to the peer that caused them.
    pub async fn handle_envelope(&mut self, envelope: Envelope) {
        if !envelope.is_for(self.local_id) {
            debug!(
                "Ignoring {} from user {} (target {:?})",
                envelope.signal.kind(),
                envelope.user_id,
                envelope.target_user_id
            );
            return;
        }

        let from = envelope.user_id;
        let result = match envelope.signal {
            Signal::Offer { offer } => self.on_remote_offer(from, offer).await,
            Signal::Answer { answer } => self.on_remote_answer(from, answer).await,
            Signal::IceCandidate { candidate } => {
                self.on_remote_ice_candidate(from, candidate).await;
                Ok(())
            }
            Signal::Unknown => Err(Error::MalformedMessage(format!(
                "unknown signal type from user {}",
                from
            ))),
        };

        if let Err(e) = result {
            self.handle_failure(from, e).await;
        }
    }

    pub async fn on_remote_offer(&mut self, from: UserId, offer: RTCSessionDescription) -> Result<()> {
        if from == self.local_id {
            debug!("Ignoring our own offer echoed by the relay");
            return Ok(());
        }
        if let Some(existing) = self.peers.get(&from) {
            debug!(
                "Connection for user {} already exists ({}); ignoring offer",
                from,
                existing.state()
            );
            return Ok(());
        }

        let key = PeerKey::User(from);
        let mut conn = PeerConnection::new(self.new_link(key).await?, Role::Responder);
        conn.set_state(NegotiationState::OfferReceived);
        if let Some(early) = self.early_candidates.remove(&from) {
            conn.queue_candidates(early);
        }

        let answer = match self.accept_offer(&mut conn, key, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                conn.close(key).await;
                return Err(e);
            }
        };
        conn.set_state(NegotiationState::Answered);
        self.peers.insert(from, conn);

        info!("Answering offer from user {}", from);
        self.send(Some(from), Signal::Answer { answer })
    }

    async fn accept_offer(
        &self,
        conn: &mut PeerConnection<F::Link>,
        key: PeerKey,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription> {
        if let Some(media) = &self.local_media {
            conn.link()
                .attach_local_media(media)
                .await
                .map_err(|e| Error::negotiation(key, format!("addTrack: {}", e)))?;
        }
        conn.apply_remote_description(key, offer).await?;
        conn.link()
            .create_answer()
            .await
            .map_err(|e| Error::negotiation(key, format!("createAnswer: {}", e)))
    }

    pub async fn on_remote_answer(&mut self, from: UserId, answer: RTCSessionDescription) -> Result<()> {
        let key = PeerKey::User(from);

        if let Some(conn) = self.peers.get_mut(&from) {
            if conn.role() != Role::Initiator || conn.state() != NegotiationState::OfferSent {
                warn!(
                    "Unexpected answer from user {} while {} ({:?}); discarding",
                    from,
                    conn.state(),
                    conn.role()
                );
                return Ok(());
            }
            conn.apply_remote_description(key, answer).await?;
            conn.set_state(NegotiationState::Answered);
            info!("Answer from user {} applied", from);
            return Ok(());
        }

        let Some(mut conn) = self.outbound.take() else {
            warn!("Answer from user {} has no matching connection; discarding", from);
            return Ok(());
        };

        if let Some(early) = self.early_candidates.remove(&from) {
            conn.queue_candidates(early);
        }
        if let Err(e) = conn.apply_remote_description(key, answer).await {
            conn.close(key).await;
            return Err(e);
        }
        conn.set_state(NegotiationState::Answered);
        info!("Session offer answered by user {}", from);
        self.peers.insert(from, conn);
        Ok(())
    }

    /// Applies the candidate, or holds it until the connection for `from`
    /// exists and has its remote description.
    pub async fn on_remote_ice_candidate(&mut self, from: UserId, candidate: RTCIceCandidateInit) {
        match self.peers.get_mut(&from) {
            Some(conn) => conn.add_or_queue_candidate(PeerKey::User(from), candidate).await,
            None => {
                debug!("Holding ICE candidate from user {} until its connection exists", from);
                self.early_candidates.entry(from).or_default().push(candidate);
            }
        }
    }

    /// Publishes (or replaces) the media handle for `from`. Tracks of the
    /// same stream are merged; a new stream replaces the old handle.
    pub fn on_track_received(&mut self, from: UserId, track: RemoteTrack) {
        self.remote_media.send_modify(|media| match media.get_mut(&from) {
            Some(handle) if handle.stream_id == track.stream_id => {
                match handle.tracks.iter_mut().find(|t| t.id == track.id) {
                    Some(existing) => *existing = track,
                    None => handle.tracks.push(track),
                }
            }
            _ => {
                media.insert(
                    from,
                    RemoteMediaHandle {
                        user_id: from,
                        stream_id: track.stream_id.clone(),
                        tracks: vec![track],
                    },
                );
            }
        });
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let Some(owner) = self.owner_of(event.link) else {
            debug!("Event for retired link {} dropped", event.link);
            return;
        };

        match (owner, event.kind) {
            (owner, LinkEventKind::LocalCandidate(candidate)) => {
                let target = match owner {
                    Owner::Peer(id) => Some(id),
                    Owner::Outbound => None,
                };
                if let Err(e) = self.send(target, Signal::IceCandidate { candidate }) {
                    warn!("Failed to send local ICE candidate: {}", e);
                }
            }
            (Owner::Peer(id), LinkEventKind::Track(track)) => self.on_track_received(id, track),
            (Owner::Outbound, LinkEventKind::Track(track)) => {
                warn!("Track {} arrived before the session offer was answered", track.id);
            }
            (Owner::Peer(id), LinkEventKind::State(state)) => self.on_link_state(id, state).await,
            (Owner::Outbound, LinkEventKind::State(LinkState::Failed)) => {
                warn!("Outbound connection failed before it was answered");
                if let Some(mut conn) = self.outbound.take() {
                    conn.close(PeerKey::Outbound).await;
                }
            }
            (Owner::Outbound, LinkEventKind::State(state)) => {
                debug!("Outbound connection is {:?}", state);
            }
        }
    }

    async fn on_link_state(&mut self, id: UserId, state: LinkState) {
        match state {
            LinkState::Connected => {
                if let Some(conn) = self.peers.get_mut(&id) {
                    conn.set_state(NegotiationState::Connected);
                    info!("Connected to user {}", id);
                }
            }
            LinkState::Failed => {
                self.handle_failure(id, Error::negotiation(PeerKey::User(id), "connection failed"))
                    .await;
            }
            LinkState::Disconnected => warn!("Connection to user {} interrupted", id),
            LinkState::Connecting | LinkState::Closed => {
                debug!("Connection to user {} is {:?}", id, state);
            }
        }
    }

    /// Forgets one peer: closes its connection and withdraws its media.
    pub async fn on_peer_left(&mut self, user: UserId) {
        self.early_candidates.remove(&user);
        if let Some(mut conn) = self.peers.remove(&user) {
            conn.close(PeerKey::User(user)).await;
            info!("Closed connection to departed user {}", user);
        }
        self.remote_media.send_if_modified(|media| media.remove(&user).is_some());
    }

    pub async fn close_all(&mut self) {
        if let Some(mut conn) = self.outbound.take() {
            conn.close(PeerKey::Outbound).await;
        }
        for (id, mut conn) in self.peers.drain() {
            conn.close(PeerKey::User(id)).await;
        }
        self.early_candidates.clear();
        self.remote_media.send_replace(RemoteMediaMap::new());
        info!("All peer connections closed");
    }

    async fn handle_failure(&mut self, from: UserId, error: Error) {
        match error {
            Error::Negotiation { .. } => {
                warn!("{}; abandoning that peer", error);
                if let Some(mut conn) = self.peers.remove(&from) {
                    conn.set_state(NegotiationState::Failed);
                    conn.close(PeerKey::User(from)).await;
                }
                self.early_candidates.remove(&from);
                self.remote_media.send_if_modified(|media| media.remove(&from).is_some());
            }
            other => warn!("Signal from user {} not handled: {}", from, other),
        }
    }

    async fn new_link(&mut self, key: PeerKey) -> Result<F::Link> {
        let id = self.next_link;
        self.next_link += 1;
        self.factory
            .create(id, self.events.clone())
            .await
            .map_err(|e| Error::negotiation(key, format!("create connection: {}", e)))
    }

    fn owner_of(&self, link: LinkId) -> Option<Owner> {
        if self.outbound.as_ref().map(|c| c.link_id()) == Some(link) {
            return Some(Owner::Outbound);
        }
        self.peers
            .iter()
            .find(|(_, conn)| conn.link_id() == link)
            .map(|(id, _)| Owner::Peer(*id))
    }

    fn send(&self, target: Option<UserId>, signal: Signal) -> Result<()> {
        self.signals.send(Envelope {
            user_id: self.local_id,
            target_user_id: target,
            meeting_id: self.meeting_id,
            team_id: self.team_id,
            signal,
        })
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        let mut summaries: Vec<PeerSummary> = self
            .peers
            .iter()
            .map(|(id, conn)| PeerSummary {
                user_id: *id,
                link_id: conn.link_id(),
                role: conn.role(),
                state: conn.state(),
                queued_candidates: conn.pending_candidates(),
            })
            .collect();
        summaries.sort_by_key(|s| s.user_id);
        summaries
    }

    pub fn peer_state(&self, user: UserId) -> Option<NegotiationState> {
        self.peers.get(&user).map(|c| c.state())
    }

    pub fn has_pending_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn outbound_link(&self) -> Option<LinkId> {
        self.outbound.as_ref().map(|c| c.link_id())
    }

    /// Tracked connections, including an unanswered outbound one.
    pub fn connection_count(&self) -> usize {
        self.peers.len() + usize::from(self.outbound.is_some())
    }

    pub fn early_candidate_count(&self, user: UserId) -> usize {
        self.early_candidates.get(&user).map_or(0, Vec::len)
    }

    pub fn remote_media(&self) -> RemoteMediaMap {
        self.remote_media.borrow().clone()
    }

    pub fn subscribe_media(&self) -> watch::Receiver<RemoteMediaMap> {
        self.remote_media.subscribe()
    }
}
