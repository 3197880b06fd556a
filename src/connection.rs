use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{Error, PeerKey, Result};
use crate::media::{MediaKind, MediaStream};

pub type LinkId = u64;

/// Negotiation progress of one peer connection. Ordered: everything at or
/// past `Answered` has both descriptions in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NegotiationState {
    New,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::New => write!(f, "New"),
            NegotiationState::OfferSent => write!(f, "OfferSent"),
            NegotiationState::OfferReceived => write!(f, "OfferReceived"),
            NegotiationState::Answered => write!(f, "Answered"),
            NegotiationState::Connected => write!(f, "Connected"),
            NegotiationState::Failed => write!(f, "Failed"),
            NegotiationState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

/// Transport-level state reported by a link, reduced to what negotiation
/// cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            _ => LinkState::Connecting,
        }
    }
}

/// A remote track as surfaced by a link's track event.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub track: Option<std::sync::Arc<webrtc::track::track_remote::TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    LocalCandidate(RTCIceCandidateInit),
    Track(RemoteTrack),
    State(LinkState),
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub link: LinkId,
    pub kind: LinkEventKind,
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// One realtime media connection. `create_offer` and `create_answer` also
/// install the result as the local description.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn id(&self) -> LinkId;
    async fn attach_local_media(&self, media: &MediaStream) -> Result<()>;
    async fn create_offer(&self) -> Result<RTCSessionDescription>;
    async fn create_answer(&self) -> Result<RTCSessionDescription>;
    async fn set_remote_description(&self, description: RTCSessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    type Link: PeerLink;

    /// Builds a link whose callbacks report into `events`, tagged with `id`.
    async fn create(&self, id: LinkId, events: LinkEventSender) -> Result<Self::Link>;
}

/// Per-peer record owned by the peer manager.
pub struct PeerConnection<L> {
    link: L,
    role: Role,
    state: NegotiationState,
    remote_description_set: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

impl<L: PeerLink> PeerConnection<L> {
    pub fn new(link: L, role: Role) -> Self {
        Self {
            link,
            role,
            state: NegotiationState::New,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_id(&self) -> LinkId {
        self.link.id()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn set_state(&mut self, state: NegotiationState) {
        self.state = state;
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Applies the candidate now if the remote description is in place,
    /// otherwise keeps it until it is.
    pub async fn add_or_queue_candidate(&mut self, key: PeerKey, candidate: RTCIceCandidateInit) {
        if !self.remote_description_set {
            debug!("Queueing ICE candidate for {} until remote description is set", key);
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(e) = self.link.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate for {}: {}", key, e);
        }
    }

    pub fn queue_candidates(&mut self, candidates: impl IntoIterator<Item = RTCIceCandidateInit>) {
        self.pending_candidates.extend(candidates);
    }

    /// Sets the remote description and flushes every queued candidate once.
    pub async fn apply_remote_description(
        &mut self,
        key: PeerKey,
        description: RTCSessionDescription,
    ) -> Result<usize> {
        self.link
            .set_remote_description(description)
            .await
            .map_err(|e| Error::negotiation(key, format!("setRemoteDescription: {}", e)))?;
        self.remote_description_set = true;

        let queued = mem::take(&mut self.pending_candidates);
        let flushed = queued.len();
        for candidate in queued {
            if let Err(e) = self.link.add_ice_candidate(candidate).await {
                warn!("Failed to add queued ICE candidate for {}: {}", key, e);
            }
        }
        if flushed > 0 {
            debug!("Flushed {} queued ICE candidates for {}", flushed, key);
        }
        Ok(flushed)
    }

    pub async fn close(&mut self, key: PeerKey) {
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
        if let Err(e) = self.link.close().await {
            warn!("Failed to close connection for {}: {}", key, e);
        }
    }
}
