use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::WebRtcConfig;
use crate::connection::{
    LinkEvent, LinkEventKind, LinkEventSender, LinkFactory, LinkId, LinkState, PeerLink,
    RemoteTrack,
};
use crate::error::Result;
use crate::media::MediaStream;

/// Builds webrtc-rs peer connections sharing one API instance.
pub struct RtcLinkFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcLinkFactory {
    pub fn new(settings: &WebRtcConfig) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: settings.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl LinkFactory for RtcLinkFactory {
    type Link = RtcLink;

    async fn create(&self, id: LinkId, events: LinkEventSender) -> Result<RtcLink> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        let tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("Link {} finished gathering ICE candidates", id);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(LinkEvent {
                            link: id,
                            kind: LinkEventKind::LocalCandidate(init),
                        });
                    }
                    Err(e) => warn!("Link {} produced an unserializable candidate: {}", id, e),
                }
            })
        }));

        let tx = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let remote = RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind: track.kind().into(),
                        track: Some(track),
                    };
                    debug!("Link {} received remote track {:?}", id, remote);
                    let _ = tx.send(LinkEvent {
                        link: id,
                        kind: LinkEventKind::Track(remote),
                    });
                })
            },
        ));

        let tx = events;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    info!("Peer Connection State of link {} has changed: {}", id, s);
                    let _ = tx.send(LinkEvent {
                        link: id,
                        kind: LinkEventKind::State(LinkState::from(s)),
                    });
                })
            },
        ));

        Ok(RtcLink {
            id,
            peer_connection,
        })
    }
}

pub struct RtcLink {
    id: LinkId,
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcLink {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    fn id(&self) -> LinkId {
        self.id
    }

    async fn attach_local_media(&self, media: &MediaStream) -> Result<()> {
        for track in media.tracks() {
            self.peer_connection
                .add_track(track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        Ok(answer)
    }

    async fn set_remote_description(&self, description: RTCSessionDescription) -> Result<()> {
        self.peer_connection.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.peer_connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}
