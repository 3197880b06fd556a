use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{Error, Result};

pub type UserId = i64;
pub type MeetingId = i64;
pub type TeamId = i64;

/// First frame sent on a fresh signaling connection; it carries no `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub user_id: UserId,
    pub meeting_id: MeetingId,
    pub team_id: TeamId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    Offer { offer: RTCSessionDescription },
    Answer { answer: RTCSessionDescription },
    IceCandidate { candidate: RTCIceCandidateInit },
    #[serde(other)]
    Unknown,
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "OFFER",
            Signal::Answer { .. } => "ANSWER",
            Signal::IceCandidate { .. } => "ICE_CANDIDATE",
            Signal::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meeting_id: Option<MeetingId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<TeamId>,
    #[serde(flatten)]
    pub signal: Signal,
}

impl Envelope {
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| Error::MalformedMessage(e.to_string()))?;
        if let Signal::Unknown = envelope.signal {
            return Err(Error::MalformedMessage(format!(
                "unknown signal type from user {}",
                envelope.user_id
            )));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Whether this envelope is meant for `local`: it is not our own echo and
    /// it is either untargeted or addressed to us.
    pub fn is_for(&self, local: UserId) -> bool {
        self.user_id != local && self.target_user_id.map_or(true, |t| t == local)
    }
}

/// Outgoing half of the signaling channel, as seen by the peer manager.
pub trait SignalSink: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<()>;
}

/// A sink the session can also hang up.
pub trait SignalChannel: SignalSink {
    fn close(&self);
}

#[derive(Debug)]
pub enum TransportEvent {
    Message(Envelope),
    /// Fallback for payloads that did not decode; the channel stays open.
    Malformed { raw: String, reason: String },
    /// Terminal. Reconnection belongs to whoever owns the transport.
    Disconnected(String),
}

pub struct SignalingTransport {
    tx: mpsc::UnboundedSender<Message>,
}

impl SignalingTransport {
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let (ws_stream, _) = connect_async(url).await?;
        info!("Signaling channel connected to {}", url);
        let (mut write, mut read) = ws_stream.split();

        let (events_tx, events_rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("Signaling write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Handle incoming messages
        tokio::spawn(async move {
            let reason = loop {
                let text = match read.next().await {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            let event = TransportEvent::Malformed {
                                raw: String::from_utf8_lossy(e.as_bytes()).into_owned(),
                                reason: "binary frame is not UTF-8".to_string(),
                            };
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by relay: {}", f.reason))
                            .unwrap_or_else(|| "closed by relay".to_string());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                };

                let event = match Envelope::decode(&text) {
                    Ok(envelope) => {
                        debug!(
                            "Signal {} received from user {}",
                            envelope.signal.kind(),
                            envelope.user_id
                        );
                        TransportEvent::Message(envelope)
                    }
                    Err(e) => TransportEvent::Malformed {
                        raw: text,
                        reason: e.to_string(),
                    },
                };
                if events_tx.send(event).await.is_err() {
                    return;
                }
            };
            info!("Signaling channel disconnected: {}", reason);
            let _ = events_tx.send(TransportEvent::Disconnected(reason)).await;
        });

        Ok((Self { tx: outgoing_tx }, events_rx))
    }

    pub fn send_join(&self, join: &JoinRequest) -> Result<()> {
        let json = serde_json::to_string(join)?;
        self.push(Message::Text(json))
    }

    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }

    fn push(&self, msg: Message) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|e| Error::Transport(format!("Failed to send message: {}", e)))
    }
}

impl SignalSink for SignalingTransport {
    fn send(&self, envelope: Envelope) -> Result<()> {
        let json = envelope.encode()?;
        self.push(Message::Text(json))
    }
}

impl SignalChannel for SignalingTransport {
    fn close(&self) {
        SignalingTransport::close(self);
    }
}
