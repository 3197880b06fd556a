use std::fmt;

use anyhow::Error as AnyhowError;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::signaling::UserId;

/// Which connection a negotiation failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKey {
    /// The shared outbound connection before any peer answered it.
    Outbound,
    User(UserId),
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKey::Outbound => write!(f, "outbound"),
            PeerKey::User(id) => write!(f, "user {}", id),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("unsupported recording format: {0}")]
    UnsupportedFormat(String),
    #[error("capture device failed: {0}")]
    Device(String),
    #[error("a segment retrieval is already in flight")]
    Busy,
    #[error("recorder has no live audio source")]
    NotStarted,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: PeerKey, reason: String },
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),
    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),
    #[error("malformed signaling message: {0}")]
    MalformedMessage(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),
    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Other error: {0}")]
    Other(#[from] AnyhowError),
}

impl Error {
    pub fn negotiation(peer: PeerKey, reason: impl fmt::Display) -> Self {
        Error::Negotiation {
            peer,
            reason: reason.to_string(),
        }
    }

    /// Everything except a failed media acquisition can be recovered from
    /// without tearing the session down.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::MediaAcquisition(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_media_acquisition_is_fatal() {
        assert!(!Error::MediaAcquisition("denied".into()).is_recoverable());
        assert!(Error::Transport("closed".into()).is_recoverable());
        assert!(Error::negotiation(PeerKey::User(3), "bad sdp").is_recoverable());
        assert!(Error::from(RecorderError::Busy).is_recoverable());
    }

    #[test]
    fn negotiation_error_names_the_peer() {
        let err = Error::negotiation(PeerKey::User(42), "setRemoteDescription failed");
        assert_eq!(
            err.to_string(),
            "negotiation with user 42 failed: setRemoteDescription failed"
        );
        let err = Error::negotiation(PeerKey::Outbound, "createOffer failed");
        assert!(err.to_string().contains("outbound"));
    }
}
