//! Presence pub/sub over STOMP: roster broadcasts and leave notices.

pub mod frame;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub use frame::Frame;

use crate::error::{Error, Result};
use crate::roster::Participant;
use crate::signaling::{MeetingId, UserId};

pub const PARTICIPANTS_TOPIC: &str = "/topic/meeting/participants";
pub const LEAVE_TOPIC: &str = "/topic/meeting/leave";
pub const ENTER_DESTINATION: &str = "/api/v1/meeting/enter";
pub const LEAVE_DESTINATION: &str = "/api/v1/meeting/leave";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Roster(Vec<Participant>),
    Left(UserId),
    Disconnected(String),
}

/// Body of both the enter and the leave publication.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceNotice {
    user_id: UserId,
    meeting_id: MeetingId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeftNotice {
    user_id: UserId,
}

/// Turns a broker MESSAGE frame into a presence event. `None` for frames
/// on destinations we do not follow.
pub fn interpret(frame: &Frame) -> Option<Result<PresenceEvent>> {
    let event = match frame.get("destination")? {
        PARTICIPANTS_TOPIC => serde_json::from_str::<Vec<Participant>>(&frame.body)
            .map(PresenceEvent::Roster),
        LEAVE_TOPIC => serde_json::from_str::<LeftNotice>(&frame.body)
            .map(|notice| PresenceEvent::Left(notice.user_id)),
        _ => return None,
    };
    Some(event.map_err(|e| Error::MalformedMessage(format!("presence body: {}", e))))
}

async fn await_connected(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Result<()> {
    while let Some(msg) = ws.next().await {
        let Message::Text(text) = msg? else {
            continue;
        };
        match Frame::decode(&text)? {
            Some(frame) if frame.command == "CONNECTED" => {
                debug!("Presence broker speaks STOMP {:?}", frame.get("version"));
                return Ok(());
            }
            Some(frame) if frame.command == "ERROR" => {
                return Err(Error::Transport(format!(
                    "presence broker refused connection: {}",
                    frame.get("message").unwrap_or(frame.body.as_str())
                )));
            }
            _ => continue,
        }
    }
    Err(Error::Transport(
        "presence broker closed during handshake".to_string(),
    ))
}

/// The publishing half of presence, as used by the session.
pub trait PresencePublisher: Send + Sync {
    fn enter(&self, user: UserId, meeting: MeetingId) -> Result<()>;
    fn leave(&self, user: UserId, meeting: MeetingId) -> Result<()>;
    fn close(&self);
}

pub struct PresenceChannel {
    tx: mpsc::UnboundedSender<Message>,
}

impl PresenceChannel {
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<PresenceEvent>)> {
        let (mut ws_stream, _) = connect_async(url).await?;

        let connect = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", "/")
            .header("heart-beat", "0,0");
        ws_stream.send(Message::Text(connect.encode())).await?;

        timeout(HANDSHAKE_TIMEOUT, await_connected(&mut ws_stream))
            .await
            .map_err(|_| Error::Transport("presence handshake timed out".to_string()))??;
        info!("Presence channel connected to {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (events_tx, events_rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("Presence write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let reason = loop {
                let text = match read.next().await {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) => break "closed by broker".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                };
                let frame = match Frame::decode(&text) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Dropping undecodable presence frame: {}", e);
                        continue;
                    }
                };
                match frame.command.as_str() {
                    "MESSAGE" => match interpret(&frame) {
                        Some(Ok(event)) => {
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => warn!("Dropping presence message: {}", e),
                        None => debug!("Ignoring message on {:?}", frame.get("destination")),
                    },
                    "ERROR" => warn!(
                        "Presence broker error: {}",
                        frame.get("message").unwrap_or(frame.body.as_str())
                    ),
                    other => debug!("Ignoring {} frame", other),
                }
            };
            info!("Presence channel disconnected: {}", reason);
            let _ = events_tx.send(PresenceEvent::Disconnected(reason)).await;
        });

        let channel = Self { tx: outgoing_tx };
        channel.push(
            Frame::new("SUBSCRIBE")
                .header("id", "sub-0")
                .header("destination", PARTICIPANTS_TOPIC),
        )?;
        channel.push(
            Frame::new("SUBSCRIBE")
                .header("id", "sub-1")
                .header("destination", LEAVE_TOPIC),
        )?;
        Ok((channel, events_rx))
    }

    fn publish(&self, destination: &str, user: UserId, meeting: MeetingId) -> Result<()> {
        let notice = PresenceNotice {
            user_id: user,
            meeting_id: meeting,
        };
        self.push(
            Frame::new("SEND")
                .header("destination", destination)
                .header("content-type", "application/json")
                .body(serde_json::to_string(&notice)?),
        )
    }

    fn push(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(Message::Text(frame.encode()))
            .map_err(|e| Error::Transport(format!("presence channel closed: {}", e)))
    }
}

impl PresencePublisher for PresenceChannel {
    fn enter(&self, user: UserId, meeting: MeetingId) -> Result<()> {
        self.publish(ENTER_DESTINATION, user, meeting)
    }

    fn leave(&self, user: UserId, meeting: MeetingId) -> Result<()> {
        self.publish(LEAVE_DESTINATION, user, meeting)
    }

    fn close(&self) {
        let _ = self.push(Frame::new("DISCONNECT"));
        let _ = self.tx.send(Message::Close(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(destination: &str, body: &str) -> Frame {
        Frame::new("MESSAGE")
            .header("destination", destination)
            .body(body)
    }

    #[test]
    fn roster_broadcast_becomes_roster_event() {
        let frame = message(
            PARTICIPANTS_TOPIC,
            r#"[{"userId":1,"nickname":"kim","role":"LEADER"},{"userId":2,"nickname":"lee"}]"#,
        );
        match interpret(&frame) {
            Some(Ok(PresenceEvent::Roster(list))) => {
                assert_eq!(list.len(), 2);
                assert_eq!(list[1].role, "");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn leave_notice_becomes_left_event() {
        let frame = message(LEAVE_TOPIC, r#"{"userId":5,"meetingId":9}"#);
        assert_eq!(interpret(&frame).unwrap().unwrap(), PresenceEvent::Left(5));
    }

    #[test]
    fn bad_bodies_are_malformed_and_other_topics_ignored() {
        let frame = message(PARTICIPANTS_TOPIC, "not json");
        assert!(matches!(
            interpret(&frame),
            Some(Err(Error::MalformedMessage(_)))
        ));
        assert!(interpret(&message("/topic/other", "{}")).is_none());
    }

    #[test]
    fn presence_notice_wire_shape() {
        let notice = PresenceNotice {
            user_id: 4,
            meeting_id: 11,
        };
        assert_eq!(
            serde_json::to_string(&notice).unwrap(),
            r#"{"userId":4,"meetingId":11}"#
        );
    }
}
