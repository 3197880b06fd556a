//! A single participant's meeting: signaling, presence, local media, peer
//! connections and the recorder, driven from one event loop.

use std::future::pending;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{LinkEvent, LinkFactory};
use crate::error::{Error, RecorderError, Result};
use crate::media::{LocalMedia, MediaConstraints};
use crate::peers::{PeerConnectionManager, RemoteMediaMap};
use crate::presence::{PresenceChannel, PresenceEvent, PresencePublisher};
use crate::recorder::{Capturer, PcmCapturer, RecordingController};
use crate::roster::{Participant, Roster};
use crate::signaling::{
    JoinRequest, MeetingId, SignalChannel, SignalSink, SignalingTransport, TeamId,
    TransportEvent, UserId,
};
use crate::webrtc::RtcLinkFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub meeting_id: MeetingId,
    pub team_id: TeamId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Leave,
}

/// Cloneable view of a running session for the UI side.
#[derive(Clone)]
pub struct SessionHandle {
    identity: Identity,
    commands: mpsc::UnboundedSender<SessionCommand>,
    recorder: Option<RecordingController>,
    roster: watch::Receiver<Vec<Participant>>,
    remote_media: watch::Receiver<RemoteMediaMap>,
}

impl SessionHandle {
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Asks the session to leave. Returns false if it already ended.
    pub fn leave(&self) -> bool {
        self.commands.send(SessionCommand::Leave).is_ok()
    }

    /// `None` when recording could not start; bots are unavailable then.
    pub fn recorder(&self) -> Option<&RecordingController> {
        self.recorder.as_ref()
    }

    pub fn roster(&self) -> Vec<Participant> {
        self.roster.borrow().clone()
    }

    pub fn subscribe_roster(&self) -> watch::Receiver<Vec<Participant>> {
        self.roster.clone()
    }

    pub fn subscribe_media(&self) -> watch::Receiver<RemoteMediaMap> {
        self.remote_media.clone()
    }
}

struct SessionCore<F: LinkFactory, S: SignalChannel> {
    identity: Identity,
    config: Config,
    signaling: Arc<S>,
    presence: Option<Arc<dyn PresencePublisher>>,
    manager: PeerConnectionManager<F>,
    recorder: Option<RecordingController>,
    roster: Roster,
    roster_tx: watch::Sender<Vec<Participant>>,
    media: LocalMedia,
}

struct Channels {
    signaling: mpsc::Receiver<TransportEvent>,
    presence: Option<mpsc::Receiver<PresenceEvent>>,
    links: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

/// Everything a session runs on once the channels are open.
pub struct SessionParts<F, S> {
    pub identity: Identity,
    pub config: Config,
    pub factory: F,
    pub signaling: Arc<S>,
    pub signaling_events: mpsc::Receiver<TransportEvent>,
    /// `None` when presence could not be reached; the roster stays empty.
    pub presence: Option<(Arc<dyn PresencePublisher>, mpsc::Receiver<PresenceEvent>)>,
    pub media: LocalMedia,
    pub capturer: Arc<dyn Capturer>,
}

pub struct MeetingSession<F: LinkFactory = RtcLinkFactory, S: SignalChannel = SignalingTransport> {
    core: SessionCore<F, S>,
    channels: Channels,
}

impl MeetingSession {
    /// Acquires media, connects both channels, starts recording and sends
    /// the local offer. Media or signaling failures abort the join.
    pub async fn join(config: Config, identity: Identity) -> Result<(Self, SessionHandle)> {
        info!(
            "Joining meeting {} (team {}) as user {}",
            identity.meeting_id, identity.team_id, identity.user_id
        );
        let media = LocalMedia::acquire(&MediaConstraints::from(&config.media)).await?;

        let (signaling, signaling_events) =
            SignalingTransport::connect(&config.endpoints.signaling).await?;
        signaling.send_join(&JoinRequest {
            user_id: identity.user_id,
            meeting_id: identity.meeting_id,
            team_id: identity.team_id,
        })?;

        let factory = RtcLinkFactory::new(&config.webrtc)?;

        let presence = match PresenceChannel::connect(&config.endpoints.presence).await {
            Ok((channel, events)) => {
                let channel: Arc<dyn PresencePublisher> = Arc::new(channel);
                Some((channel, events))
            }
            Err(e) => {
                warn!("Presence unavailable, roster will stay empty: {}", e);
                None
            }
        };

        let capturer = Arc::new(PcmCapturer::new(config.recording.timeslice()));
        Ok(Self::assemble(SessionParts {
            identity,
            config,
            factory,
            signaling: Arc::new(signaling),
            signaling_events,
            presence,
            media,
            capturer,
        })
        .await)
    }
}

impl<F, S> MeetingSession<F, S>
where
    F: LinkFactory,
    S: SignalChannel + 'static,
{
    /// Wires already-open channels into a session: starts recording,
    /// announces presence and sends the local offer. Nothing here fails the
    /// session; each step degrades on its own.
    pub async fn assemble(parts: SessionParts<F, S>) -> (Self, SessionHandle) {
        let SessionParts {
            identity,
            config,
            factory,
            signaling,
            signaling_events,
            presence,
            media,
            capturer,
        } = parts;

        let sink: Arc<dyn SignalSink> = signaling.clone();
        let (manager, links) = PeerConnectionManager::new(
            identity.user_id,
            config.webrtc.offer_strategy,
            factory,
            sink,
        );
        let mut manager = manager.with_meeting(identity.meeting_id, identity.team_id);

        let recorder = start_recorder(capturer, &config, &media).await;

        let (presence, presence_events) = match presence {
            Some((publisher, events)) => {
                if let Err(e) = publisher.enter(identity.user_id, identity.meeting_id) {
                    warn!("Failed to announce presence: {}", e);
                }
                (Some(publisher), Some(events))
            }
            None => (None, None),
        };

        if let Err(e) = manager.on_local_join(media.full().clone()).await {
            warn!("Local offer failed; waiting for remote offers instead: {}", e);
        }

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (roster_tx, roster_rx) = watch::channel(Vec::new());
        let handle = SessionHandle {
            identity,
            commands: commands_tx,
            recorder: recorder.clone(),
            roster: roster_rx,
            remote_media: manager.subscribe_media(),
        };

        let session = Self {
            core: SessionCore {
                identity,
                config,
                signaling,
                presence,
                manager,
                recorder,
                roster: Roster::new(),
                roster_tx,
                media,
            },
            channels: Channels {
                signaling: signaling_events,
                presence: presence_events,
                links,
                commands,
            },
        };
        (session, handle)
    }

    /// Runs until a leave command or the loss of the signaling channel.
    /// Cleanup happens either way; a lost channel is reported afterwards.
    pub async fn run(self) -> Result<()> {
        let MeetingSession {
            mut core,
            mut channels,
        } = self;

        let outcome = loop {
            tokio::select! {
                Some(command) = channels.commands.recv() => match command {
                    SessionCommand::Leave => break Ok(()),
                },
                event = channels.signaling.recv() => match event {
                    Some(TransportEvent::Message(envelope)) => {
                        core.manager.handle_envelope(envelope).await;
                    }
                    Some(TransportEvent::Malformed { raw, reason }) => {
                        warn!("Dropping malformed signaling message ({}): {}", reason, raw);
                    }
                    Some(TransportEvent::Disconnected(reason)) => {
                        break Err(Error::Transport(reason));
                    }
                    None => break Err(Error::Transport("signaling channel dropped".to_string())),
                },
                Some(event) = channels.links.recv() => core.manager.handle_link_event(event).await,
                event = next_presence(&mut channels.presence), if channels.presence.is_some() => {
                    match event {
                        Some(PresenceEvent::Roster(list)) => core.on_roster(list).await,
                        Some(PresenceEvent::Left(user)) => core.on_left(user).await,
                        Some(PresenceEvent::Disconnected(reason)) => {
                            warn!("Presence lost ({}); roster is frozen", reason);
                            channels.presence = None;
                        }
                        None => channels.presence = None,
                    }
                }
            }
        };

        core.leave().await;
        if let Err(e) = &outcome {
            error!("Session ended: {}", e);
        }
        outcome
    }
}

async fn next_presence(events: &mut Option<mpsc::Receiver<PresenceEvent>>) -> Option<PresenceEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn start_recorder(
    capturer: Arc<dyn Capturer>,
    config: &Config,
    media: &LocalMedia,
) -> Option<RecordingController> {
    let recorder = RecordingController::new(capturer, &config.recording.mime_type);
    match recorder.start(media.audio_only()).await {
        Ok(()) => Some(recorder),
        Err(RecorderError::UnsupportedFormat(mime)) => {
            warn!("Recording format {} unsupported; bots are unavailable", mime);
            None
        }
        Err(e) => {
            warn!("Recording unavailable; bots are unavailable: {}", e);
            None
        }
    }
}

impl<F: LinkFactory, S: SignalChannel> SessionCore<F, S> {
    async fn on_roster(&mut self, list: Vec<Participant>) {
        let joined = self.roster.apply_presence_update(list);
        self.publish_roster();

        let local = self.identity.user_id;
        let others: Vec<UserId> = joined.into_iter().filter(|id| *id != local).collect();
        if !others.is_empty() {
            debug!("New participants: {:?}", others);
            self.manager.on_peers_discovered(others).await;
        }
    }

    async fn on_left(&mut self, user: UserId) {
        if user == self.identity.user_id {
            return;
        }
        if self.roster.apply_leave(user).is_some() {
            self.publish_roster();
        }
        info!("User {} left the meeting", user);
        self.manager.on_peer_left(user).await;
    }

    fn publish_roster(&self) {
        self.roster_tx
            .send_replace(self.roster.participants().to_vec());
    }

    async fn leave(&mut self) {
        let Identity {
            user_id,
            meeting_id,
            ..
        } = self.identity;
        info!("Leaving meeting {}", meeting_id);

        if let Some(presence) = &self.presence {
            if let Err(e) = presence.leave(user_id, meeting_id) {
                warn!("Failed to publish leave: {}", e);
            }
        }
        if self.roster.apply_leave(user_id).is_some() {
            self.publish_roster();
        }

        if let Some(recorder) = &self.recorder {
            let limit = self.config.recording.leave_flush_timeout();
            match timeout(limit, recorder.finish()).await {
                Ok(segment) => debug!("Final segment held {} bytes", segment.len()),
                Err(_) => warn!("Recorder did not finish within {:?}; final segment lost", limit),
            }
        }

        self.manager.close_all().await;
        if let Some(presence) = self.presence.take() {
            presence.close();
        }
        self.signaling.close();
        self.media.release();
        info!("Left meeting {}", meeting_id);
    }
}
