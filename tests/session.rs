//! A whole session over in-memory channels, on paused time so the leave
//! timeout elapses without real waiting.

mod common;

use common::{
    description, envelope, local_stream, CapturingSink, FakeCapturer, FakeFactory, FakePresence,
    Notice,
};
use meeting_rtc::config::{Config, OfferStrategy};
use meeting_rtc::media::{LocalMedia, MediaStream};
use meeting_rtc::presence::{PresenceEvent, PresencePublisher};
use meeting_rtc::recorder::RecorderPhase;
use meeting_rtc::roster::Participant;
use meeting_rtc::session::{Identity, MeetingSession, SessionHandle, SessionParts};
use meeting_rtc::signaling::{Signal, TransportEvent};
use meeting_rtc::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, Instant};

const LOCAL: i64 = 1;
const FLUSH: Duration = Duration::from_millis(500);

struct Rig {
    session: MeetingSession<FakeFactory, CapturingSink>,
    handle: SessionHandle,
    factory: FakeFactory,
    sink: Arc<CapturingSink>,
    presence: Arc<FakePresence>,
    signals: mpsc::Sender<TransportEvent>,
    notices: mpsc::Sender<PresenceEvent>,
    stream: MediaStream,
}

async fn rig(capturer: Arc<FakeCapturer>, strategy: OfferStrategy) -> Rig {
    let mut config = Config::default();
    config.webrtc.offer_strategy = strategy;
    config.recording.leave_flush_timeout_ms = FLUSH.as_millis() as u64;

    let factory = FakeFactory::new();
    let sink = CapturingSink::new();
    let presence = FakePresence::new();
    let (signals, signaling_events) = mpsc::channel(16);
    let (notices, presence_events) = mpsc::channel(16);
    let stream = local_stream("local");
    let publisher: Arc<dyn PresencePublisher> = presence.clone();

    let (session, handle) = MeetingSession::assemble(SessionParts {
        identity: Identity {
            user_id: LOCAL,
            meeting_id: 7,
            team_id: 3,
        },
        config,
        factory: factory.clone(),
        signaling: sink.clone(),
        signaling_events,
        presence: Some((publisher, presence_events)),
        media: LocalMedia::from_stream(stream.clone()),
        capturer,
    })
    .await;

    Rig {
        session,
        handle,
        factory,
        sink,
        presence,
        signals,
        notices,
        stream,
    }
}

fn participants(ids: &[i64]) -> Vec<Participant> {
    ids.iter()
        .map(|id| Participant {
            user_id: *id,
            nickname: format!("user-{}", id),
            role: "MEMBER".to_string(),
        })
        .collect()
}

/// Lets the session drain whatever was just sent to it.
async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn leave_is_bounded_while_a_retrieval_hangs() {
    tokio::time::pause();
    let gate = Arc::new(Notify::new());
    let capturer = FakeCapturer::gated(gate.clone());
    let rig = rig(capturer.clone(), OfferStrategy::Broadcast).await;
    assert_eq!(rig.presence.notices(), vec![Notice::Enter(LOCAL, 7)]);
    assert_eq!(rig.factory.created(), 1);

    let recorder = rig.handle.recorder().unwrap().clone();
    capturer.push(12);
    let mut phase = recorder.subscribe();
    let hung = tokio::spawn({
        let recorder = recorder.clone();
        async move { recorder.retrieve().await }
    });
    phase
        .wait_for(|p| *p == RecorderPhase::Finalizing)
        .await
        .unwrap();

    assert!(rig.handle.leave());
    let began = Instant::now();
    rig.session.run().await.unwrap();

    assert!(began.elapsed() >= FLUSH);
    assert!(!hung.is_finished());
    assert!(rig.factory.log(1).closed);
    assert!(rig.sink.is_closed());
    assert!(!rig.stream.is_live());
    assert_eq!(
        rig.presence.notices(),
        vec![Notice::Enter(LOCAL, 7), Notice::Leave(LOCAL, 7), Notice::Close]
    );
    assert!(!rig.handle.leave());

    gate.notify_one();
    assert_eq!(hung.await.unwrap().unwrap().len(), 12);
}

#[tokio::test]
async fn signaling_loss_ends_the_session_after_cleanup() {
    tokio::time::pause();
    let rig = rig(FakeCapturer::new(), OfferStrategy::Broadcast).await;
    let recorder = rig.handle.recorder().unwrap().clone();

    rig.signals
        .send(TransportEvent::Disconnected("relay gone".to_string()))
        .await
        .unwrap();
    let outcome = rig.session.run().await;

    assert!(matches!(outcome, Err(Error::Transport(reason)) if reason == "relay gone"));
    assert!(rig.factory.log(1).closed);
    assert!(rig.sink.is_closed());
    assert!(!rig.stream.is_live());
    assert_eq!(recorder.phase(), RecorderPhase::Idle);
    assert_eq!(rig.presence.notices().last(), Some(&Notice::Close));
}

#[tokio::test]
async fn presence_loss_freezes_the_roster_but_not_the_session() {
    tokio::time::pause();
    let Rig {
        session,
        handle,
        factory,
        sink,
        signals,
        notices,
        ..
    } = rig(FakeCapturer::new(), OfferStrategy::PerPeer).await;
    assert_eq!(factory.created(), 0);

    let driver = async {
        let mut roster = handle.subscribe_roster();
        notices
            .send(PresenceEvent::Roster(participants(&[LOCAL, 2, 3])))
            .await
            .unwrap();
        roster.wait_for(|list| list.len() == 3).await.unwrap();
        settle().await;

        let offers: Vec<_> = sink
            .sent()
            .iter()
            .filter(|e| matches!(e.signal, Signal::Offer { .. }))
            .map(|e| e.target_user_id)
            .collect();
        assert_eq!(offers, vec![Some(2), Some(3)]);

        notices
            .send(PresenceEvent::Disconnected("broker restarted".to_string()))
            .await
            .unwrap();
        settle().await;
        assert!(notices
            .send(PresenceEvent::Roster(participants(&[LOCAL])))
            .await
            .is_err());

        signals
            .send(TransportEvent::Message(envelope(
                2,
                Some(LOCAL),
                Signal::Answer {
                    answer: description("answer", "answer-2"),
                },
            )))
            .await
            .unwrap();
        settle().await;
        assert_eq!(factory.log(1).remote.len(), 1);
        assert!(!sink.is_closed());

        assert!(handle.leave());
    };

    let (outcome, ()) = tokio::join!(session.run(), driver);
    outcome.unwrap();

    let remaining: Vec<_> = handle.roster().iter().map(|p| p.user_id).collect();
    assert_eq!(remaining, vec![2, 3]);
    assert!(factory.log(1).closed);
    assert!(factory.log(2).closed);
}
