//! Two participants meet, connect and part, with the relay played by the
//! test: whatever one side sends is handed to the other.

mod common;

use common::{local_stream, CapturingSink, FakeFactory};
use meeting_rtc::config::OfferStrategy;
use meeting_rtc::connection::{LinkEvent, LinkEventKind, LinkState, NegotiationState, Role};
use meeting_rtc::peers::PeerConnectionManager;
use meeting_rtc::roster::{Participant, Roster};
use meeting_rtc::signaling::{Envelope, Signal, SignalSink};
use std::sync::Arc;

const A: i64 = 1;
const B: i64 = 2;

struct Side {
    manager: PeerConnectionManager<FakeFactory>,
    factory: FakeFactory,
    sink: Arc<CapturingSink>,
    roster: Roster,
}

fn side(id: i64) -> Side {
    let factory = FakeFactory::new();
    let sink = CapturingSink::new();
    let signals: Arc<dyn SignalSink> = sink.clone();
    let (manager, _events) =
        PeerConnectionManager::new(id, OfferStrategy::Broadcast, factory.clone(), signals);
    Side {
        manager: manager.with_meeting(10, 20),
        factory,
        sink,
        roster: Roster::new(),
    }
}

fn participant(id: i64, nickname: &str) -> Participant {
    Participant {
        user_id: id,
        nickname: nickname.to_string(),
        role: "MEMBER".to_string(),
    }
}

/// Delivers `from`'s outbox to `to` through the JSON wire form.
async fn relay(from: &Side, to: &mut Side) -> Vec<Envelope> {
    let sent = from.sink.take();
    for envelope in &sent {
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        to.manager.handle_envelope(decoded).await;
    }
    sent
}

#[tokio::test]
async fn two_participants_connect_and_part() {
    let mut a = side(A);
    let mut b = side(B);

    let joined = a.roster.apply_presence_update(vec![participant(A, "alice")]);
    assert_eq!(joined, vec![A]);
    a.manager.on_local_join(local_stream("stream-a")).await.unwrap();
    assert!(a.manager.has_pending_outbound());

    let update = vec![participant(A, "alice"), participant(B, "bob")];
    assert_eq!(a.roster.apply_presence_update(update.clone()), vec![B]);
    assert_eq!(b.roster.apply_presence_update(update), vec![A, B]);

    // A's offer reaches B, which answers it directly.
    let offers = relay(&a, &mut b).await;
    assert!(matches!(offers[0].signal, Signal::Offer { .. }));
    let b_view = b.manager.peers();
    assert_eq!(b_view.len(), 1);
    assert_eq!(b_view[0].user_id, A);
    assert_eq!(b_view[0].role, Role::Responder);

    let answers = relay(&b, &mut a).await;
    assert_eq!(answers[0].target_user_id, Some(A));
    assert_eq!(a.manager.peer_state(B), Some(NegotiationState::Answered));
    assert!(!a.manager.has_pending_outbound());

    let a_link = a.manager.peers()[0].link_id;
    let log = a.factory.log(a_link);
    assert_eq!(log.attached, vec!["stream-a".to_string()]);
    assert_eq!(log.remote.len(), 1);
    assert_eq!(log.remote[0].sdp, format!("answer-from-link-{}", b_view[0].link_id));

    a.manager
        .handle_link_event(LinkEvent {
            link: a_link,
            kind: LinkEventKind::State(LinkState::Connected),
        })
        .await;
    assert_eq!(a.manager.peer_state(B), Some(NegotiationState::Connected));

    // A leaves: presence tells B, A tears everything down.
    assert_eq!(b.roster.apply_leave(A).map(|p| p.user_id), Some(A));
    assert_eq!(b.roster.ids().collect::<Vec<_>>(), vec![B]);
    b.manager.on_peer_left(A).await;
    assert_eq!(b.manager.connection_count(), 0);

    a.manager.close_all().await;
    assert_eq!(a.manager.connection_count(), 0);
    assert!(a.factory.log(a_link).closed);
    assert!(b.factory.log(b_view[0].link_id).closed);
}

#[tokio::test]
async fn late_offer_from_an_already_connected_peer_is_ignored() {
    let mut a = side(A);
    let mut b = side(B);

    a.manager.on_local_join(local_stream("stream-a")).await.unwrap();
    relay(&a, &mut b).await;
    relay(&b, &mut a).await;
    assert_eq!(a.manager.connection_count(), 1);

    // B's own broadcast offer arrives after the pair is already bound.
    b.manager.on_local_join(local_stream("stream-b")).await.unwrap();
    relay(&b, &mut a).await;

    assert_eq!(a.manager.connection_count(), 1);
    assert_eq!(a.factory.created(), 1);
    assert!(a.sink.sent().is_empty());
}
