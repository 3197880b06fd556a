#![allow(dead_code)]

use async_trait::async_trait;
use meeting_rtc::connection::{LinkEventSender, LinkFactory, LinkId, PeerLink};
use meeting_rtc::error::{Error, RecorderError, Result};
use meeting_rtc::media::{LocalTrack, MediaStream};
use meeting_rtc::presence::PresencePublisher;
use meeting_rtc::recorder::{CaptureEvent, CaptureHandle, Capturer, Chunk, RecordingFormat};
use meeting_rtc::signaling::{Envelope, MeetingId, Signal, SignalChannel, SignalSink, UserId};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Notify};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub fn description(kind: &str, sdp: &str) -> RTCSessionDescription {
    serde_json::from_value(json!({ "type": kind, "sdp": sdp })).unwrap()
}

pub fn candidate(text: &str) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: text.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn envelope(from: UserId, target: Option<UserId>, signal: Signal) -> Envelope {
    Envelope {
        user_id: from,
        target_user_id: target,
        meeting_id: Some(7),
        team_id: Some(3),
        signal,
    }
}

pub fn local_stream(id: &str) -> MediaStream {
    MediaStream::new(id, vec![LocalTrack::audio(&format!("{}-mic", id), id)])
}

/// What the manager did to one link.
#[derive(Debug, Clone, Default)]
pub struct LinkLog {
    pub attached: Vec<String>,
    pub offers: usize,
    pub answers: usize,
    pub remote: Vec<RTCSessionDescription>,
    pub candidates: Vec<String>,
    pub closed: bool,
}

#[derive(Clone, Default)]
pub struct FakeFactory {
    logs: Arc<Mutex<HashMap<LinkId, Arc<Mutex<LinkLog>>>>>,
    fail_next_remote: Arc<AtomicBool>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self, link: LinkId) -> LinkLog {
        let logs = self.logs.lock().unwrap();
        let log = logs.get(&link).expect("no such link");
        let snapshot = log.lock().unwrap().clone();
        snapshot
    }

    pub fn created(&self) -> usize {
        self.logs.lock().unwrap().len()
    }

    /// The next link created will reject its remote description.
    pub fn fail_next_remote(&self) {
        self.fail_next_remote.store(true, Ordering::SeqCst);
    }
}

pub struct FakeLink {
    id: LinkId,
    log: Arc<Mutex<LinkLog>>,
    fail_remote: bool,
}

#[async_trait]
impl LinkFactory for FakeFactory {
    type Link = FakeLink;

    async fn create(&self, id: LinkId, _events: LinkEventSender) -> Result<FakeLink> {
        let log = Arc::new(Mutex::new(LinkLog::default()));
        self.logs.lock().unwrap().insert(id, log.clone());
        Ok(FakeLink {
            id,
            log,
            fail_remote: self.fail_next_remote.swap(false, Ordering::SeqCst),
        })
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    fn id(&self) -> LinkId {
        self.id
    }

    async fn attach_local_media(&self, media: &MediaStream) -> Result<()> {
        self.log.lock().unwrap().attached.push(media.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.log.lock().unwrap().offers += 1;
        Ok(description("offer", &format!("offer-from-link-{}", self.id)))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.log.lock().unwrap().answers += 1;
        Ok(description("answer", &format!("answer-from-link-{}", self.id)))
    }

    async fn set_remote_description(&self, description: RTCSessionDescription) -> Result<()> {
        if self.fail_remote {
            return Err(Error::Other(anyhow::anyhow!("rejected remote description")));
        }
        self.log.lock().unwrap().remote.push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.log.lock().unwrap().candidates.push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.log.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Signal sink that keeps everything the manager sends.
#[derive(Default)]
pub struct CapturingSink {
    sent: Mutex<Vec<Envelope>>,
    closed: AtomicBool,
}

impl CapturingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SignalSink for CapturingSink {
    fn send(&self, envelope: Envelope) -> Result<()> {
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }
}

impl SignalChannel for CapturingSink {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Presence publications, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Enter(UserId, MeetingId),
    Leave(UserId, MeetingId),
    Close,
}

#[derive(Default)]
pub struct FakePresence {
    notices: Mutex<Vec<Notice>>,
}

impl FakePresence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

impl PresencePublisher for FakePresence {
    fn enter(&self, user: UserId, meeting: MeetingId) -> Result<()> {
        self.notices.lock().unwrap().push(Notice::Enter(user, meeting));
        Ok(())
    }

    fn leave(&self, user: UserId, meeting: MeetingId) -> Result<()> {
        self.notices.lock().unwrap().push(Notice::Leave(user, meeting));
        Ok(())
    }

    fn close(&self) {
        self.notices.lock().unwrap().push(Notice::Close);
    }
}

type Current = Arc<Mutex<Option<(u64, mpsc::UnboundedSender<CaptureEvent>)>>>;

/// Capturer whose chunks are pushed by the test. Stopping closes the
/// current capture, optionally only after `gate` is notified.
#[derive(Default)]
pub struct FakeCapturer {
    current: Current,
    generation: AtomicU64,
    opens: AtomicUsize,
    gate: Option<Arc<Notify>>,
    unsupported: bool,
}

impl FakeCapturer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    pub fn unsupported() -> Arc<Self> {
        Arc::new(Self {
            unsupported: true,
            ..Self::default()
        })
    }

    pub fn push(&self, len: usize) -> bool {
        let chunk = Chunk {
            data: vec![0xAB; len],
            captured_at: Instant::now(),
        };
        match self.current.lock().unwrap().as_ref() {
            Some((_, tx)) => tx.send(CaptureEvent::Chunk(chunk)).is_ok(),
            None => false,
        }
    }

    pub fn fail(&self, reason: &str) -> bool {
        match self.current.lock().unwrap().as_ref() {
            Some((_, tx)) => tx.send(CaptureEvent::Failed(reason.to_string())).is_ok(),
            None => false,
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Capturer for FakeCapturer {
    fn supports(&self, _format: RecordingFormat) -> bool {
        !self.unsupported
    }

    fn open(
        &self,
        _stream: &MediaStream,
        _format: RecordingFormat,
    ) -> std::result::Result<CaptureHandle, RecorderError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap() = Some((generation, tx));
        self.opens.fetch_add(1, Ordering::SeqCst);

        let current = self.current.clone();
        let gate = self.gate.clone();
        tokio::spawn(async move {
            let _ = stop_rx.await;
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let mut current = current.lock().unwrap();
            if current.as_ref().map(|(g, _)| *g) == Some(generation) {
                *current = None;
            }
        });

        Ok(CaptureHandle::new(rx, stop_tx))
    }
}
