//! Continuous local audio recording cut into uploadable segments.
//!
//! `Idle -> Recording -> Finalizing -> Recording` (or back to `Idle` when
//! the source has ended). Retrieval holds the controller lock for the whole
//! stop/restart cycle, so two retrievals never interleave on one capturer.

use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, MutexGuard};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{Error, RecorderError, Result};
use crate::media::{AudioFrame, MediaStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingFormat {
    /// Mono 16-bit little-endian PCM.
    Pcm16,
}

impl RecordingFormat {
    pub fn from_mime(mime: &str) -> std::result::Result<Self, RecorderError> {
        let base = mime.split(';').next().unwrap_or_default().trim();
        match base.to_ascii_lowercase().as_str() {
            "audio/pcm" | "audio/l16" => Ok(RecordingFormat::Pcm16),
            _ => Err(RecorderError::UnsupportedFormat(mime.to_string())),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            RecordingFormat::Pcm16 => "audio/pcm",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub captured_at: Instant,
}

#[derive(Debug)]
pub enum CaptureEvent {
    Chunk(Chunk),
    Failed(String),
}

/// One running capture. The event channel closes after the final chunk
/// once `stop` has been signalled.
pub struct CaptureHandle {
    events: mpsc::UnboundedReceiver<CaptureEvent>,
    stop: Option<oneshot::Sender<()>>,
}

impl CaptureHandle {
    pub fn new(events: mpsc::UnboundedReceiver<CaptureEvent>, stop: oneshot::Sender<()>) -> Self {
        Self {
            events,
            stop: Some(stop),
        }
    }
}

/// The device side of the recorder.
pub trait Capturer: Send + Sync {
    fn supports(&self, format: RecordingFormat) -> bool;
    fn open(
        &self,
        stream: &MediaStream,
        format: RecordingFormat,
    ) -> std::result::Result<CaptureHandle, RecorderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderPhase {
    Idle,
    Recording,
    Finalizing,
}

/// A finalized span of recorded audio.
#[derive(Debug, Clone)]
pub struct Segment {
    pub data: Vec<u8>,
    pub format: RecordingFormat,
    pub chunk_count: usize,
    pub started_at: Option<Instant>,
    pub first_chunk_at: Option<Instant>,
}

impl Segment {
    pub fn empty(format: RecordingFormat) -> Self {
        Self {
            data: Vec::new(),
            format,
            chunk_count: 0,
            started_at: None,
            first_chunk_at: None,
        }
    }

    fn from_chunks(format: RecordingFormat, started_at: Instant, chunks: &[Chunk]) -> Self {
        let data = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
        Self {
            data,
            format,
            chunk_count: chunks.len(),
            started_at: Some(started_at),
            first_chunk_at: chunks.first().map(|c| c.captured_at),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Zero-length segments mean "nothing to upload".
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    pub fn to_wav(&self, sample_rate: u32) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| Error::Other(anyhow::anyhow!("WAV header: {}", e)))?;
        for pair in self.data.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| Error::Other(anyhow::anyhow!("WAV sample: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| Error::Other(anyhow::anyhow!("WAV finalize: {}", e)))?;
        Ok(cursor.into_inner())
    }
}

struct RecordingSession {
    handle: CaptureHandle,
    chunks: Vec<Chunk>,
    started_at: Instant,
    failure: Option<String>,
}

impl RecordingSession {
    fn new(handle: CaptureHandle) -> Self {
        Self {
            handle,
            chunks: Vec::new(),
            started_at: Instant::now(),
            failure: None,
        }
    }

    fn absorb(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Chunk(chunk) if chunk.data.is_empty() => {
                debug!("Received an empty chunk");
            }
            CaptureEvent::Chunk(chunk) => self.chunks.push(chunk),
            CaptureEvent::Failed(reason) => {
                error!("Capture device failed mid-recording: {}", reason);
                self.failure = Some(reason);
            }
        }
    }

    fn drain_ready(&mut self) {
        while let Ok(event) = self.handle.events.try_recv() {
            self.absorb(event);
        }
    }

    /// Stops the capturer and waits for its final chunk.
    async fn finish(mut self) -> Self {
        if let Some(stop) = self.handle.stop.take() {
            let _ = stop.send(());
        }
        while let Some(event) = self.handle.events.recv().await {
            self.absorb(event);
        }
        self
    }
}

struct Inner {
    capturer: Arc<dyn Capturer>,
    mime_type: String,
    format: RecordingFormat,
    source: Option<MediaStream>,
    session: Option<RecordingSession>,
    last_error: Option<String>,
}

#[derive(Clone)]
pub struct RecordingController {
    inner: Arc<Mutex<Inner>>,
    phase: Arc<watch::Sender<RecorderPhase>>,
}

impl RecordingController {
    pub fn new(capturer: Arc<dyn Capturer>, mime_type: &str) -> Self {
        let (phase, _) = watch::channel(RecorderPhase::Idle);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                capturer,
                mime_type: mime_type.to_string(),
                format: RecordingFormat::Pcm16,
                source: None,
                session: None,
                last_error: None,
            })),
            phase: Arc::new(phase),
        }
    }

    pub async fn start(&self, stream: MediaStream) -> std::result::Result<(), RecorderError> {
        let mut inner = self.inner.lock().await;
        let format = RecordingFormat::from_mime(&inner.mime_type)?;
        if !inner.capturer.supports(format) {
            return Err(RecorderError::UnsupportedFormat(inner.mime_type.clone()));
        }
        if !stream.audio_tracks().any(|t| t.is_live()) {
            return Err(RecorderError::NotStarted);
        }
        if inner.session.is_some() {
            warn!("Recorder already running; start ignored");
            return Ok(());
        }

        let handle = inner.capturer.open(&stream, format)?;
        inner.format = format;
        inner.session = Some(RecordingSession::new(handle));
        inner.source = Some(stream);
        inner.last_error = None;
        self.phase.send_replace(RecorderPhase::Recording);
        info!("Recording started ({})", format.mime_type());
        Ok(())
    }

    /// Closes out the current segment and immediately records a new one if
    /// the source is still live. Waits for any retrieval already running.
    pub async fn retrieve(&self) -> std::result::Result<Segment, RecorderError> {
        let inner = self.inner.lock().await;
        self.retrieve_locked(inner).await
    }

    /// Like [`retrieve`](Self::retrieve) but refuses instead of waiting.
    pub async fn try_retrieve(&self) -> std::result::Result<Segment, RecorderError> {
        let inner = self.inner.try_lock().map_err(|_| RecorderError::Busy)?;
        self.retrieve_locked(inner).await
    }

    async fn retrieve_locked(
        &self,
        mut inner: MutexGuard<'_, Inner>,
    ) -> std::result::Result<Segment, RecorderError> {
        let format = inner.format;
        let Some(session) = inner.session.take() else {
            debug!("Retrieve requested while not recording");
            return Ok(Segment::empty(format));
        };

        self.phase.send_replace(RecorderPhase::Finalizing);
        let session = session.finish().await;
        let segment = Segment::from_chunks(format, session.started_at, &session.chunks);
        info!(
            "Segment finalized: {} bytes in {} chunks",
            segment.len(),
            segment.chunk_count
        );
        let failure = session.failure;
        self.restart_locked(&mut inner);
        if let Some(reason) = &failure {
            inner.last_error.get_or_insert_with(|| reason.clone());
        }

        match failure {
            Some(reason) if segment.is_empty() => Err(RecorderError::Device(reason)),
            _ => Ok(segment),
        }
    }

    fn restart_locked(&self, inner: &mut Inner) {
        let live = inner.source.as_ref().filter(|s| s.is_live()).cloned();
        let Some(source) = live else {
            debug!("Audio source ended; recorder going idle");
            inner.source = None;
            self.phase.send_replace(RecorderPhase::Idle);
            return;
        };

        match inner.capturer.open(&source, inner.format) {
            Ok(handle) => {
                inner.session = Some(RecordingSession::new(handle));
                inner.last_error = None;
                self.phase.send_replace(RecorderPhase::Recording);
                debug!("Recording restarted");
            }
            Err(e) => {
                error!("Failed to restart recording: {}", e);
                inner.last_error = Some(e.to_string());
                inner.source = None;
                self.phase.send_replace(RecorderPhase::Idle);
            }
        }
    }

    /// Everything captured so far in the open segment, without stopping.
    pub async fn snapshot(&self) -> Segment {
        let mut inner = self.inner.lock().await;
        let format = inner.format;
        match inner.session.as_mut() {
            Some(session) => {
                session.drain_ready();
                Segment::from_chunks(format, session.started_at, &session.chunks)
            }
            None => Segment::empty(format),
        }
    }

    /// Stops for good and returns the last segment. Used on leave.
    pub async fn finish(&self) -> Segment {
        let mut inner = self.inner.lock().await;
        let format = inner.format;
        inner.source = None;
        let segment = match inner.session.take() {
            Some(session) => {
                let session = session.finish().await;
                Segment::from_chunks(format, session.started_at, &session.chunks)
            }
            None => Segment::empty(format),
        };
        self.phase.send_replace(RecorderPhase::Idle);
        info!("Recording finished with {} bytes outstanding", segment.len());
        segment
    }

    pub fn phase(&self) -> RecorderPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecorderPhase> {
        self.phase.subscribe()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.last_error.clone()
    }
}

/// Slices microphone PCM from the stream's first audio track into chunks
/// every `timeslice`, flushing the remainder on stop.
pub struct PcmCapturer {
    timeslice: Duration,
}

impl PcmCapturer {
    pub fn new(timeslice: Duration) -> Self {
        Self { timeslice }
    }
}

impl Capturer for PcmCapturer {
    fn supports(&self, format: RecordingFormat) -> bool {
        matches!(format, RecordingFormat::Pcm16)
    }

    fn open(
        &self,
        stream: &MediaStream,
        _format: RecordingFormat,
    ) -> std::result::Result<CaptureHandle, RecorderError> {
        let track = stream
            .audio_tracks()
            .next()
            .cloned()
            .ok_or_else(|| RecorderError::Device("no audio track".to_string()))?;
        let mut frames = track
            .subscribe_frames()
            .ok_or_else(|| RecorderError::Device("audio track carries no PCM".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let timeslice = self.timeslice;

        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            let mut first_at: Option<Instant> = None;
            let mut ticker = interval(timeslice);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = track.ended() => break,
                    _ = ticker.tick() => flush(&tx, &mut buffer, &mut first_at),
                    frame = frames.recv() => match frame {
                        Ok(frame) => append(&mut buffer, &mut first_at, &frame),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Recorder lagged behind the microphone, {} frames lost", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = tx.send(CaptureEvent::Failed("audio source closed".to_string()));
                            break;
                        }
                    },
                }
            }
            // Frames already queued belong to this segment.
            while let Ok(frame) = frames.try_recv() {
                append(&mut buffer, &mut first_at, &frame);
            }
            flush(&tx, &mut buffer, &mut first_at);
        });

        Ok(CaptureHandle::new(rx, stop_tx))
    }
}

fn append(buffer: &mut Vec<u8>, first_at: &mut Option<Instant>, frame: &AudioFrame) {
    first_at.get_or_insert(frame.captured_at);
    for sample in frame.samples.iter() {
        buffer.extend_from_slice(&sample.to_le_bytes());
    }
}

fn flush(
    tx: &mpsc::UnboundedSender<CaptureEvent>,
    buffer: &mut Vec<u8>,
    first_at: &mut Option<Instant>,
) {
    if buffer.is_empty() {
        return;
    }
    let chunk = Chunk {
        data: std::mem::take(buffer),
        captured_at: first_at.take().unwrap_or_else(Instant::now),
    };
    let _ = tx.send(CaptureEvent::Chunk(chunk));
}
