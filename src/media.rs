use anyhow::Context;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::MediaConfig;
use crate::error::{Error, Result};

const FRAME_CHANNEL_CAPACITY: usize = 256;
const OPUS_FRAME: Duration = Duration::from_millis(20);
const OPUS_MAX_PACKET: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for MediaKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        }
    }
}

/// A block of mono 16-bit PCM as delivered by the microphone.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Arc<[i16]>,
    pub captured_at: Instant,
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    rtp: Arc<TrackLocalStaticSample>,
    ended: watch::Sender<bool>,
    frames: Option<broadcast::Sender<AudioFrame>>,
}

/// A local capture track. Clones share the same underlying source.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn audio(id: &str, stream_id: &str) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self::build(id, stream_id, MediaKind::Audio, MIME_TYPE_OPUS, Some(frames))
    }

    pub fn video(id: &str, stream_id: &str) -> Self {
        Self::build(id, stream_id, MediaKind::Video, MIME_TYPE_VP8, None)
    }

    fn build(
        id: &str,
        stream_id: &str,
        kind: MediaKind,
        mime_type: &str,
        frames: Option<broadcast::Sender<AudioFrame>>,
    ) -> Self {
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        ));
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: id.to_owned(),
                kind,
                rtp,
                ended,
                frames,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtp)
    }

    pub fn is_live(&self) -> bool {
        !*self.inner.ended.borrow()
    }

    pub fn stop(&self) {
        if self.inner.ended.send_replace(true) {
            return;
        }
        debug!("Local {:?} track {} ended", self.inner.kind, self.inner.id);
    }

    /// Resolves once the track has been stopped.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn subscribe_frames(&self) -> Option<broadcast::Receiver<AudioFrame>> {
        self.inner.frames.as_ref().map(|tx| tx.subscribe())
    }

    /// Publishes PCM to every reader of this track. Returns how many readers
    /// received it; ended tracks and video tracks drop the frame.
    pub fn push_frame(&self, samples: Vec<i16>) -> usize {
        if !self.is_live() {
            return 0;
        }
        match &self.inner.frames {
            Some(tx) => tx
                .send(AudioFrame {
                    samples: samples.into(),
                    captured_at: Instant::now(),
                })
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Writes an already encoded sample to the outbound RTP track.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        self.inner.rtp.write_sample(sample).await?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

/// A logical grouping of local tracks. Deriving a stream never touches the
/// tracks of the stream it came from.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Video)
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(LocalTrack::is_live)
    }

    pub fn audio_only(&self) -> MediaStream {
        MediaStream {
            id: format!("{}-audio", self.id),
            tracks: self.audio_tracks().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub sample_rate: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            sample_rate: 48_000,
            width: 1280,
            height: 720,
        }
    }
}

impl From<&MediaConfig> for MediaConstraints {
    fn from(config: &MediaConfig) -> Self {
        Self {
            audio: true,
            video: config.video,
            sample_rate: config.sample_rate,
            width: config.width,
            height: config.height,
        }
    }
}

/// The session's local capture. Owns the microphone thread; peer links and
/// the recorder only ever see clones of its stream.
pub struct LocalMedia {
    stream: MediaStream,
    constraints: MediaConstraints,
    mic: Option<MicCapture>,
}

impl LocalMedia {
    pub async fn acquire(constraints: &MediaConstraints) -> Result<Self> {
        if !constraints.audio && !constraints.video {
            return Err(Error::MediaAcquisition(
                "neither audio nor video requested".to_string(),
            ));
        }

        let stream_id = format!("meeting-{}", rand::random::<u32>());
        let mut tracks = Vec::new();
        let mut mic = None;

        if constraints.audio {
            let audio = LocalTrack::audio(&format!("{}-mic", stream_id), &stream_id);
            mic = Some(MicCapture::start(audio.clone(), constraints.sample_rate).await?);
            spawn_opus_encoder(audio.clone(), constraints.sample_rate)?;
            tracks.push(audio);
        }

        if constraints.video {
            info!(
                "Video track requested at {}x{}; frames are supplied by the embedder",
                constraints.width, constraints.height
            );
            tracks.push(LocalTrack::video(&format!("{}-cam", stream_id), &stream_id));
        }

        Ok(Self {
            stream: MediaStream::new(stream_id, tracks),
            constraints: constraints.clone(),
            mic,
        })
    }

    /// Wraps tracks the embedder captures itself. Nothing is opened here;
    /// `release` still ends the tracks.
    pub fn from_stream(stream: MediaStream) -> Self {
        let constraints = MediaConstraints {
            audio: stream.audio_tracks().next().is_some(),
            video: stream.video_tracks().next().is_some(),
            ..MediaConstraints::default()
        };
        Self {
            stream,
            constraints,
            mic: None,
        }
    }

    pub fn full(&self) -> &MediaStream {
        &self.stream
    }

    pub fn audio_only(&self) -> MediaStream {
        self.stream.audio_only()
    }

    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    pub fn release(&mut self) {
        for track in self.stream.tracks() {
            track.stop();
        }
        if let Some(mut mic) = self.mic.take() {
            mic.stop();
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}

/// Keeps the cpal stream on its own thread; cpal streams are not `Send` on
/// every host.
struct MicCapture {
    stop: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicCapture {
    async fn start(track: LocalTrack, sample_rate: u32) -> Result<Self> {
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<String, String>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(track, sample_rate) {
                    Ok((stream, device)) => {
                        let _ = ready_tx.send(Ok(device));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("{:#}", e)));
                        return;
                    }
                };
                // Blocks until stopped or the owner is gone.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Microphone stream dropped");
            })
            .map_err(|e| Error::MediaAcquisition(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(device)) => {
                info!("Microphone capture started on {} at {} Hz", device, sample_rate);
                Ok(Self {
                    stop: Some(stop_tx),
                    thread: Some(handle),
                })
            }
            Ok(Err(reason)) => Err(Error::MediaAcquisition(reason)),
            Err(_) => Err(Error::MediaAcquisition(
                "capture thread exited before reporting".to_string(),
            )),
        }
    }

    fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Microphone capture thread panicked");
            }
        }
    }
}

fn open_input_stream(track: LocalTrack, sample_rate: u32) -> anyhow::Result<(cpal::Stream, String)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .context("No input device available")?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |err| error!("An error occurred on the input audio stream: {}", err);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let samples: Vec<i16> = data
                    .iter()
                    .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                    .collect();
                track.push_frame(samples);
            },
            err_fn,
            None,
        )
        .context("Failed to open microphone (permission denied or device busy)")?;
    stream.play().context("Failed to start microphone stream")?;

    Ok((stream, name))
}

/// Encodes microphone PCM into 20 ms opus packets on the outbound track.
fn spawn_opus_encoder(track: LocalTrack, sample_rate: u32) -> Result<()> {
    let mut encoder = opus::Encoder::new(sample_rate, opus::Channels::Mono, opus::Application::Voip)
        .map_err(|e| Error::MediaAcquisition(format!("opus encoder: {}", e)))?;
    let Some(mut frames) = track.subscribe_frames() else {
        return Ok(());
    };
    let frame_len = (sample_rate as usize * OPUS_FRAME.as_millis() as usize) / 1000;

    tokio::spawn(async move {
        let mut pending: Vec<i16> = Vec::with_capacity(frame_len * 2);
        loop {
            let frame = tokio::select! {
                frame = frames.recv() => frame,
                _ = track.ended() => break,
            };
            match frame {
                Ok(frame) => pending.extend_from_slice(&frame.samples),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Opus encoder lagged, {} frames skipped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }

            while pending.len() >= frame_len {
                let chunk: Vec<i16> = pending.drain(..frame_len).collect();
                let packet = match encoder.encode_vec(&chunk, OPUS_MAX_PACKET) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("Failed to encode audio frame: {}", e);
                        continue;
                    }
                };
                let sample = Sample {
                    data: packet.into(),
                    duration: OPUS_FRAME,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    warn!("Failed to write audio sample: {}", e);
                }
            }
        }
        debug!("Opus encoder for track {} stopped", track.id());
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> MediaStream {
        MediaStream::new(
            "s1",
            vec![LocalTrack::audio("mic", "s1"), LocalTrack::video("cam", "s1")],
        )
    }

    #[test]
    fn audio_only_copies_audio_tracks() {
        let full = stream();
        let audio = full.audio_only();
        assert_eq!(audio.tracks().len(), 1);
        assert_eq!(audio.tracks()[0].kind(), MediaKind::Audio);
        assert_ne!(audio.id(), full.id());
        assert_eq!(full.tracks().len(), 2);
    }

    #[test]
    fn derived_stream_shares_liveness() {
        let full = stream();
        let audio = full.audio_only();
        assert!(audio.is_live());
        for track in full.tracks() {
            track.stop();
        }
        assert!(!audio.is_live());
        assert!(!full.is_live());
    }

    #[tokio::test]
    async fn frames_reach_subscribers_until_stopped() {
        let track = LocalTrack::audio("mic", "s1");
        let mut rx = track.subscribe_frames().unwrap();
        assert_eq!(track.push_frame(vec![1, 2, 3]), 1);
        let frame = rx.recv().await.unwrap();
        assert_eq!(&*frame.samples, &[1, 2, 3]);

        track.stop();
        assert_eq!(track.push_frame(vec![4]), 0);
        track.ended().await;
    }

    #[test]
    fn video_tracks_carry_no_pcm() {
        let track = LocalTrack::video("cam", "s1");
        assert!(track.subscribe_frames().is_none());
        assert_eq!(track.push_frame(vec![1]), 0);
    }
}
