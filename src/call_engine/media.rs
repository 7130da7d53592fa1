//! Lokale Medien: Tracks, Geräte und Fehlerklassifikation
//!
//! Die Engine kennt nur die Traits [`MediaTrack`] und [`MediaDevices`].
//! Woher die Samples kommen (Mikrofon, Kamera, Testquelle), entscheidet
//! die jeweilige Implementierung.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

/// Sample Rate für Audio-Tracks (Opus)
pub const AUDIO_CLOCK_RATE: u32 = 48000;

/// RTP Clock Rate für Video-Tracks
pub const VIDEO_CLOCK_RATE: u32 = 90000;

const STREAM_ID: &str = "shopfloor-rtc";

// ============================================================================
// MEDIA KIND
// ============================================================================

/// Art des Anrufs bzw. eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission to use the device was denied: {0}")]
    PermissionDenied(String),

    #[error("No matching media device found: {0}")]
    NotFound(String),

    #[error("Media device is busy: {0}")]
    DeviceBusy(String),

    #[error("Requested media constraints cannot be satisfied: {0}")]
    ConstraintsUnsatisfiable(String),

    #[error("Media error: {0}")]
    Unknown(String),
}

impl MediaError {
    /// Ordnet eine Fehlermeldung des Backends einer Kategorie zu
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();

        let matches = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if matches(&["permission", "not allowed", "denied"]) {
            Self::PermissionDenied(message)
        } else if matches(&["not found", "no device", "no such device", "unavailable"]) {
            Self::NotFound(message)
        } else if matches(&["busy", "in use", "not readable"]) {
            Self::DeviceBusy(message)
        } else if matches(&["constraint", "unsupported", "overconstrained"]) {
            Self::ConstraintsUnsatisfiable(message)
        } else {
            Self::Unknown(message)
        }
    }
}

// ============================================================================
// TRACKS
// ============================================================================

/// Ein lokal erzeugter Medien-Track
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Gerät, von dem der Track stammt
    fn device_id(&self) -> Option<&str> {
        None
    }

    fn is_enabled(&self) -> bool;

    /// Deaktivierte Tracks senden keine Medien an die Gegenstelle
    fn set_enabled(&self, enabled: bool);

    /// Gibt das Gerät frei; danach ist der Track unbrauchbar
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// Track für die WebRTC Peer Connection, falls vorhanden
    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

/// Track auf Basis von [`TrackLocalStaticRTP`]
///
/// Die Anwendung schreibt RTP-Pakete über [`RtcTrack::write_rtp`] hinein.
/// Solange der Track deaktiviert oder gestoppt ist, werden sie verworfen.
pub struct RtcTrack {
    id: String,
    kind: MediaKind,
    device_id: Option<String>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    packets_sent: AtomicU64,
    rtp: Arc<TrackLocalStaticRTP>,
}

impl RtcTrack {
    pub fn new(kind: MediaKind, device_id: Option<String>) -> Self {
        let id = format!("{}-{}", kind, Uuid::new_v4());
        let codec = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
        };

        Self {
            rtp: Arc::new(TrackLocalStaticRTP::new(codec, id.clone(), STREAM_ID.to_string())),
            id,
            kind,
            device_id,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            packets_sent: AtomicU64::new(0),
        }
    }

    /// Schreibt ein RTP-Paket; `Ok(false)`, wenn es verworfen wurde
    pub async fn write_rtp(&self, packet: &Packet) -> Result<bool, webrtc::Error> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(false);
        }

        self.rtp.write_rtp(packet).await?;
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Anzahl der tatsächlich geschriebenen Pakete
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }
}

impl MediaTrack for RtcTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("Stopped {} track {}", self.kind, self.id);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(Arc::clone(&self.rtp) as Arc<dyn TrackLocal + Send + Sync>)
    }
}

impl fmt::Debug for RtcTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .field("packets_sent", &self.packets_sent())
            .finish()
    }
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Die lokal aufgenommenen Tracks eines Anrufs
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Audio)
    }

    pub fn video_track(&self) -> Option<&Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == MediaKind::Video)
    }

    pub fn has_video(&self) -> bool {
        self.video_track().is_some()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Ersetzt den Video-Track und gibt den alten zurück
    pub fn replace_video(&mut self, track: Arc<dyn MediaTrack>) -> Option<Arc<dyn MediaTrack>> {
        match self.tracks.iter().position(|t| t.kind() == MediaKind::Video) {
            Some(index) => Some(std::mem::replace(&mut self.tracks[index], track)),
            None => {
                self.tracks.push(track);
                None
            }
        }
    }
}

// ============================================================================
// DEVICES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: MediaKind,
}

/// Zugriff auf Aufnahmegeräte
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Öffnet Mikrofon (und bei [`MediaKind::Video`] zusätzlich eine Kamera)
    async fn acquire(&self, kind: MediaKind, camera: Option<&str>) -> Result<LocalMedia, MediaError>;

    async fn cameras(&self) -> Result<Vec<MediaDeviceInfo>, MediaError>;

    async fn open_camera(&self, device_id: &str) -> Result<Arc<dyn MediaTrack>, MediaError>;
}

/// Geräte-Backend, das reine RTP-Tracks liefert
///
/// Die Samples schreibt die Anwendung selbst in [`RtcTrack::write_rtp`]; Kameras
/// werden über [`RtpMediaDevices::with_camera`] bekannt gemacht.
#[derive(Debug, Default)]
pub struct RtpMediaDevices {
    cameras: Mutex<Vec<MediaDeviceInfo>>,
}

impl RtpMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(self, device_id: impl Into<String>, label: impl Into<String>) -> Self {
        self.cameras.lock().push(MediaDeviceInfo {
            device_id: device_id.into(),
            label: label.into(),
            kind: MediaKind::Video,
        });
        self
    }

    fn camera(&self, device_id: Option<&str>) -> Result<MediaDeviceInfo, MediaError> {
        let cameras = self.cameras.lock();
        let found = match device_id {
            Some(id) => cameras.iter().find(|c| c.device_id == id),
            None => cameras.first(),
        };
        found.cloned().ok_or_else(|| {
            MediaError::NotFound(device_id.unwrap_or("default camera").to_string())
        })
    }
}

#[async_trait]
impl MediaDevices for RtpMediaDevices {
    async fn acquire(&self, kind: MediaKind, camera: Option<&str>) -> Result<LocalMedia, MediaError> {
        let mut tracks: Vec<Arc<dyn MediaTrack>> = vec![Arc::new(RtcTrack::new(MediaKind::Audio, None))];

        if kind == MediaKind::Video {
            let camera = self.camera(camera)?;
            tracks.push(Arc::new(RtcTrack::new(MediaKind::Video, Some(camera.device_id))));
        }

        Ok(LocalMedia::new(tracks))
    }

    async fn cameras(&self) -> Result<Vec<MediaDeviceInfo>, MediaError> {
        Ok(self.cameras.lock().clone())
    }

    async fn open_camera(&self, device_id: &str) -> Result<Arc<dyn MediaTrack>, MediaError> {
        let camera = self.camera(Some(device_id))?;
        Ok(Arc::new(RtcTrack::new(MediaKind::Video, Some(camera.device_id))))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_media_errors() {
        assert!(matches!(
            MediaError::classify("Permission denied by user"),
            MediaError::PermissionDenied(_)
        ));
        assert!(matches!(
            MediaError::classify("The requested device is not found"),
            MediaError::NotFound(_)
        ));
        assert!(matches!(
            MediaError::classify("Device or resource busy"),
            MediaError::DeviceBusy(_)
        ));
        assert!(matches!(
            MediaError::classify("Unsupported stream configuration"),
            MediaError::ConstraintsUnsatisfiable(_)
        ));
        assert_eq!(
            MediaError::classify("backend exploded"),
            MediaError::Unknown("backend exploded".to_string())
        );
    }

    fn packet(sequence_number: u16) -> Packet {
        Packet {
            header: webrtc::rtp::header::Header {
                payload_type: 111,
                sequence_number,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_or_stopped_track_drops_packets() {
        let track = RtcTrack::new(MediaKind::Audio, None);
        assert!(track.write_rtp(&packet(1)).await.unwrap());
        assert_eq!(track.packets_sent(), 1);

        track.set_enabled(false);
        assert!(!track.write_rtp(&packet(2)).await.unwrap());
        assert_eq!(track.packets_sent(), 1);

        track.set_enabled(true);
        assert!(track.write_rtp(&packet(3)).await.unwrap());
        assert_eq!(track.packets_sent(), 2);

        track.stop();
        assert!(!track.write_rtp(&packet(4)).await.unwrap());
        assert_eq!(track.packets_sent(), 2);
    }

    #[test]
    fn test_replace_video_returns_previous_track() {
        let audio: Arc<dyn MediaTrack> = Arc::new(RtcTrack::new(MediaKind::Audio, None));
        let front: Arc<dyn MediaTrack> =
            Arc::new(RtcTrack::new(MediaKind::Video, Some("front".to_string())));
        let mut media = LocalMedia::new(vec![audio, Arc::clone(&front)]);

        let rear: Arc<dyn MediaTrack> =
            Arc::new(RtcTrack::new(MediaKind::Video, Some("rear".to_string())));
        let previous = media.replace_video(rear).unwrap();

        assert_eq!(previous.id(), front.id());
        assert_eq!(media.video_track().unwrap().device_id(), Some("rear"));
        assert_eq!(media.tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_rtp_devices_need_a_camera_for_video() {
        let devices = RtpMediaDevices::new();
        let audio = devices.acquire(MediaKind::Audio, None).await.unwrap();
        assert_eq!(audio.audio_tracks().count(), 1);
        assert!(!audio.has_video());

        assert!(matches!(
            devices.acquire(MediaKind::Video, None).await,
            Err(MediaError::NotFound(_))
        ));

        let devices = RtpMediaDevices::new().with_camera("cam-1", "Line camera");
        let video = devices.acquire(MediaKind::Video, None).await.unwrap();
        assert_eq!(video.video_track().unwrap().device_id(), Some("cam-1"));

        video.stop_all();
        assert!(video.tracks().iter().all(|t| t.is_stopped()));
    }
}
