//! Mikrofon-Capture über cpal (Feature `audio`)
//!
//! [`SystemMediaDevices`] öffnet das Standard-Mikrofon und liefert einen
//! Audio-Track, dessen PCM-Frames über [`CapturedAudioTrack::read_frame`]
//! abgeholt werden. Kameras werden wie bei [`RtpMediaDevices`] registriert.

use super::media::{
    LocalMedia, MediaDeviceInfo, MediaDevices, MediaError, MediaKind, MediaTrack, RtcTrack,
    RtpMediaDevices,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, PlayStreamError, SampleFormat, Stream, StreamConfig,
    SupportedStreamConfigRange, SupportedStreamConfigsError,
};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn config_error(e: SupportedStreamConfigsError) -> MediaError {
    match e {
        SupportedStreamConfigsError::DeviceNotAvailable => {
            MediaError::NotFound("audio input device not available".to_string())
        }
        SupportedStreamConfigsError::InvalidArgument => {
            MediaError::ConstraintsUnsatisfiable("invalid stream configuration".to_string())
        }
        other => MediaError::classify(other.to_string()),
    }
}

fn build_error(e: BuildStreamError) -> MediaError {
    match e {
        BuildStreamError::DeviceNotAvailable => {
            MediaError::NotFound("audio input device not available".to_string())
        }
        BuildStreamError::StreamConfigNotSupported | BuildStreamError::InvalidArgument => {
            MediaError::ConstraintsUnsatisfiable(e.to_string())
        }
        other => MediaError::classify(other.to_string()),
    }
}

fn play_error(e: PlayStreamError) -> MediaError {
    match e {
        PlayStreamError::DeviceNotAvailable => {
            MediaError::DeviceBusy("audio input device not available".to_string())
        }
        other => MediaError::classify(other.to_string()),
    }
}

// ============================================================================
// CAPTURE STREAM
// ============================================================================

/// cpal-Stream, der nur über den Mutex angefasst wird
struct CaptureStream(Stream);

// Stream ist nicht Send; er wird nur gehalten und beim Stoppen gedroppt
unsafe impl Send for CaptureStream {}

// ============================================================================
// CAPTURED AUDIO TRACK
// ============================================================================

/// Audio-Track mit laufender Mikrofon-Aufnahme
pub struct CapturedAudioTrack {
    rtc: RtcTrack,
    stream: Mutex<Option<CaptureStream>>,
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,
    /// Spiegelt `is_enabled` für den Audio-Callback
    muted: Arc<AtomicBool>,
    input_level: Arc<Mutex<f32>>,
}

impl CapturedAudioTrack {
    fn open(device: &Device, device_name: Option<String>) -> Result<Self, MediaError> {
        let config = find_best_input_config(device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let muted = Arc::new(AtomicBool::new(false));
        let input_level = Arc::new(Mutex::new(0.0f32));

        let buffer = Arc::clone(&capture_buffer);
        let is_muted = Arc::clone(&muted);
        let level = Arc::clone(&input_level);
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if data.is_empty() {
                        return;
                    }

                    // Audio Level berechnen (RMS)
                    let rms = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *level.lock() = rms.min(1.0);

                    if is_muted.load(Ordering::Relaxed) {
                        return;
                    }

                    let samples = resample(data, source_sample_rate, SAMPLE_RATE);
                    let mut buffer = buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(build_error)?;

        stream.play().map_err(play_error)?;

        Ok(Self {
            rtc: RtcTrack::new(MediaKind::Audio, device_name),
            stream: Mutex::new(Some(CaptureStream(stream))),
            capture_buffer,
            muted,
            input_level,
        })
    }

    /// Liest einen Frame (20ms) aufgenommenes Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }

    /// Aktueller Eingangspegel (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    pub fn rtc(&self) -> &RtcTrack {
        &self.rtc
    }
}

impl MediaTrack for CapturedAudioTrack {
    fn id(&self) -> &str {
        self.rtc.id()
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn device_id(&self) -> Option<&str> {
        self.rtc.device_id()
    }

    fn is_enabled(&self) -> bool {
        self.rtc.is_enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.rtc.set_enabled(enabled);
        self.muted.store(!enabled, Ordering::Relaxed);
        tracing::debug!("Audio muted: {}", !enabled);
    }

    fn stop(&self) {
        if self.stream.lock().take().is_some() {
            tracing::info!("Audio capture stopped");
        }
        self.rtc.stop();
    }

    fn is_stopped(&self) -> bool {
        self.rtc.is_stopped()
    }

    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        self.rtc.rtc_track()
    }
}

impl fmt::Debug for CapturedAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedAudioTrack")
            .field("rtc", &self.rtc)
            .field("input_level", &self.input_level())
            .finish()
    }
}

/// Einfaches Linear-Resampling
fn resample(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return data.to_vec();
    }

    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs = device.supported_input_configs().map_err(config_error)?;
    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    // Priorität: 48kHz F32 > F32 mit bester Rate
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let supports_target =
        |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate;

    if let Some(config) = configs
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32 && supports_target(c))
    {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    Err(MediaError::ConstraintsUnsatisfiable(
        "no f32 input configuration available".to_string(),
    ))
}

// ============================================================================
// SYSTEM MEDIA DEVICES
// ============================================================================

/// Geräte-Backend mit echtem Mikrofon
#[derive(Debug, Default)]
pub struct SystemMediaDevices {
    video: RtpMediaDevices,
}

impl SystemMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(self, device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            video: self.video.with_camera(device_id, label),
        }
    }

    fn open_microphone(&self) -> Result<CapturedAudioTrack, MediaError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| MediaError::NotFound("no audio input device".to_string()))?;
        let name = device.name().ok();
        CapturedAudioTrack::open(&device, name)
    }
}

#[async_trait]
impl MediaDevices for SystemMediaDevices {
    async fn acquire(&self, kind: MediaKind, camera: Option<&str>) -> Result<LocalMedia, MediaError> {
        let microphone: Arc<dyn MediaTrack> = Arc::new(self.open_microphone()?);
        let mut tracks = vec![microphone];

        if kind == MediaKind::Video {
            let device_id = match camera {
                Some(id) => id.to_string(),
                None => match self.video.cameras().await?.into_iter().next() {
                    Some(info) => info.device_id,
                    None => {
                        for track in &tracks {
                            track.stop();
                        }
                        return Err(MediaError::NotFound("no camera registered".to_string()));
                    }
                },
            };
            match self.video.open_camera(&device_id).await {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    for track in &tracks {
                        track.stop();
                    }
                    return Err(e);
                }
            }
        }

        Ok(LocalMedia::new(tracks))
    }

    async fn cameras(&self) -> Result<Vec<MediaDeviceInfo>, MediaError> {
        self.video.cameras().await
    }

    async fn open_camera(&self, device_id: &str) -> Result<Arc<dyn MediaTrack>, MediaError> {
        self.video.open_camera(device_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_doubles_length_for_double_rate() {
        let input = vec![0.0, 1.0, 0.0, -1.0];
        let output = resample(&input, 24000, 48000);
        assert_eq!(output.len(), 8);
        assert_eq!(output[0], 0.0);
        assert!((output[1] - 0.5).abs() < 1e-6);

        assert_eq!(resample(&input, 48000, 48000), input);
    }

    #[test]
    fn test_empty_config_list_is_unsatisfiable() {
        assert!(matches!(
            select_best_config(Vec::new()),
            Err(MediaError::ConstraintsUnsatisfiable(_))
        ));
    }
}
