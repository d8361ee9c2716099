//! Mikrofon-Capture über cpal
//!
//! Nur mit Feature `device-capture`. Kamera-Capture gibt es hier nicht,
//! Video-Anrufe liefern `DeviceUnavailable`.

use super::{LocalMedia, MediaDevices, MediaError, TrackKind};
use crate::session::MediaMode;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::Arc;

/// Sample Rate (48kHz wie Opus)
const SAMPLE_RATE: u32 = 48000;

// ============================================================================
// DEVICES
// ============================================================================

/// Standard-Eingabegerät des Hosts
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

impl MediaDevices for CpalDevices {
    fn acquire(&self, mode: MediaMode) -> Result<Box<dyn LocalMedia>, MediaError> {
        if mode.has_video() {
            return Err(MediaError::DeviceUnavailable(
                "no camera backend available".to_string(),
            ));
        }

        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            tracing::warn!("No audio input device found");
            MediaError::DeviceUnavailable("no audio input device".to_string())
        })?;

        let capture = MicrophoneCapture::start(&device)?;
        Ok(Box::new(capture))
    }
}

// ============================================================================
// CAPTURE
// ============================================================================

struct MicrophoneCapture {
    stream: Option<Stream>,
    is_muted: Arc<Mutex<bool>>,
    input_level: Arc<Mutex<f32>>,
}

// cpal::Stream ist nicht auf allen Plattformen Send/Sync; der Stream wird
// nur gehalten und gedroppt, nie über Threads hinweg benutzt
unsafe impl Send for MicrophoneCapture {}
unsafe impl Sync for MicrophoneCapture {}

impl MicrophoneCapture {
    fn start(device: &Device) -> Result<Self, MediaError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;
        let config = select_config(configs.collect())?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let is_muted = Arc::new(Mutex::new(false));
        let input_level = Arc::new(Mutex::new(0.0f32));

        let muted = Arc::clone(&is_muted);
        let level = Arc::clone(&input_level);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if *muted.lock() || data.is_empty() {
                        *level.lock() = 0.0;
                        return;
                    }
                    // Audio Level (RMS)
                    let rms = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *level.lock() = rms.min(1.0);
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    MediaError::DeviceUnavailable("audio input device".to_string())
                }
                other => MediaError::DeviceUnavailable(other.to_string()),
            })?;

        stream
            .play()
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            is_muted,
            input_level,
        })
    }
}

impl LocalMedia for MicrophoneCapture {
    fn tracks(&self) -> Vec<TrackKind> {
        if self.stream.is_some() {
            vec![TrackKind::Audio]
        } else {
            Vec::new()
        }
    }

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) {
        if kind == TrackKind::Audio {
            *self.is_muted.lock() = !enabled;
            tracing::debug!("Audio muted: {}", !enabled);
        }
    }

    fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            *self.input_level.lock() = 0.0;
            tracing::info!("Audio capture stopped");
        }
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wählt die beste Konfiguration: 48kHz F32 bevorzugt
fn select_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    configs
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32)
        .map(|c| c.with_max_sample_rate().into())
        .ok_or_else(|| {
            MediaError::DeviceUnavailable("no f32 audio input configuration".to_string())
        })
}
