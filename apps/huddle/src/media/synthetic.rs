use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CaptureBackend, CaptureKind, DeviceInfo, DeviceKind, MediaTrack, TrackKind};
use crate::config::MediaConstraints;
use crate::error::DeviceError;

/// Capture backend that fabricates tracks instead of opening hardware.
///
/// Failures can be scripted per capture kind and are consumed in order, which
/// makes device contention and permission paths reproducible.
pub struct SyntheticCapture {
    failures: Mutex<HashMap<CaptureKind, VecDeque<DeviceError>>>,
    opens: Mutex<HashMap<CaptureKind, u32>>,
    issued: Mutex<Vec<MediaTrack>>,
    camera_audio: bool,
    camera_video: bool,
    open_delay: Option<Duration>,
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            opens: Mutex::new(HashMap::new()),
            issued: Mutex::new(Vec::new()),
            camera_audio: true,
            camera_video: true,
            open_delay: None,
        }
    }

    /// Camera opens produce no microphone track.
    pub fn without_audio(mut self) -> Self {
        self.camera_audio = false;
        self
    }

    pub fn without_video(mut self) -> Self {
        self.camera_video = false;
        self
    }

    /// Every open waits this long before completing.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn fail_next(&self, kind: CaptureKind, error: DeviceError) {
        self.failures.lock().entry(kind).or_default().push_back(error);
    }

    pub fn open_count(&self, kind: CaptureKind) -> u32 {
        self.opens.lock().get(&kind).copied().unwrap_or(0)
    }

    /// Every track handed out so far, in issue order.
    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        self.issued.lock().clone()
    }

    pub fn live_track_count(&self) -> usize {
        self.issued.lock().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl CaptureBackend for SyntheticCapture {
    async fn open(
        &self,
        kind: CaptureKind,
        constraints: &MediaConstraints,
    ) -> Result<Vec<MediaTrack>, DeviceError> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        *self.opens.lock().entry(kind).or_default() += 1;
        if let Some(error) = self
            .failures
            .lock()
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let mut tracks = Vec::new();
        match kind {
            CaptureKind::Camera => {
                if self.camera_audio && constraints.audio.is_some() {
                    tracks.push(MediaTrack::new(
                        TrackKind::Audio,
                        CaptureKind::Camera,
                        "Synthetic Microphone",
                    ));
                }
                if self.camera_video && constraints.video.is_some() {
                    tracks.push(MediaTrack::new(
                        TrackKind::Video,
                        CaptureKind::Camera,
                        "Synthetic Camera",
                    ));
                }
            }
            CaptureKind::Screen => {
                tracks.push(MediaTrack::new(
                    TrackKind::Video,
                    CaptureKind::Screen,
                    "Synthetic Screen",
                ));
                if constraints.screen.capture_audio {
                    tracks.push(MediaTrack::new(
                        TrackKind::Audio,
                        CaptureKind::Screen,
                        "Synthetic System Audio",
                    ));
                }
            }
        }
        if tracks.is_empty() {
            return Err(DeviceError::NotFound);
        }
        self.issued.lock().extend(tracks.iter().cloned());
        Ok(tracks)
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let mut devices = Vec::new();
        if self.camera_audio {
            devices.push(DeviceInfo {
                id: "synthetic-mic".into(),
                label: "Synthetic Microphone".into(),
                kind: DeviceKind::AudioInput,
            });
        }
        if self.camera_video {
            devices.push(DeviceInfo {
                id: "synthetic-cam".into(),
                label: "Synthetic Camera".into(),
                kind: DeviceKind::VideoInput,
            });
        }
        devices.push(DeviceInfo {
            id: "synthetic-screen".into(),
            label: "Synthetic Screen".into(),
            kind: DeviceKind::Screen,
        });
        Ok(devices)
    }
}
