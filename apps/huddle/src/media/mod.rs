//! Local capture: camera, microphone and screen tracks.
//!
//! `MediaSource` owns the device resources and decides which `LocalStream` is
//! active. It never touches the peer connection; the session swaps outbound
//! tracks itself after a switch.

mod synthetic;
mod track;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{MediaConstraints, RetryPolicy};
use crate::error::DeviceError;

pub use synthetic::SyntheticCapture;
pub use track::{CaptureKind, LocalStream, MediaTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    Screen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}

/// Platform capture API.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Opens the devices for `kind` and returns their live tracks.
    async fn open(
        &self,
        kind: CaptureKind,
        constraints: &MediaConstraints,
    ) -> Result<Vec<MediaTrack>, DeviceError>;

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError>;
}

pub struct MediaSource {
    backend: Arc<dyn CaptureBackend>,
    constraints: MediaConstraints,
    retry: RetryPolicy,
    active: watch::Sender<Option<LocalStream>>,
    releases: AtomicU64,
}

impl MediaSource {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        constraints: MediaConstraints,
        retry: RetryPolicy,
    ) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            backend,
            constraints,
            retry,
            active,
            releases: AtomicU64::new(0),
        }
    }

    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    pub fn active(&self) -> Option<LocalStream> {
        self.active.borrow().clone()
    }

    /// Observes the active stream. Negotiation uses this to wait for media.
    pub fn watch(&self) -> watch::Receiver<Option<LocalStream>> {
        self.active.subscribe()
    }

    /// Number of times `release` actually stopped an active stream.
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    pub async fn devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        self.backend.enumerate().await
    }

    /// Single acquisition attempt. The new stream becomes active and every
    /// track of the previous stream that is not carried over is stopped.
    ///
    /// Screen capture keeps the camera's live audio tracks so the microphone
    /// keeps flowing while sharing.
    pub async fn acquire(
        &self,
        kind: CaptureKind,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, DeviceError> {
        let mut tracks = self.backend.open(kind, constraints).await?;
        let previous = self.active();

        if let Some(previous) = &previous {
            match kind {
                CaptureKind::Screen => {
                    let has_audio = tracks.iter().any(|t| t.kind() == TrackKind::Audio);
                    if !has_audio {
                        tracks.extend(
                            previous
                                .tracks()
                                .iter()
                                .filter(|t| t.kind() == TrackKind::Audio && t.is_live())
                                .cloned(),
                        );
                    }
                }
                CaptureKind::Camera => {
                    // Mute state follows the microphone across a switch.
                    if let (Some(old), Some(new)) = (
                        previous.track(TrackKind::Audio),
                        tracks.iter().find(|t| t.kind() == TrackKind::Audio),
                    ) {
                        new.set_enabled(old.is_enabled());
                    }
                }
            }
        }

        let stream = LocalStream::new(kind, tracks);
        if let Some(previous) = previous {
            for track in previous.tracks() {
                if !stream.has_track(track) {
                    track.stop();
                }
            }
        }
        info!(
            stream_id = stream.id(),
            source = ?kind,
            tracks = stream.tracks().len(),
            "local media acquired"
        );
        self.active.send_replace(Some(stream.clone()));
        Ok(stream)
    }

    /// Acquires with the configured constraints, retrying with a linearly
    /// growing delay while the device reports itself busy.
    pub async fn acquire_with_retry(&self, kind: CaptureKind) -> Result<LocalStream, DeviceError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.acquire(kind, &self.constraints).await {
                Err(DeviceError::Busy) if attempt < max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "capture device busy; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Reuses the active camera stream when it is still live.
    pub async fn camera(&self) -> Result<LocalStream, DeviceError> {
        if let Some(stream) = self.active() {
            if stream.source() == CaptureKind::Camera && stream.is_live() {
                debug!(stream_id = stream.id(), "reusing active camera stream");
                return Ok(stream);
            }
        }
        self.acquire_with_retry(CaptureKind::Camera).await
    }

    /// Acquires a stream of `kind` and makes it active. The caller is
    /// responsible for moving the peer connection onto it.
    pub async fn switch_to(&self, kind: CaptureKind) -> Result<LocalStream, DeviceError> {
        self.acquire_with_retry(kind).await
    }

    /// Stops every track of the active stream. Safe to call repeatedly.
    pub fn release(&self) -> bool {
        match self.active.send_replace(None) {
            Some(stream) => {
                stream.stop();
                self.releases.fetch_add(1, Ordering::SeqCst);
                info!(stream_id = stream.id(), "local media released");
                true
            }
            None => false,
        }
    }

    /// Flips the enabled flag of the first track of `kind`. A missing track is
    /// a caller bug, so it is only logged.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let active = self.active.borrow();
        match active.as_ref().and_then(|stream| stream.track(kind)) {
            Some(track) => {
                track.set_enabled(enabled);
                debug!(%kind, enabled, "track toggled");
                true
            }
            None => {
                warn!(%kind, "no local track to toggle");
                false
            }
        }
    }

    /// Inverts the enabled flag and returns the new value, if a track exists.
    pub fn toggle_track(&self, kind: TrackKind) -> Option<bool> {
        let enabled = self.active()?.track(kind)?.is_enabled();
        self.set_track_enabled(kind, !enabled).then_some(!enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use test_timeout::tokio_timeout_test;

    fn source(backend: Arc<SyntheticCapture>) -> MediaSource {
        MediaSource::new(backend, MediaConstraints::default(), RetryPolicy::default())
    }

    #[tokio_timeout_test(5)]
    async fn acquire_camera_yields_audio_and_video() {
        let backend = Arc::new(SyntheticCapture::new());
        let media = source(backend.clone());
        let stream = media.acquire_with_retry(CaptureKind::Camera).await.unwrap();
        assert!(stream.track(TrackKind::Audio).is_some());
        assert!(stream.track(TrackKind::Video).is_some());
        assert_eq!(media.active().unwrap().id(), stream.id());
    }

    #[tokio_timeout_test(5, paused)]
    async fn busy_device_is_retried_with_growing_delay() {
        let backend = Arc::new(SyntheticCapture::new());
        backend.fail_next(CaptureKind::Camera, DeviceError::Busy);
        let media = source(backend.clone());

        let started = tokio::time::Instant::now();
        let stream = media.acquire_with_retry(CaptureKind::Camera).await.unwrap();
        assert!(stream.is_live());
        assert_eq!(backend.open_count(CaptureKind::Camera), 2);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio_timeout_test(5, paused)]
    async fn busy_device_surfaces_after_last_attempt() {
        let backend = Arc::new(SyntheticCapture::new());
        for _ in 0..3 {
            backend.fail_next(CaptureKind::Camera, DeviceError::Busy);
        }
        let media = source(backend.clone());

        let started = tokio::time::Instant::now();
        let err = media.acquire_with_retry(CaptureKind::Camera).await.unwrap_err();
        assert_eq!(err, DeviceError::Busy);
        assert_eq!(backend.open_count(CaptureKind::Camera), 3);
        // 250ms after the first failure, 500ms after the second.
        assert!(started.elapsed() >= Duration::from_millis(750));
        assert!(media.active().is_none());
    }

    #[tokio_timeout_test(5)]
    async fn permission_denied_is_not_retried() {
        let backend = Arc::new(SyntheticCapture::new());
        backend.fail_next(CaptureKind::Camera, DeviceError::PermissionDenied);
        let media = source(backend.clone());
        let err = media.acquire_with_retry(CaptureKind::Camera).await.unwrap_err();
        assert_eq!(err, DeviceError::PermissionDenied);
        assert_eq!(backend.open_count(CaptureKind::Camera), 1);
    }

    #[tokio_timeout_test(5)]
    async fn release_is_idempotent() {
        let backend = Arc::new(SyntheticCapture::new());
        let media = source(backend.clone());
        let stream = media.acquire_with_retry(CaptureKind::Camera).await.unwrap();

        assert!(media.release());
        assert!(!media.release());
        assert!(!stream.is_live());
        assert_eq!(media.release_count(), 1);
        assert!(media.active().is_none());
    }

    #[tokio_timeout_test(5)]
    async fn toggle_without_track_is_noop() {
        let backend = Arc::new(SyntheticCapture::new().without_audio());
        let media = source(backend);
        assert_eq!(media.toggle_track(TrackKind::Audio), None);
        media.acquire_with_retry(CaptureKind::Camera).await.unwrap();
        assert_eq!(media.toggle_track(TrackKind::Audio), None);
        assert!(!media.set_track_enabled(TrackKind::Audio, false));
        assert_eq!(media.toggle_track(TrackKind::Video), Some(false));
        assert_eq!(media.toggle_track(TrackKind::Video), Some(true));
    }

    #[tokio_timeout_test(5)]
    async fn screen_share_keeps_camera_audio() {
        let backend = Arc::new(SyntheticCapture::new());
        let media = source(backend.clone());
        let camera = media.acquire_with_retry(CaptureKind::Camera).await.unwrap();
        let mic = camera.track(TrackKind::Audio).unwrap().clone();
        let cam = camera.track(TrackKind::Video).unwrap().clone();

        let screen = media.switch_to(CaptureKind::Screen).await.unwrap();
        assert!(screen.track(TrackKind::Audio).unwrap().same_track(&mic));
        assert_eq!(
            screen.track(TrackKind::Video).unwrap().source(),
            CaptureKind::Screen
        );
        assert!(mic.is_live());
        assert!(!cam.is_live());
    }

    #[tokio_timeout_test(5)]
    async fn switching_back_to_camera_preserves_mute() {
        let backend = Arc::new(SyntheticCapture::new());
        let media = source(backend.clone());
        media.acquire_with_retry(CaptureKind::Camera).await.unwrap();
        media.set_track_enabled(TrackKind::Audio, false);
        let screen = media.switch_to(CaptureKind::Screen).await.unwrap();
        let screen_video = screen.track(TrackKind::Video).unwrap().clone();

        let camera = media.switch_to(CaptureKind::Camera).await.unwrap();
        assert!(!camera.track(TrackKind::Audio).unwrap().is_enabled());
        assert!(!screen_video.is_live());
        assert_eq!(backend.open_count(CaptureKind::Camera), 2);
    }

    #[tokio_timeout_test(5)]
    async fn camera_reuses_live_stream() {
        let backend = Arc::new(SyntheticCapture::new());
        let media = source(backend.clone());
        let first = media.camera().await.unwrap();
        let second = media.camera().await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(backend.open_count(CaptureKind::Camera), 1);
    }
}
