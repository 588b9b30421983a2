//! Downstream rendering target and its attachment to the inbound stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use super::{MediaFrame, MediaStream, Track, TrackKind};

/// Presentation surface for received video.
///
/// Keeps the most recent frame; the host reads it on its own schedule.
pub struct RenderTarget {
    name: String,
    latest: Mutex<Option<MediaFrame>>,
    frames_presented: AtomicU64,
    released: AtomicBool,
}

impl RenderTarget {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            latest: Mutex::new(None),
            frames_presented: AtomicU64::new(0),
            released: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the displayed frame. Returns false after release.
    pub fn present(&self, frame: &MediaFrame) -> bool {
        if self.is_released() {
            return false;
        }
        *self.latest.lock() = Some(frame.clone());
        self.frames_presented.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn latest_frame(&self) -> Option<MediaFrame> {
        self.latest.lock().clone()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented.load(Ordering::Relaxed)
    }

    /// Release the target. Safe to call repeatedly; only the first call does anything.
    pub fn release(&self) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.latest.lock().take();
        info!("RenderTarget '{}': released after {} frames", self.name, self.frames_presented());
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Route every video track that joins `stream` to `target`.
pub fn attach_video_output(stream: &MediaStream, target: Arc<RenderTarget>) {
    stream.on_add_track(Arc::new(move |track: &Track| {
        if track.kind() != TrackKind::Video {
            debug!("attach_video_output: ignoring {:?} track '{}'", track.kind(), track.id());
            return;
        }
        debug!("attach_video_output: '{}' -> render target '{}'", track.id(), target.name());
        let target = target.clone();
        track.on_frame(Arc::new(move |frame: &MediaFrame| {
            target.present(frame);
        }));
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_track_frames_reach_target() {
        let stream = MediaStream::new("recv");
        let target = RenderTarget::new("screen");
        attach_video_output(&stream, target.clone());

        let video = Track::video("v0", "s");
        let audio = Track::new(TrackKind::Audio, "a0", "s");
        stream.add_track(video.clone());
        stream.add_track(audio.clone());

        assert_eq!(video.subscriber_count(), 1);
        assert_eq!(audio.subscriber_count(), 0);

        video.push_frame(&MediaFrame::video(vec![7u8; 4], 3000));
        assert_eq!(target.frames_presented(), 1);
        assert_eq!(target.latest_frame().map(|f| f.timestamp), Some(3000));
    }

    #[test]
    fn test_release_is_idempotent() {
        let target = RenderTarget::new("screen");
        assert!(target.present(&MediaFrame::video(vec![1u8], 0)));
        assert!(target.release());
        assert!(!target.release());
        assert!(target.latest_frame().is_none());
        assert!(!target.present(&MediaFrame::video(vec![1u8], 0)));
    }
}
