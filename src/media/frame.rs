//! Media frames carried through tracks.

use std::time::Duration;

use bytes::Bytes;

use super::TrackKind;

/// Default video frame duration (30 fps)
pub const DEFAULT_VIDEO_FRAME_DURATION: Duration = Duration::from_nanos(33_333_333);

/// One encoded media unit.
///
/// The payload is opaque here: capture/encode happens upstream of the
/// outbound track and decode/present happens downstream of the inbound one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaFrame {
    /// Media kind of the track that produced the frame
    pub kind: TrackKind,
    /// Encoded payload
    pub data: Bytes,
    /// Presentation duration
    pub duration: Duration,
    /// RTP timestamp (90kHz clock for video)
    pub timestamp: u32,
}

impl MediaFrame {
    /// Create a video frame with the default 30 fps duration
    pub fn video(data: impl Into<Bytes>, timestamp: u32) -> Self {
        Self {
            kind: TrackKind::Video,
            data: data.into(),
            duration: DEFAULT_VIDEO_FRAME_DURATION,
            timestamp,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
