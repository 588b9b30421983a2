//! Track handles and transceiver directions.
//!
//! A `Track` is owned by the media pipeline; connections and streams keep
//! clones of the handle for the duration of the session. Frames pushed into
//! a track are handed to every frame-available subscriber.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use super::MediaFrame;

/// Frame-available callback
pub type FrameCallback = Arc<dyn Fn(&MediaFrame) + Send + Sync>;

/// Media kind of a track or transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Media type as written in an SDP `m=` line
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    pub fn from_media_type(media: &str) -> Option<Self> {
        match media {
            "audio" => Some(TrackKind::Audio),
            "video" => Some(TrackKind::Video),
            _ => None,
        }
    }

    pub(crate) fn to_rtp_codec_type(self) -> RTPCodecType {
        match self {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        }
    }

    pub(crate) fn from_rtp_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }
}

/// Send/receive intent of a transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl TransceiverDirection {
    pub fn can_send(self) -> bool {
        matches!(self, TransceiverDirection::SendRecv | TransceiverDirection::SendOnly)
    }

    pub fn can_receive(self) -> bool {
        matches!(self, TransceiverDirection::SendRecv | TransceiverDirection::RecvOnly)
    }

    /// Direction attribute as it appears in SDP (`a=recvonly`)
    pub fn sdp_attribute(self) -> &'static str {
        match self {
            TransceiverDirection::SendRecv => "sendrecv",
            TransceiverDirection::SendOnly => "sendonly",
            TransceiverDirection::RecvOnly => "recvonly",
            TransceiverDirection::Inactive => "inactive",
        }
    }

    pub fn from_sdp_attribute(attr: &str) -> Option<Self> {
        match attr {
            "sendrecv" => Some(TransceiverDirection::SendRecv),
            "sendonly" => Some(TransceiverDirection::SendOnly),
            "recvonly" => Some(TransceiverDirection::RecvOnly),
            "inactive" => Some(TransceiverDirection::Inactive),
            _ => None,
        }
    }

    /// Direction the answerer uses for an offered media section, given what it wants locally.
    pub fn answer_to(self, local: TransceiverDirection) -> TransceiverDirection {
        let send = self.can_receive() && local.can_send();
        let recv = self.can_send() && local.can_receive();
        match (send, recv) {
            (true, true) => TransceiverDirection::SendRecv,
            (true, false) => TransceiverDirection::SendOnly,
            (false, true) => TransceiverDirection::RecvOnly,
            (false, false) => TransceiverDirection::Inactive,
        }
    }

    pub(crate) fn to_rtc(self) -> RTCRtpTransceiverDirection {
        match self {
            TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
            TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
            TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
            TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
        }
    }
}

/// Per-track counters (atomic, lock-free)
#[derive(Default)]
pub struct TrackStats {
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    stream_id: String,
    subscribers: Mutex<Vec<FrameCallback>>,
    ended: AtomicBool,
    stats: TrackStats,
}

/// Handle to a media source (outbound) or sink (inbound)
#[derive(Clone)]
pub struct Track {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("stream_id", &self.inner.stream_id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl Track {
    pub fn new(kind: TrackKind, id: &str, stream_id: &str) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.to_string(),
                kind,
                stream_id: stream_id.to_string(),
                subscribers: Mutex::new(Vec::new()),
                ended: AtomicBool::new(false),
                stats: TrackStats::default(),
            }),
        }
    }

    pub fn video(id: &str, stream_id: &str) -> Self {
        Self::new(TrackKind::Video, id, stream_id)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn stats(&self) -> &TrackStats {
        &self.inner.stats
    }

    /// True if both handles refer to the same underlying track
    pub fn same_track(&self, other: &Track) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a frame-available callback. Ignored once the track has ended.
    pub fn on_frame(&self, callback: FrameCallback) {
        if self.is_ended() {
            return;
        }
        self.inner.subscribers.lock().push(callback);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Deliver a frame to every subscriber.
    ///
    /// Returns false if the track has ended or the frame kind does not match.
    pub fn push_frame(&self, frame: &MediaFrame) -> bool {
        if self.is_ended() || frame.kind != self.inner.kind {
            return false;
        }

        // Callbacks run outside the lock so they may subscribe or stop the track
        let subscribers = self.inner.subscribers.lock().clone();
        for callback in &subscribers {
            callback(frame);
        }

        self.inner.stats.frames.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
        true
    }

    /// End the track and drop all subscribers. Returns false if already ended.
    pub fn stop(&self) -> bool {
        if self
            .inner
            .ended
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.inner.subscribers.lock().clear();
        true
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }
}
