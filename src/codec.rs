//! Video codec descriptors used when describing outbound tracks.
//!
//! Encoding itself belongs to the media engine; this module only names the
//! formats and their SDP parameters, in order of preference.

use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8, MIME_TYPE_VP9};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

/// Video codecs the session can offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VideoCodec {
    #[default]
    VP8,
    VP9,
    H264,
}

/// RTP clock rate shared by all WebRTC video codecs
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

impl VideoCodec {
    /// Supported formats in order of preference
    pub fn supported() -> [VideoCodec; 3] {
        [VideoCodec::VP8, VideoCodec::VP9, VideoCodec::H264]
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            VideoCodec::VP8 => MIME_TYPE_VP8,
            VideoCodec::VP9 => MIME_TYPE_VP9,
            VideoCodec::H264 => MIME_TYPE_H264,
        }
    }

    /// Encoding name as it appears in an `a=rtpmap` line
    pub fn encoding_name(self) -> &'static str {
        match self {
            VideoCodec::VP8 => "VP8",
            VideoCodec::VP9 => "VP9",
            VideoCodec::H264 => "H264",
        }
    }

    /// Dynamic payload type used by the loopback engine
    pub fn payload_type(self) -> u8 {
        match self {
            VideoCodec::VP8 => 96,
            VideoCodec::VP9 => 98,
            VideoCodec::H264 => 102,
        }
    }

    pub fn sdp_fmtp_line(self) -> &'static str {
        match self {
            VideoCodec::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
            VideoCodec::VP9 => "profile-id=0",
            VideoCodec::VP8 => "",
        }
    }

    /// Detect codec from MIME type string
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        let mime_lower = mime.to_lowercase();
        if mime_lower.contains("h264") || mime_lower.contains("avc") {
            Some(VideoCodec::H264)
        } else if mime_lower.contains("vp9") {
            Some(VideoCodec::VP9)
        } else if mime_lower.contains("vp8") {
            Some(VideoCodec::VP8)
        } else {
            None
        }
    }

    /// Detect codec from an `a=rtpmap` encoding name (e.g. "VP8/90000")
    pub fn from_encoding_name(name: &str) -> Option<Self> {
        let name = name.split('/').next().unwrap_or(name);
        Self::supported()
            .into_iter()
            .find(|c| c.encoding_name().eq_ignore_ascii_case(name))
    }

    pub(crate) fn capability(self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: self.mime_type().to_owned(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: self.sdp_fmtp_line().to_owned(),
            rtcp_feedback: vec![],
        }
    }
}
