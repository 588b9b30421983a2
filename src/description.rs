//! Session descriptions exchanged during a negotiation round.

use std::fmt;

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::EngineError;

/// Role of a description within the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// Immutable SDP payload tagged with its role.
///
/// Serializes as `{"type":"offer","sdp":"v=0..."}`, the shape browsers use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    kind: SdpKind,
    sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn kind(&self) -> SdpKind {
        self.kind
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }

    /// Convert to webrtc-rs form (parses the SDP).
    pub(crate) fn to_rtc(&self) -> Result<RTCSessionDescription, EngineError> {
        let desc = match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone()),
        };
        desc.map_err(|e| EngineError::InvalidDescription(e.to_string()))
    }

    pub(crate) fn from_rtc(desc: &RTCSessionDescription) -> Result<Self, EngineError> {
        match desc.sdp_type {
            RTCSdpType::Offer => Ok(Self::offer(desc.sdp.clone())),
            RTCSdpType::Answer => Ok(Self::answer(desc.sdp.clone())),
            other => Err(EngineError::InvalidDescription(format!(
                "unsupported description type: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_serialize() {
        let offer = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_string(&offer).unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("\"sdp\":\"v=0\\r\\n\""));
    }

    #[test]
    fn test_description_deserialize() {
        let desc: SessionDescription =
            serde_json::from_str(r#"{"type":"answer","sdp":"v=0"}"#).unwrap();
        assert_eq!(desc.kind(), SdpKind::Answer);
        assert!(!desc.is_offer());
        assert_eq!(desc.sdp(), "v=0");
    }

    #[test]
    fn test_invalid_sdp_rejected_on_conversion() {
        let desc = SessionDescription::offer("not sdp");
        assert!(matches!(desc.to_rtc(), Err(EngineError::InvalidDescription(_))));
    }
}
