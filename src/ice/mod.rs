//! ICE candidates and the candidate relay between the two connections.

pub mod relay;

pub use relay::*;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};

use crate::error::EngineError;
use crate::peer::Role;

/// One reachability option, tagged with the connection that gathered it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub origin: Role,
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl Candidate {
    pub fn new(
        origin: Role,
        candidate: &str,
        sdp_mid: Option<&str>,
        sdp_mline_index: Option<u16>,
    ) -> Self {
        Self {
            origin,
            candidate: candidate.to_string(),
            sdp_mid: sdp_mid.map(|s| s.to_string()),
            sdp_mline_index,
        }
    }

    /// Candidate gathered by a webrtc-rs peer connection
    pub(crate) fn from_rtc(origin: Role, candidate: &RTCIceCandidate) -> Result<Self, EngineError> {
        let init = candidate.to_json()?;
        Ok(Self {
            origin,
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        })
    }

    pub(crate) fn to_rtc_init(&self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate.clone(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
            username_fragment: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_deserialize() {
        let json = r#"{"origin":"local","candidate":"candidate:1 1 UDP 2130706431 192.168.1.1 8189 typ host","sdpMLineIndex":0,"sdpMid":"0"}"#;
        let candidate: Candidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.origin, Role::Local);
        assert!(candidate.candidate.contains("typ host"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
    }

    #[test]
    fn test_candidate_to_rtc_init() {
        let candidate = Candidate::new(
            Role::Remote,
            "candidate:2 1 udp 1 127.0.0.1 9 typ host",
            Some("0"),
            Some(0),
        );
        let init = candidate.to_rtc_init();
        assert_eq!(init.candidate, candidate.candidate);
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert!(init.username_fragment.is_none());
    }
}
