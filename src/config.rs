//! Session configuration.
//!
//! Loadable from JSON, e.g.
//! `{"engine":"loopback","step_timeout_ms":2000,"loopback_candidates":3}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::codec::VideoCodec;
use crate::error::{Error, Result};

/// Default bounded wait for each negotiation step
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 10_000;

/// Default number of host candidates the loopback engine gathers per description
pub const DEFAULT_LOOPBACK_CANDIDATES: usize = 2;

/// Which media/transport engine backs the connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// webrtc-rs RTCPeerConnection (real ICE/DTLS/SRTP)
    WebRtc,
    /// In-process engine with deterministic candidates and direct frame hand-off
    #[default]
    Loopback,
}

/// ICE server configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Create a STUN-only server config
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// Create a TURN server config with credentials
    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    /// Convert to webrtc-rs RTCIceServer
    pub(crate) fn to_rtc_ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Default Google STUN servers
pub fn google_stun_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::stun("stun:stun1.l.google.com:19302"),
    ]
}

/// Configuration for a two-peer session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Engine backing both connections
    pub engine: EngineKind,
    /// ICE servers for NAT traversal (webrtc engine only)
    pub ice_servers: Vec<IceServerConfig>,
    /// Bounded wait per negotiation step, in milliseconds
    pub step_timeout_ms: u64,
    /// Host candidates gathered per local description (loopback engine only)
    pub loopback_candidates: usize,
    /// Preferred outbound video codec
    pub video_codec: VideoCodec,
    /// Outbound video track id
    pub track_id: String,
    /// Outbound media stream id
    pub stream_id: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            ice_servers: Vec::new(),
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            loopback_candidates: DEFAULT_LOOPBACK_CANDIDATES,
            video_codec: VideoCodec::default(),
            track_id: "video".to_string(),
            stream_id: "webrtc-loopback".to_string(),
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every round fail.
    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_ms == 0 {
            return Err(Error::Config("step_timeout_ms must be greater than zero".to_string()));
        }
        if self.track_id.is_empty() || self.stream_id.is_empty() {
            return Err(Error::Config("track_id and stream_id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Build RTCConfiguration from ICE servers
    pub(crate) fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|s| s.to_rtc_ice_server())
                .collect(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_loopback() {
        let config = SessionConfig::default();
        assert_eq!(config.engine, EngineKind::Loopback);
        assert_eq!(config.step_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = SessionConfig::from_json(
            r#"{"engine":"webrtc","ice_servers":[{"urls":["stun:stun.l.google.com:19302"]}],"step_timeout_ms":500}"#,
        )
        .unwrap();
        assert_eq!(config.engine, EngineKind::WebRtc);
        assert_eq!(config.ice_servers, vec![IceServerConfig::stun("stun:stun.l.google.com:19302")]);
        assert_eq!(config.step_timeout(), Duration::from_millis(500));
        assert_eq!(config.loopback_candidates, DEFAULT_LOOPBACK_CANDIDATES);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = SessionConfig::from_json(r#"{"step_timeout_ms":0}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_turn_server_to_rtc() {
        let server = IceServerConfig::turn("turn:turn.example.com:3478", "user", "secret");
        let rtc = server.to_rtc_ice_server();
        assert_eq!(rtc.username, "user");
        assert_eq!(rtc.credential, "secret");
        assert_eq!(google_stun_servers().len(), 2);
    }
}
