//! Process-wide media subsystem, initialized before any session and shut
//! down after the last one.
//!
//! Passed explicitly to `Session::start`, so independent sessions (and
//! tests) each get their own.

use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::interceptor::registry::Registry;

use crate::config::{EngineKind, SessionConfig};
use crate::error::{EngineError, Result, StateError};
use crate::peer::{
    Connection, EventSink, LoopbackEngine, LoopbackNetwork, PeerEngine, Role, WebRtcEngine,
};

#[derive(Clone)]
enum Backend {
    WebRtc(Arc<API>),
    Loopback(Arc<LoopbackNetwork>),
}

pub struct RtcContext {
    config: SessionConfig,
    backend: Mutex<Option<Backend>>,
}

impl RtcContext {
    /// Validate the configuration and bring up the selected engine.
    pub fn initialize(config: SessionConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let backend = match config.engine {
            EngineKind::WebRtc => Backend::WebRtc(Arc::new(build_api()?)),
            EngineKind::Loopback => Backend::Loopback(LoopbackNetwork::new()),
        };
        info!("RtcContext: initialized ({:?} engine)", config.engine);

        Ok(Arc::new(Self {
            config,
            backend: Mutex::new(Some(backend)),
        }))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.backend.lock().is_some()
    }

    /// Release the media subsystem. Returns false if already shut down.
    ///
    /// Sessions created from this context keep working until closed; new
    /// connections are refused.
    pub fn shutdown(&self) -> bool {
        match self.backend.lock().take() {
            Some(Backend::Loopback(network)) => network.clear(),
            Some(Backend::WebRtc(_)) => {}
            None => return false,
        }
        info!("RtcContext: shut down");
        true
    }

    /// Create a connection for `role` whose events go to `events`.
    pub async fn new_connection(&self, role: Role, events: EventSink) -> Result<Connection> {
        let backend = self.backend.lock().clone().ok_or(StateError::ContextShutDown)?;

        let engine: Box<dyn PeerEngine> = match backend {
            Backend::WebRtc(api) => Box::new(
                WebRtcEngine::new(
                    &api,
                    self.config.rtc_configuration(),
                    self.config.video_codec,
                    events.clone(),
                )
                .await?,
            ),
            Backend::Loopback(network) => Box::new(
                LoopbackEngine::new(events.clone(), network, self.config.loopback_candidates)
                    .with_codec(self.config.video_codec),
            ),
        };

        Ok(Connection::new(role, engine, events))
    }
}

/// webrtc-rs API with the default codecs and interceptors
fn build_api() -> std::result::Result<API, EngineError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_refuses_connections() {
        let context = RtcContext::initialize(SessionConfig::default()).unwrap();
        assert!(context.is_active());

        let (tx, _rx) = EventSink::channel();
        let conn = context
            .new_connection(Role::Local, EventSink::new(Role::Local, tx.clone()))
            .await
            .unwrap();
        assert_eq!(conn.role(), Role::Local);

        assert!(context.shutdown());
        assert!(!context.shutdown());
        assert!(!context.is_active());

        let err = context
            .new_connection(Role::Remote, EventSink::new(Role::Remote, tx))
            .await
            .err();
        assert_eq!(err, Some(Error::State(StateError::ContextShutDown)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig {
            step_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(RtcContext::initialize(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_webrtc_context_creates_peer_connection() {
        let config = SessionConfig {
            engine: EngineKind::WebRtc,
            ..Default::default()
        };
        let context = RtcContext::initialize(config).unwrap();
        let (tx, _rx) = EventSink::channel();
        let conn = context
            .new_connection(Role::Local, EventSink::new(Role::Local, tx))
            .await
            .unwrap();
        assert!(conn.close().await);
    }
}
