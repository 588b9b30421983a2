//! Two-peer loopback session.
//!
//! Owns both connections, the candidate relay, the negotiation coordinator
//! and the scheduler task that routes connection events. Everything is wired
//! before the first track can be attached.

mod events;

pub use events::SessionEvent;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::RtcContext;
use crate::error::Result;
use crate::ice::CandidateRelay;
use crate::media::{
    attach_video_output, MediaStream, RenderTarget, Track, TrackKind, TransceiverDirection,
};
use crate::negotiation::{Coordinator, Negotiator, Trigger};
use crate::peer::{Connection, ConnectionEvent, EventReceiver, EventSink, Role};

pub struct Session {
    context: Arc<RtcContext>,
    local: Arc<Connection>,
    remote: Arc<Connection>,
    relay: Arc<CandidateRelay>,
    stream: MediaStream,
    render_target: Option<Arc<RenderTarget>>,
    coordinator: Coordinator,
    scheduler: JoinHandle<()>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    closed: AtomicBool,
}

impl Session {
    /// Create and wire both connections, then declare the Remote side's
    /// receive-only video transceiver.
    pub async fn start(
        context: &Arc<RtcContext>,
        render_target: Option<Arc<RenderTarget>>,
    ) -> Result<Self> {
        let config = context.config().clone();
        let (tx, rx) = EventSink::channel();

        let local = context
            .new_connection(Role::Local, EventSink::new(Role::Local, tx.clone()))
            .await?;
        let remote = context
            .new_connection(Role::Remote, EventSink::new(Role::Remote, tx))
            .await?;
        let local = Arc::new(local);
        let remote = Arc::new(remote);
        let relay = Arc::new(CandidateRelay::new(local.clone(), remote.clone()));

        let stream = MediaStream::new(&format!("{}-recv", config.stream_id));
        if let Some(target) = &render_target {
            attach_video_output(&stream, target.clone());
        }

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            local.clone(),
            remote.clone(),
            relay.clone(),
            config.step_timeout(),
        );
        let coordinator = Coordinator::spawn(negotiator, session_tx.clone());
        let scheduler = tokio::spawn(schedule(
            rx,
            coordinator.sender(),
            relay.clone(),
            stream.clone(),
            session_tx,
        ));

        let session = Self {
            context: context.clone(),
            local,
            remote,
            relay,
            stream,
            render_target,
            coordinator,
            scheduler,
            events: Mutex::new(Some(session_rx)),
            closed: AtomicBool::new(false),
        };

        if let Err(e) = session
            .remote
            .add_transceiver(TrackKind::Video, TransceiverDirection::RecvOnly)
            .await
        {
            session.close().await;
            return Err(e);
        }

        info!("Session: started ({:?} engine)", config.engine);
        Ok(session)
    }

    /// Attach an outbound track to the Local connection.
    ///
    /// Returns false if a track with that id is already attached; no round is
    /// triggered in that case.
    pub async fn add_local_track(&self, track: Track) -> Result<bool> {
        self.local.add_track(track).await
    }

    /// Attach a video track using the configured track and stream ids.
    pub async fn add_local_video_track(&self) -> Result<Track> {
        let config = self.context.config();
        let track = Track::video(&config.track_id, &config.stream_id);
        self.local.add_track(track.clone()).await?;
        Ok(track)
    }

    pub async fn add_local_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<()> {
        self.local.add_transceiver(kind, direction).await
    }

    /// Queue a fresh round, e.g. after `SessionEvent::NegotiationFailed`.
    pub fn renegotiate(&self) -> bool {
        !self.is_closed() && self.coordinator.trigger(Trigger::Manual)
    }

    /// Take the session event receiver. Only the first call gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.lock().take()
    }

    pub fn local(&self) -> &Arc<Connection> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<Connection> {
        &self.remote
    }

    pub fn relay(&self) -> &Arc<CandidateRelay> {
        &self.relay
    }

    /// Tracks received by the Remote connection
    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    pub fn render_target(&self) -> Option<&Arc<RenderTarget>> {
        self.render_target.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the session down. Safe to call repeatedly; returns true only for
    /// the call that did the work.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.coordinator.shutdown();
        self.scheduler.abort();
        self.relay.clear().await;

        self.local.close().await;
        self.remote.close().await;
        for track in self.stream.tracks() {
            track.stop();
        }
        if let Some(target) = &self.render_target {
            target.release();
        }

        info!("Session: closed");
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.scheduler.abort();
    }
}

/// Single consumer of connection events.
async fn schedule(
    mut rx: EventReceiver,
    triggers: mpsc::UnboundedSender<Trigger>,
    relay: Arc<CandidateRelay>,
    stream: MediaStream,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some((role, event)) = rx.recv().await {
        match event {
            ConnectionEvent::NegotiationNeeded => {
                if role == Role::Local {
                    let _ = triggers.send(Trigger::NegotiationNeeded);
                } else {
                    debug!("scheduler: ignoring negotiation-needed from {:?}", role);
                }
            }
            ConnectionEvent::IceCandidate(candidate) => match relay.deliver(candidate).await {
                Ok(delivery) => trace!("scheduler: {:?} candidate {:?}", role, delivery),
                Err(e) => {
                    warn!("scheduler: {}", e);
                    let _ = events.send(SessionEvent::RelayFailed(e));
                }
            },
            ConnectionEvent::Track(track_event) => {
                if role != Role::Remote {
                    debug!("scheduler: ignoring inbound track on {:?}", role);
                    continue;
                }
                let track_id = track_event.track.id().to_string();
                let kind = track_event.track.kind();
                if stream.add_track(track_event.track) {
                    info!("scheduler: received {:?} track '{}'", kind, track_id);
                    let _ = events.send(SessionEvent::TrackReceived {
                        track_id,
                        kind,
                        codec: track_event.codec,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{EngineKind, SessionConfig};
    use crate::error::{NegotiationError, StateError};
    use crate::media::MediaFrame;
    use crate::peer::SignalingState;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn context(candidates: usize) -> Arc<RtcContext> {
        let config = SessionConfig {
            loopback_candidates: candidates,
            step_timeout_ms: 2_000,
            ..Default::default()
        };
        RtcContext::initialize(config).unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event channel closed")
    }

    /// Collect events until `count` rounds have completed.
    async fn wait_rounds(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        count: usize,
    ) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        let mut completed = 0;
        while completed < count {
            let event = next_event(rx).await;
            match &event {
                SessionEvent::NegotiationCompleted(_) => completed += 1,
                SessionEvent::NegotiationFailed { error, .. } => panic!("round failed: {}", error),
                _ => {}
            }
            seen.push(event);
        }
        seen
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        wait_within(Duration::from_secs(5), condition).await
    }

    async fn wait_within<F: Fn() -> bool>(limit: Duration, condition: F) {
        tokio::time::timeout(limit, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_one_round_delivers_exactly_one_track() {
        init_logging();
        let ctx = context(2);
        let session = Session::start(&ctx, None).await.unwrap();
        let mut events = session.take_events().unwrap();
        assert!(session.take_events().is_none());

        session.add_local_video_track().await.unwrap();
        let mut seen = wait_rounds(&mut events, 1).await;
        wait_for(|| session.stream().len() == 1).await;

        // Track events may trail the round report; no further rounds without another change
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await
        {
            assert!(!matches!(event, SessionEvent::NegotiationCompleted(_)));
            seen.push(event);
        }

        let tracks = seen
            .iter()
            .filter(|e| matches!(e, SessionEvent::TrackReceived { .. }))
            .count();
        assert_eq!(tracks, 1);
        assert_eq!(session.stream().len(), 1);
        assert_eq!(session.stream().tracks()[0].id(), "video");
        assert_eq!(session.local().signaling_state(), SignalingState::Stable);
        assert_eq!(session.remote().signaling_state(), SignalingState::Stable);
        session.close().await;
    }

    #[tokio::test]
    async fn test_candidates_applied_on_both_sides() {
        init_logging();
        let ctx = context(3);
        let session = Session::start(&ctx, None).await.unwrap();
        let mut events = session.take_events().unwrap();
        session.add_local_video_track().await.unwrap();
        wait_rounds(&mut events, 1).await;

        let local = session.local().clone();
        let remote = session.remote().clone();
        wait_for(|| remote.candidates_applied() == 3 && local.candidates_applied() == 3).await;
        assert_eq!(session.relay().pending(Role::Remote).await, 0);
        assert_eq!(session.relay().pending(Role::Local).await, 0);
        session.close().await;
    }

    #[tokio::test]
    async fn test_one_round_per_distinct_media_change() {
        init_logging();
        let ctx = context(1);
        let session = Session::start(&ctx, None).await.unwrap();
        let mut events = session.take_events().unwrap();

        let first = Track::video("cam0", "s");
        assert!(session.add_local_track(first.clone()).await.unwrap());
        assert!(!session.add_local_track(first).await.unwrap());
        assert!(session.add_local_track(Track::video("cam1", "s")).await.unwrap());

        wait_rounds(&mut events, 2).await;
        let extra = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match events.recv().await {
                    Some(SessionEvent::NegotiationCompleted(report)) => return Some(report.round),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await;
        assert!(!matches!(extra, Ok(Some(_))), "unexpected third round");
        wait_for(|| session.stream().len() == 2).await;
        session.close().await;
    }

    #[tokio::test]
    async fn test_transceiver_triggers_round() {
        init_logging();
        let ctx = context(0);
        let session = Session::start(&ctx, None).await.unwrap();
        let mut events = session.take_events().unwrap();

        session
            .add_local_transceiver(TrackKind::Video, TransceiverDirection::SendOnly)
            .await
            .unwrap();
        let seen = wait_rounds(&mut events, 1).await;
        match seen.last() {
            Some(SessionEvent::NegotiationCompleted(report)) => assert_eq!(report.timings.len(), 6),
            other => panic!("unexpected {:?}", other),
        }
        // No track attached, so nothing is received
        assert!(session.stream().is_empty());
        session.close().await;
    }

    #[tokio::test]
    async fn test_frames_reach_render_target() {
        init_logging();
        let ctx = context(1);
        let target = RenderTarget::new("screen");
        let session = Session::start(&ctx, Some(target.clone())).await.unwrap();
        let mut events = session.take_events().unwrap();

        let track = session.add_local_video_track().await.unwrap();
        wait_rounds(&mut events, 1).await;
        wait_for(|| session.stream().len() == 1).await;

        for ts in 0..3u32 {
            assert!(track.push_frame(&MediaFrame::video(vec![0xAB; 16], ts * 3000)));
        }
        assert_eq!(target.frames_presented(), 3);
        assert_eq!(target.latest_frame().map(|f| f.timestamp), Some(6000));

        session.close().await;
        assert!(target.is_released());
    }

    #[tokio::test]
    async fn test_close_twice() {
        init_logging();
        let ctx = context(1);
        let target = RenderTarget::new("screen");
        let session = Session::start(&ctx, Some(target.clone())).await.unwrap();
        session.add_local_video_track().await.unwrap();

        assert!(session.close().await);
        assert!(!session.close().await);
        assert!(session.is_closed());
        assert!(session.local().is_closed());
        assert!(session.remote().is_closed());
        assert!(target.is_released());
        assert!(!session.renegotiate());

        assert!(ctx.shutdown());
        assert!(!ctx.shutdown());
    }

    #[tokio::test]
    async fn test_renegotiate_runs_another_round() {
        init_logging();
        let ctx = context(0);
        let session = Session::start(&ctx, None).await.unwrap();
        let mut events = session.take_events().unwrap();
        session.add_local_video_track().await.unwrap();
        wait_rounds(&mut events, 1).await;
        wait_for(|| session.stream().len() == 1).await;

        assert!(session.renegotiate());
        let seen = wait_rounds(&mut events, 1).await;
        match seen.last() {
            Some(SessionEvent::NegotiationCompleted(report)) => assert_eq!(report.round, 2),
            other => panic!("unexpected {:?}", other),
        }
        // Same media set, so no new track
        assert_eq!(session.stream().len(), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_renegotiate_after_failed_round() {
        init_logging();
        let ctx = context(0);
        let session = Session::start(&ctx, None).await.unwrap();
        let mut events = session.take_events().unwrap();

        // Remote already holds an offer, so the round aborts at SetRemoteOffer
        let early = session.local().create_offer().await.unwrap();
        session.remote().set_remote_description(early).await.unwrap();
        session.add_local_video_track().await.unwrap();

        let failed = loop {
            match next_event(&mut events).await {
                SessionEvent::NegotiationFailed { round, error } => break (round, error),
                SessionEvent::NegotiationCompleted(report) => {
                    panic!("round {} completed", report.round)
                }
                _ => {}
            }
        };
        assert_eq!(failed.0, 1);
        assert!(matches!(
            failed.1,
            NegotiationError::State(StateError::RemoteOfferAlreadySet { .. })
        ));
        assert_eq!(session.local().signaling_state(), SignalingState::Stable);
        assert_eq!(session.remote().signaling_state(), SignalingState::Stable);

        assert!(session.renegotiate());
        let seen = wait_rounds(&mut events, 1).await;
        match seen.last() {
            Some(SessionEvent::NegotiationCompleted(report)) => assert_eq!(report.round, 2),
            other => panic!("unexpected {:?}", other),
        }
        wait_for(|| session.stream().len() == 1).await;
        session.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_webrtc_engine_session() {
        init_logging();
        let config = SessionConfig {
            engine: EngineKind::WebRtc,
            step_timeout_ms: 5_000,
            ..Default::default()
        };
        let ctx = RtcContext::initialize(config).unwrap();
        let session = Session::start(&ctx, None).await.unwrap();
        let mut events = session.take_events().unwrap();

        let track = session.add_local_video_track().await.unwrap();
        wait_rounds(&mut events, 1).await;

        let local = session.local().clone();
        let remote = session.remote().clone();
        wait_within(Duration::from_secs(10), || {
            local.candidates_applied() > 0 && remote.candidates_applied() > 0
        })
        .await;

        // on_track fires with the first RTP packet, so keep the sender fed
        let feeder = tokio::spawn(async move {
            let mut ts = 0u32;
            loop {
                track.push_frame(&MediaFrame::video(vec![0x10; 200], ts));
                ts = ts.wrapping_add(3000);
                tokio::time::sleep(Duration::from_millis(33)).await;
            }
        });
        wait_within(Duration::from_secs(15), || session.stream().len() == 1).await;
        feeder.abort();

        assert_eq!(session.stream().len(), 1);
        assert_eq!(session.stream().tracks()[0].id(), "video");
        assert_eq!(local.signaling_state(), SignalingState::Stable);
        assert_eq!(remote.signaling_state(), SignalingState::Stable);
        session.close().await;
        ctx.shutdown();
    }

    #[tokio::test]
    async fn test_start_after_shutdown_fails() {
        let ctx = context(0);
        ctx.shutdown();
        assert!(Session::start(&ctx, None).await.is_err());
    }
}
