//! `PeerEngine` backed by a webrtc-rs `RTCPeerConnection`.
//!
//! Candidates and inbound tracks are forwarded to the connection's event
//! sink. Outbound tracks are fed through a `TrackLocalStaticSample` by a
//! writer task per track.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::engine::PeerEngine;
use super::events::{ConnectionEvent, EventSink, Role, TrackEvent};
use crate::codec::VideoCodec;
use crate::description::SessionDescription;
use crate::error::EngineError;
use crate::ice::Candidate;
use crate::media::{
    MediaFrame, Track, TrackKind, TransceiverDirection, DEFAULT_VIDEO_FRAME_DURATION,
};

type TaskList = Arc<Mutex<Vec<JoinHandle<()>>>>;

pub struct WebRtcEngine {
    peer_connection: Arc<RTCPeerConnection>,
    codec: VideoCodec,
    events: EventSink,
    tasks: TaskList,
}

impl WebRtcEngine {
    /// Create the peer connection and register its handlers.
    pub async fn new(
        api: &API,
        config: RTCConfiguration,
        codec: VideoCodec,
        events: EventSink,
    ) -> Result<Self, EngineError> {
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);
        let role = events.role();
        let tasks: TaskList = Arc::new(Mutex::new(Vec::new()));

        let ice_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            Box::pin(async move {
                // None marks end of gathering
                let Some(c) = candidate else {
                    debug!("{:?}: ICE gathering complete", events.role());
                    return;
                };
                match Candidate::from_rtc(events.role(), &c) {
                    Ok(candidate) => {
                        events.emit(ConnectionEvent::IceCandidate(candidate));
                    }
                    Err(e) => {
                        warn!("{:?}: dropping unserializable candidate: {}", events.role(), e)
                    }
                }
            })
        }));

        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            info!("{:?}: peer connection state {}", role, s);
            Box::pin(async {})
        }));

        let track_events = events.clone();
        let track_tasks = tasks.clone();
        peer_connection.on_track(Box::new(
            move |remote: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                let Some(kind) = TrackKind::from_rtp_codec_type(remote.kind()) else {
                    warn!("{:?}: on_track with unknown media kind", events.role());
                    return Box::pin(async {});
                };

                let codec = VideoCodec::from_mime_type(&remote.codec().capability.mime_type);
                let track = Track::new(kind, &remote.id(), &remote.stream_id());
                debug!(
                    "{:?}: inbound {:?} track '{}' ({:?})",
                    events.role(),
                    kind,
                    track.id(),
                    codec
                );

                let reader = tokio::spawn(spawn_track_reader(remote, track.clone()));
                track_tasks.lock().push(reader);

                events.emit(ConnectionEvent::Track(TrackEvent { track, codec }));
                Box::pin(async {})
            },
        ));

        Ok(Self {
            peer_connection,
            codec,
            events,
            tasks,
        })
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.peer_connection.create_offer(None).await?;
        SessionDescription::from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.peer_connection.create_answer(None).await?;
        SessionDescription::from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        self.peer_connection.set_local_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        self.peer_connection.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), EngineError> {
        // webrtc-rs parses the rollback SDP, so reuse the pending description
        let pc = &self.peer_connection;
        let (pending, local) = match pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => (pc.pending_local_description().await, true),
            RTCSignalingState::HaveRemoteOffer => (pc.pending_remote_description().await, false),
            _ => return Ok(()),
        };

        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.map(|d| d.sdp).unwrap_or_default();

        if local {
            pc.set_local_description(rollback).await?;
        } else {
            pc.set_remote_description(rollback).await?;
        }
        let side = if local { "local" } else { "remote" };
        debug!("{:?}: rolled back pending {} offer", self.events.role(), side);
        Ok(())
    }

    async fn add_track(&self, track: &Track) -> Result<(), EngineError> {
        if track.kind() != TrackKind::Video {
            return Err(EngineError::UnsupportedTrack(format!(
                "{:?} track '{}' (only video is encoded)",
                track.kind(),
                track.id()
            )));
        }

        let local = Arc::new(TrackLocalStaticSample::new(
            self.codec.capability(),
            track.id().to_owned(),
            track.stream_id().to_owned(),
        ));

        self.peer_connection
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel::<MediaFrame>();
        track.on_frame(Arc::new(move |frame: &MediaFrame| {
            let _ = tx.send(frame.clone());
        }));

        let writer = tokio::spawn(spawn_track_writer(local, rx, self.events.role()));
        self.tasks.lock().push(writer);
        Ok(())
    }

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), EngineError> {
        self.peer_connection
            .add_transceiver_from_kind(
                kind.to_rtp_codec_type(),
                Some(RTCRtpTransceiverInit {
                    direction: direction.to_rtc(),
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &Candidate) -> Result<(), EngineError> {
        self.peer_connection.add_ice_candidate(candidate.to_rtc_init()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.peer_connection.close().await?;
        Ok(())
    }
}

/// Write frames pushed into an outbound track as samples.
async fn spawn_track_writer(
    local: Arc<TrackLocalStaticSample>,
    mut rx: mpsc::UnboundedReceiver<MediaFrame>,
    role: Role,
) {
    let mut frames_sent: u64 = 0;
    while let Some(frame) = rx.recv().await {
        let sample = Sample {
            data: frame.data,
            duration: frame.duration,
            ..Default::default()
        };
        if let Err(e) = local.write_sample(&sample).await {
            warn!("{:?}: write sample error: {}", role, e);
            break;
        }
        frames_sent += 1;
    }
    debug!("{:?}: track writer exiting after {} frames", role, frames_sent);
}

/// Read RTP from an inbound track and republish payloads as frames.
async fn spawn_track_reader(remote: Arc<TrackRemote>, track: Track) {
    loop {
        match remote.read_rtp().await {
            Ok((packet, _attributes)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                let frame = MediaFrame {
                    kind: track.kind(),
                    data: packet.payload.clone(),
                    duration: DEFAULT_VIDEO_FRAME_DURATION,
                    timestamp: packet.header.timestamp,
                };
                track.push_frame(&frame);
            }
            Err(e) => {
                debug!("track '{}' reader exiting: {}", track.id(), e);
                break;
            }
        }
    }
    track.stop();
}
