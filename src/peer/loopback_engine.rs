//! In-process `PeerEngine`.
//!
//! Produces real SDP (via `webrtc::sdp`) describing its media sections,
//! gathers deterministic host candidates and hands frames from a published
//! outbound track straight to the matching inbound track. Both connections
//! of a session share one `LoopbackNetwork`.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, trace};
use parking_lot::Mutex;
use webrtc::sdp::description::media::MediaDescription;
use webrtc::sdp::description::session::SessionDescription as SdpSession;

use super::engine::PeerEngine;
use super::events::{ConnectionEvent, EventSink, TrackEvent};
use crate::codec::{VideoCodec, VIDEO_CLOCK_RATE};
use crate::description::{SdpKind, SessionDescription};
use crate::error::EngineError;
use crate::ice::Candidate;
use crate::media::{MediaFrame, Track, TrackKind, TransceiverDirection};

const FIRST_PORT: u16 = 50_000;
const HOST_PRIORITY: u32 = 2_130_706_431;

const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Shared medium between loopback engines: published outbound tracks and
/// port allocation.
pub struct LoopbackNetwork {
    published: Mutex<HashMap<String, Track>>,
    next_port: AtomicU16,
    next_agent: AtomicU32,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            published: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(FIRST_PORT),
            next_agent: AtomicU32::new(1),
        })
    }

    fn publish(&self, track: &Track) {
        self.published.lock().insert(track.id().to_string(), track.clone());
    }

    fn unpublish(&self, track: &Track) {
        let mut published = self.published.lock();
        if published.get(track.id()).is_some_and(|t| t.same_track(track)) {
            published.remove(track.id());
        }
    }

    fn source(&self, track_id: &str) -> Option<Track> {
        self.published.lock().get(track_id).cloned()
    }

    fn allocate_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate_agent(&self) -> u32 {
        self.next_agent.fetch_add(1, Ordering::Relaxed)
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }

    /// Drop every published track
    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

struct LocalSection {
    mid: Option<String>,
    kind: TrackKind,
    direction: TransceiverDirection,
    track: Option<Track>,
}

#[derive(Debug, Clone)]
struct RemoteSection {
    mid: String,
    kind: TrackKind,
    direction: TransceiverDirection,
    /// (stream id, track id) from `a=msid`
    msid: Option<(String, String)>,
    codecs: Vec<VideoCodec>,
}

#[derive(Default)]
struct LoopbackState {
    sections: Vec<LocalSection>,
    remote: Vec<RemoteSection>,
    /// Remote sections in force before a pending remote offer
    stable_remote: Option<Vec<RemoteSection>>,
    next_mid: u32,
    gathered: bool,
    applied_candidates: Vec<Candidate>,
    surfaced: HashSet<String>,
    inbound: Vec<Track>,
    rollbacks: usize,
    close_calls: usize,
    closed: bool,
}

impl LoopbackState {
    fn section_by_mid(&self, mid: &str) -> Option<&LocalSection> {
        self.sections.iter().find(|s| s.mid.as_deref() == Some(mid))
    }

    fn first_mid(&self) -> String {
        self.sections
            .iter()
            .find_map(|s| s.mid.clone())
            .unwrap_or_else(|| "0".to_string())
    }
}

/// Read-only view of a loopback engine's internals, usable after the engine
/// has been moved into a connection.
#[derive(Clone)]
pub struct LoopbackProbe {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackProbe {
    /// Remote candidates applied so far, in order
    pub fn applied_candidates(&self) -> Vec<Candidate> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    pub fn inbound_tracks(&self) -> Vec<Track> {
        self.state.lock().inbound.clone()
    }

    pub fn section_count(&self) -> usize {
        self.state.lock().sections.len()
    }
}

pub struct LoopbackEngine {
    events: EventSink,
    network: Arc<LoopbackNetwork>,
    candidate_count: usize,
    codec: VideoCodec,
    ufrag: String,
    pwd: String,
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackEngine {
    pub fn new(events: EventSink, network: Arc<LoopbackNetwork>, candidate_count: usize) -> Self {
        let agent = network.allocate_agent();
        Self {
            events,
            network,
            candidate_count,
            codec: VideoCodec::default(),
            ufrag: format!("lb{:06}", agent),
            pwd: format!("loopbackpassword{:08}", agent),
            state: Arc::new(Mutex::new(LoopbackState::default())),
        }
    }

    /// Preferred video codec, listed first in offers
    pub fn with_codec(mut self, codec: VideoCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn probe(&self) -> LoopbackProbe {
        LoopbackProbe {
            state: self.state.clone(),
        }
    }

    fn codec_preferences(&self) -> Vec<VideoCodec> {
        let mut codecs = vec![self.codec];
        codecs.extend(VideoCodec::supported().into_iter().filter(|c| *c != self.codec));
        codecs
    }

    fn media_section(
        &self,
        kind: TrackKind,
        mid: &str,
        direction: TransceiverDirection,
        track: Option<&Track>,
        codecs: &[VideoCodec],
    ) -> MediaDescription {
        let mut media =
            MediaDescription::new_jsep_media_description(kind.as_str().to_owned(), vec![])
                .with_value_attribute("mid".to_owned(), mid.to_owned())
                .with_value_attribute("ice-ufrag".to_owned(), self.ufrag.clone())
                .with_value_attribute("ice-pwd".to_owned(), self.pwd.clone())
                .with_property_attribute(direction.sdp_attribute().to_owned());

        media = match kind {
            TrackKind::Video => codecs.iter().fold(media, |media, codec| {
                media.with_codec(
                    codec.payload_type(),
                    codec.encoding_name().to_owned(),
                    VIDEO_CLOCK_RATE,
                    0,
                    codec.sdp_fmtp_line().to_owned(),
                )
            }),
            TrackKind::Audio => media.with_codec(
                OPUS_PAYLOAD_TYPE,
                "opus".to_owned(),
                48_000,
                2,
                "minptime=10;useinbandfec=1".to_owned(),
            ),
        };

        match track {
            Some(track) if direction.can_send() => media.with_value_attribute(
                "msid".to_owned(),
                format!("{} {}", track.stream_id(), track.id()),
            ),
            _ => media,
        }
    }

    fn render(&self, sections: Vec<MediaDescription>, mids: &[String]) -> String {
        let mut sdp = SdpSession::new_jsep_session_description(false);
        if !mids.is_empty() {
            let group = format!("BUNDLE {}", mids.join(" "));
            sdp = sdp.with_value_attribute("group".to_owned(), group);
        }
        sections.into_iter().fold(sdp, |sdp, media| sdp.with_media(media)).marshal()
    }

    /// Hook an inbound track up to its published source and announce it.
    fn surface(&self, section: &RemoteSection) -> Option<TrackEvent> {
        let (stream_id, track_id) = section.msid.clone()?;
        let track = Track::new(section.kind, &track_id, &stream_id);

        match self.network.source(&track_id) {
            Some(source) => {
                let sink = track.clone();
                source.on_frame(Arc::new(move |frame: &MediaFrame| {
                    sink.push_frame(frame);
                }));
            }
            None => debug!("{:?}: no published source for '{}'", self.events.role(), track_id),
        }

        Some(TrackEvent {
            track,
            codec: section.codecs.first().copied(),
        })
    }
}

fn parse_sections(sdp: &str) -> Result<Vec<RemoteSection>, EngineError> {
    let mut reader = Cursor::new(sdp.as_bytes());
    let parsed = SdpSession::unmarshal(&mut reader)
        .map_err(|e| EngineError::InvalidDescription(e.to_string()))?;

    let mut sections = Vec::with_capacity(parsed.media_descriptions.len());
    for media in &parsed.media_descriptions {
        let media_type = &media.media_name.media;
        let kind = TrackKind::from_media_type(media_type).ok_or_else(|| {
            EngineError::InvalidDescription(format!("unsupported media type '{}'", media_type))
        })?;

        let mut mid = None;
        let mut msid = None;
        let mut direction = TransceiverDirection::SendRecv;
        let mut codecs = Vec::new();

        for attr in &media.attributes {
            match (attr.key.as_str(), attr.value.as_deref()) {
                ("mid", Some(value)) => mid = Some(value.to_string()),
                ("msid", Some(value)) => {
                    let mut parts = value.split_whitespace();
                    if let (Some(stream), Some(track)) = (parts.next(), parts.next()) {
                        msid = Some((stream.to_string(), track.to_string()));
                    }
                }
                ("rtpmap", Some(value)) => {
                    let encoding = value.split_whitespace().nth(1);
                    if let Some(codec) = encoding.and_then(VideoCodec::from_encoding_name) {
                        codecs.push(codec);
                    }
                }
                (key, None) => {
                    if let Some(d) = TransceiverDirection::from_sdp_attribute(key) {
                        direction = d;
                    }
                }
                _ => {}
            }
        }

        let mid = mid.ok_or_else(|| {
            EngineError::InvalidDescription("media section without a=mid".to_string())
        })?;
        sections.push(RemoteSection {
            mid,
            kind,
            direction,
            msid,
            codecs,
        });
    }
    Ok(sections)
}

#[async_trait]
impl PeerEngine for LoopbackEngine {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(EngineError::Closed);
        }

        for i in 0..st.sections.len() {
            if st.sections[i].mid.is_none() {
                let mid = st.next_mid.to_string();
                st.next_mid += 1;
                st.sections[i].mid = Some(mid);
            }
        }

        let codecs = self.codec_preferences();
        let mut mids = Vec::with_capacity(st.sections.len());
        let mut media = Vec::with_capacity(st.sections.len());
        for section in &st.sections {
            let mid = section.mid.clone().unwrap_or_default();
            media.push(self.media_section(
                section.kind,
                &mid,
                section.direction,
                section.track.as_ref(),
                &codecs,
            ));
            mids.push(mid);
        }

        Ok(SessionDescription::offer(self.render(media, &mids)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let st = self.state.lock();
        if st.closed {
            return Err(EngineError::Closed);
        }

        let mut mids = Vec::with_capacity(st.remote.len());
        let mut media = Vec::with_capacity(st.remote.len());
        for remote in &st.remote {
            let local = st.section_by_mid(&remote.mid).ok_or_else(|| {
                let reason = format!("no local section bound to mid {}", remote.mid);
                EngineError::InvalidDescription(reason)
            })?;
            let direction = remote.direction.answer_to(local.direction);
            // First offered codec we support
            let codecs: Vec<VideoCodec> = remote.codecs.iter().copied().take(1).collect();
            let codecs = if codecs.is_empty() { vec![self.codec] } else { codecs };
            media.push(self.media_section(
                remote.kind,
                &remote.mid,
                direction,
                local.track.as_ref(),
                &codecs,
            ));
            mids.push(remote.mid.clone());
        }

        Ok(SessionDescription::answer(self.render(media, &mids)))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        parse_sections(desc.sdp())?;

        let (mid, already_gathered) = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(EngineError::Closed);
            }
            let gathered = st.gathered;
            st.gathered = true;
            (st.first_mid(), gathered)
        };

        if already_gathered {
            return Ok(());
        }

        let role = self.events.role();
        for i in 0..self.candidate_count {
            let port = self.network.allocate_port();
            let line = format!(
                "candidate:{} 1 udp {} 127.0.0.1 {} typ host",
                i + 1,
                HOST_PRIORITY - i as u32,
                port
            );
            trace!("{:?}: gathered {}", role, line);
            let candidate = Candidate::new(role, &line, Some(&mid), Some(0));
            self.events.emit(ConnectionEvent::IceCandidate(candidate));
        }
        debug!("{:?}: gathered {} host candidates", role, self.candidate_count);
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), EngineError> {
        let remote = parse_sections(desc.sdp())?;

        let mut announce = Vec::new();
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(EngineError::Closed);
            }

            for section in &remote {
                let local_direction = match desc.kind() {
                    SdpKind::Offer => {
                        if st.section_by_mid(&section.mid).is_none() {
                            let unbound = st
                                .sections
                                .iter()
                                .position(|s| s.mid.is_none() && s.kind == section.kind);
                            match unbound {
                                Some(i) => st.sections[i].mid = Some(section.mid.clone()),
                                None => st.sections.push(LocalSection {
                                    mid: Some(section.mid.clone()),
                                    kind: section.kind,
                                    direction: TransceiverDirection::RecvOnly,
                                    track: None,
                                }),
                            }
                        }
                        st.section_by_mid(&section.mid)
                            .map(|local| section.direction.answer_to(local.direction))
                    }
                    SdpKind::Answer => st.section_by_mid(&section.mid).map(|local| local.direction),
                };

                let receives = local_direction.is_some_and(|d| d.can_receive())
                    && section.direction.can_send();
                if let (true, Some((_, track_id))) = (receives, &section.msid) {
                    if st.surfaced.insert(track_id.clone()) {
                        announce.push(section.clone());
                    }
                }
            }
            match desc.kind() {
                SdpKind::Offer => {
                    let previous = std::mem::replace(&mut st.remote, remote);
                    st.stable_remote = Some(previous);
                }
                SdpKind::Answer => {
                    st.remote = remote;
                    st.stable_remote = None;
                }
            }
        }

        for section in &announce {
            if let Some(event) = self.surface(section) {
                self.state.lock().inbound.push(event.track.clone());
                self.events.emit(ConnectionEvent::Track(event));
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), EngineError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(EngineError::Closed);
        }
        // Section bindings and surfaced tracks survive; only the pending offer goes
        if let Some(previous) = st.stable_remote.take() {
            st.remote = previous;
        }
        st.rollbacks += 1;
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

        let mut st = self.state.lock();
        if st.closed {
            return Err(EngineError::Closed);
        }
        self.network.publish(track);
        st.sections.push(LocalSection {
            mid: None,
            kind: track.kind(),
            direction: TransceiverDirection::SendRecv,
            track: Some(track.clone()),
        });
        Ok(())
    }

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), EngineError> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(EngineError::Closed);
        }
        st.sections.push(LocalSection {
            mid: None,
            kind,
            direction,
            track: None,
        });
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &Candidate) -> Result<(), EngineError> {
        let fields: Vec<&str> = candidate.candidate.split_whitespace().collect();
        if fields.len() < 8 || !fields[0].starts_with("candidate:") {
            return Err(EngineError::InvalidDescription(format!(
                "malformed candidate '{}'",
                candidate.candidate
            )));
        }

        let mut st = self.state.lock();
        if st.closed {
            return Err(EngineError::Closed);
        }
        st.applied_candidates.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut st = self.state.lock();
        st.close_calls += 1;
        if st.closed {
            return Ok(());
        }
        st.closed = true;

        for section in &st.sections {
            if let Some(track) = &section.track {
                self.network.unpublish(track);
            }
        }
        for track in st.inbound.drain(..) {
            track.stop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{EventReceiver, Role};

    fn engine(
        role: Role,
        network: &Arc<LoopbackNetwork>,
        candidates: usize,
    ) -> (LoopbackEngine, EventReceiver) {
        let (tx, rx) = EventSink::channel();
        (LoopbackEngine::new(EventSink::new(role, tx), network.clone(), candidates), rx)
    }

    #[tokio::test]
    async fn test_offer_lists_preferred_codec_first() {
        let network = LoopbackNetwork::new();
        let (local, _rx) = engine(Role::Local, &network, 0);
        let local = local.with_codec(VideoCodec::H264);
        local.add_track(&Track::video("cam", "s")).await.unwrap();

        let offer = local.create_offer().await.unwrap();
        let sections = parse_sections(offer.sdp()).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].mid, "0");
        assert_eq!(sections[0].direction, TransceiverDirection::SendRecv);
        assert_eq!(sections[0].codecs[0], VideoCodec::H264);
        assert_eq!(sections[0].msid, Some(("s".to_string(), "cam".to_string())));
    }

    #[tokio::test]
    async fn test_answer_is_recvonly_and_surfaces_track_once() {
        let network = LoopbackNetwork::new();
        let (local, _local_rx) = engine(Role::Local, &network, 0);
        let (remote, mut remote_rx) = engine(Role::Remote, &network, 0);
        remote
            .add_transceiver(TrackKind::Video, TransceiverDirection::RecvOnly)
            .await
            .unwrap();
        local.add_track(&Track::video("cam", "s")).await.unwrap();

        let offer = local.create_offer().await.unwrap();
        remote.set_remote_description(&offer).await.unwrap();
        remote.set_remote_description(&offer).await.unwrap();

        let answer = remote.create_answer().await.unwrap();
        let sections = parse_sections(answer.sdp()).unwrap();
        assert_eq!(sections[0].direction, TransceiverDirection::RecvOnly);
        assert!(sections[0].msid.is_none());
        assert_eq!(remote.probe().section_count(), 1);

        let mut tracks = 0;
        while let Ok((_, event)) = remote_rx.try_recv() {
            if let ConnectionEvent::Track(event) = event {
                assert_eq!(event.track.id(), "cam");
                assert_eq!(event.codec, Some(VideoCodec::VP8));
                tracks += 1;
            }
        }
        assert_eq!(tracks, 1);
    }

    #[tokio::test]
    async fn test_frames_flow_from_source_to_inbound() {
        let network = LoopbackNetwork::new();
        let (local, _local_rx) = engine(Role::Local, &network, 0);
        let (remote, _remote_rx) = engine(Role::Remote, &network, 0);
        let source = Track::video("cam", "s");
        local.add_track(&source).await.unwrap();

        let offer = local.create_offer().await.unwrap();
        remote.set_remote_description(&offer).await.unwrap();

        let inbound = remote.probe().inbound_tracks();
        assert_eq!(inbound.len(), 1);
        source.push_frame(&MediaFrame::video(vec![1u8, 2], 90));
        assert_eq!(inbound[0].stats().frames.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_candidates_gathered_on_first_local_description() {
        let network = LoopbackNetwork::new();
        let (local, mut rx) = engine(Role::Local, &network, 3);
        local.add_track(&Track::video("cam", "s")).await.unwrap();
        let offer = local.create_offer().await.unwrap();
        local.set_local_description(&offer).await.unwrap();
        local.set_local_description(&offer).await.unwrap();

        let mut ports = Vec::new();
        while let Ok((role, ConnectionEvent::IceCandidate(c))) = rx.try_recv() {
            assert_eq!(role, Role::Local);
            assert_eq!(c.origin, Role::Local);
            assert_eq!(c.sdp_mid.as_deref(), Some("0"));
            ports.push(c.candidate.split_whitespace().nth(5).unwrap().to_string());
        }
        assert_eq!(ports.len(), 3);
        ports.dedup();
        assert_eq!(ports.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_candidate_rejected() {
        let network = LoopbackNetwork::new();
        let (remote, _rx) = engine(Role::Remote, &network, 0);
        let bogus = Candidate::new(Role::Local, "not a candidate", None, None);
        assert!(matches!(
            remote.add_ice_candidate(&bogus).await,
            Err(EngineError::InvalidDescription(_))
        ));
        assert!(remote.probe().applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_discards_pending_remote_offer() {
        let network = LoopbackNetwork::new();
        let (local, _local_rx) = engine(Role::Local, &network, 0);
        let (remote, _remote_rx) = engine(Role::Remote, &network, 0);
        local.add_track(&Track::video("cam", "s")).await.unwrap();
        let offer = local.create_offer().await.unwrap();

        remote.set_remote_description(&offer).await.unwrap();
        remote.rollback().await.unwrap();
        assert_eq!(remote.probe().rollbacks(), 1);
        let answer = remote.create_answer().await.unwrap();
        assert!(parse_sections(answer.sdp()).unwrap().is_empty());

        // The same offer binds to the section created the first time
        remote.set_remote_description(&offer).await.unwrap();
        let answer = remote.create_answer().await.unwrap();
        assert_eq!(parse_sections(answer.sdp()).unwrap().len(), 1);
        assert_eq!(remote.probe().section_count(), 1);
        assert_eq!(remote.probe().inbound_tracks().len(), 1);
    }

    #[tokio::test]
    async fn test_close_unpublishes_and_stops_inbound() {
        let network = LoopbackNetwork::new();
        let (local, _rx) = engine(Role::Local, &network, 0);
        local.add_track(&Track::video("cam", "s")).await.unwrap();
        assert_eq!(network.published_count(), 1);

        local.close().await.unwrap();
        local.close().await.unwrap();
        assert_eq!(network.published_count(), 0);
        assert_eq!(local.probe().close_calls(), 2);
        assert!(matches!(local.create_offer().await, Err(EngineError::Closed)));
    }
}
