//! One endpoint of the session.
//!
//! Wraps a `PeerEngine` and enforces the offer/answer sequence: every
//! precondition is checked before the engine is called, and state changes
//! only after the engine reports success.

use log::{debug, warn};
use parking_lot::Mutex;

use super::engine::PeerEngine;
use super::events::{ConnectionEvent, EventSink, Role};
use crate::description::{SdpKind, SessionDescription};
use crate::error::{EngineError, Result, StateError};
use crate::ice::Candidate;
use crate::media::{Track, TrackKind, TransceiverDirection};

/// Signaling state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Declared send/receive intent for a media kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transceiver {
    pub kind: TrackKind,
    pub direction: TransceiverDirection,
}

#[derive(Default)]
struct ConnectionState {
    signaling: SignalingState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    /// Descriptions in force when the connection last left `Stable`
    stable_descriptions: Option<(Option<SessionDescription>, Option<SessionDescription>)>,
    outbound_tracks: Vec<Track>,
    transceivers: Vec<Transceiver>,
    candidates_applied: u64,
}

pub struct Connection {
    role: Role,
    engine: Box<dyn PeerEngine>,
    events: EventSink,
    state: Mutex<ConnectionState>,
    /// Serializes engine operations; the state lock is never held across an await
    op_lock: tokio::sync::Mutex<()>,
}

impl Connection {
    pub fn new(role: Role, engine: Box<dyn PeerEngine>, events: EventSink) -> Self {
        Self {
            role,
            engine,
            events,
            state: Mutex::new(ConnectionState::default()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    pub fn has_remote_description(&self) -> bool {
        self.state.lock().remote_description.is_some()
    }

    pub fn outbound_tracks(&self) -> Vec<Track> {
        self.state.lock().outbound_tracks.clone()
    }

    pub fn transceivers(&self) -> Vec<Transceiver> {
        self.state.lock().transceivers.clone()
    }

    pub fn candidates_applied(&self) -> u64 {
        self.state.lock().candidates_applied
    }

    pub fn is_closed(&self) -> bool {
        self.signaling_state() == SignalingState::Closed
    }

    fn ensure_open(&self) -> Result<SignalingState> {
        match self.signaling_state() {
            SignalingState::Closed => Err(StateError::Closed { role: self.role }.into()),
            state => Ok(state),
        }
    }

    fn commit(&self, next: SignalingState, update: impl FnOnce(&mut ConnectionState)) {
        let mut st = self.state.lock();
        if next == SignalingState::Stable {
            st.stable_descriptions = None;
        } else if st.signaling == SignalingState::Stable {
            let snapshot = (st.local_description.clone(), st.remote_description.clone());
            st.stable_descriptions = Some(snapshot);
        }
        update(&mut st);
        st.signaling = next;
    }

    /// Produce an offer. Does not touch `local_description`.
    pub async fn create_offer(&self) -> Result<SessionDescription> {
        let _op = self.op_lock.lock().await;
        let state = self.ensure_open()?;
        if state != SignalingState::Stable {
            return Err(StateError::OfferNotAllowed { role: self.role, state }.into());
        }

        let offer = self.engine.create_offer().await?;
        if offer.kind() != SdpKind::Offer {
            let reason = format!("engine produced {} for create_offer", offer.kind());
            return Err(EngineError::InvalidDescription(reason).into());
        }
        debug!("{:?}: created offer ({} bytes)", self.role, offer.sdp().len());
        Ok(offer)
    }

    /// Produce an answer to the remote offer.
    pub async fn create_answer(&self) -> Result<SessionDescription> {
        let _op = self.op_lock.lock().await;
        let state = self.ensure_open()?;
        if state != SignalingState::HaveRemoteOffer {
            return Err(StateError::AnswerWithoutRemoteOffer { role: self.role, state }.into());
        }

        let answer = self.engine.create_answer().await?;
        if answer.kind() != SdpKind::Answer {
            let reason = format!("engine produced {} for create_answer", answer.kind());
            return Err(EngineError::InvalidDescription(reason).into());
        }
        debug!("{:?}: created answer ({} bytes)", self.role, answer.sdp().len());
        Ok(answer)
    }

    /// Apply a local description. Candidate gathering starts afterwards and
    /// reports through `ConnectionEvent::IceCandidate`.
    pub async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let state = self.ensure_open()?;
        let next = match (desc.kind(), state) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, _) => {
                let kind = if kind == SdpKind::Offer { "offer" } else { "answer" };
                let role = self.role;
                return Err(StateError::LocalDescriptionNotAllowed { role, kind, state }.into());
            }
        };

        self.engine.set_local_description(&desc).await?;

        self.commit(next, |st| st.local_description = Some(desc));
        debug!("{:?}: local description set, state {:?}", self.role, next);
        Ok(())
    }

    /// Apply a description produced by the peer.
    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let state = self.ensure_open()?;
        let next = match (desc.kind(), state) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Offer, SignalingState::HaveRemoteOffer) => {
                return Err(StateError::RemoteOfferAlreadySet { role: self.role }.into())
            }
            (SdpKind::Offer, _) => {
                return Err(StateError::OfferCollision { role: self.role }.into())
            }
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (SdpKind::Answer, _) => {
                return Err(StateError::AnswerWithoutLocalOffer { role: self.role }.into())
            }
        };

        self.engine.set_remote_description(&desc).await?;

        self.commit(next, |st| st.remote_description = Some(desc));
        debug!("{:?}: remote description set, state {:?}", self.role, next);
        Ok(())
    }

    /// Undo a half-applied offer/answer exchange.
    ///
    /// Restores the descriptions in force before the connection left
    /// `Stable`. Returns false if the connection was already stable.
    pub async fn rollback(&self) -> Result<bool> {
        let _op = self.op_lock.lock().await;
        if self.ensure_open()? == SignalingState::Stable {
            return Ok(false);
        }

        self.engine.rollback().await?;

        let mut st = self.state.lock();
        let (local, remote) = st.stable_descriptions.take().unwrap_or_default();
        st.local_description = local;
        st.remote_description = remote;
        let from = std::mem::replace(&mut st.signaling, SignalingState::Stable);
        debug!("{:?}: rolled back from {:?}", self.role, from);
        Ok(true)
    }

    /// Register an outbound track.
    ///
    /// Returns false, without firing negotiation-needed, if a track with the
    /// same id is already attached.
    pub async fn add_track(&self, track: Track) -> Result<bool> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;
        if self.state.lock().outbound_tracks.iter().any(|t| t.id() == track.id()) {
            debug!("{:?}: track '{}' already attached", self.role, track.id());
            return Ok(false);
        }

        self.engine.add_track(&track).await?;

        debug!("{:?}: added {:?} track '{}'", self.role, track.kind(), track.id());
        self.state.lock().outbound_tracks.push(track);
        self.events.emit(ConnectionEvent::NegotiationNeeded);
        Ok(true)
    }

    /// Declare send/receive intent for a media kind without attaching a track.
    pub async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;

        self.engine.add_transceiver(kind, direction).await?;

        debug!("{:?}: added {:?} transceiver ({})", self.role, kind, direction.sdp_attribute());
        self.state.lock().transceivers.push(Transceiver { kind, direction });
        self.events.emit(ConnectionEvent::NegotiationNeeded);
        Ok(())
    }

    /// Apply a candidate gathered by the peer.
    pub async fn add_ice_candidate(&self, candidate: &Candidate) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.ensure_open()?;
        if candidate.origin == self.role {
            let origin = candidate.origin;
            return Err(StateError::CandidateFromSelf { role: self.role, origin }.into());
        }
        if !self.has_remote_description() {
            return Err(StateError::NoRemoteDescription { role: self.role }.into());
        }

        self.engine.add_ice_candidate(candidate).await?;

        self.state.lock().candidates_applied += 1;
        Ok(())
    }

    /// Close the connection. Only the first call reaches the engine.
    ///
    /// Waits for an in-flight operation to finish first. Returns true if
    /// this call performed the close.
    pub async fn close(&self) -> bool {
        let _op = self.op_lock.lock().await;
        {
            let mut st = self.state.lock();
            if st.signaling == SignalingState::Closed {
                return false;
            }
            st.signaling = SignalingState::Closed;
            st.outbound_tracks.clear();
        }

        if let Err(e) = self.engine.close().await {
            warn!("{:?}: engine close failed: {}", self.role, e);
        }
        debug!("{:?}: closed", self.role);
        true
    }
}
