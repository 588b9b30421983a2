//! Error taxonomy for the negotiation core.
//!
//! - `StateError`: an operation was invoked out of order (caller bug, never retried)
//! - `NegotiationError`: a round step failed or timed out (host may re-trigger)
//! - `RelayError`: a candidate could not be handed to its peer
//! - `EngineError`: the underlying media/transport library reported a failure

use thiserror::Error;

use crate::negotiation::NegotiationStep;
use crate::peer::{Role, SignalingState};

/// Operation invoked in a state that violates the offer/answer sequence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("{role:?}: cannot create an offer in state {state:?}")]
    OfferNotAllowed { role: Role, state: SignalingState },

    #[error("{role:?}: cannot create an answer without a remote offer (state {state:?})")]
    AnswerWithoutRemoteOffer { role: Role, state: SignalingState },

    #[error("{role:?}: cannot set local {kind} in state {state:?}")]
    LocalDescriptionNotAllowed {
        role: Role,
        kind: &'static str,
        state: SignalingState,
    },

    #[error("{role:?}: cannot apply a remote answer without a local offer")]
    AnswerWithoutLocalOffer { role: Role },

    #[error("{role:?}: a remote offer is already set for this round")]
    RemoteOfferAlreadySet { role: Role },

    #[error("{role:?}: cannot apply a remote offer while holding a local offer")]
    OfferCollision { role: Role },

    #[error("{role:?}: cannot add an ICE candidate before a remote description is set")]
    NoRemoteDescription { role: Role },

    #[error("{role:?}: candidate from {origin:?} cannot be applied to its own connection")]
    CandidateFromSelf { role: Role, origin: Role },

    #[error("{role:?}: connection is closed")]
    Closed { role: Role },

    #[error("media context has been shut down")]
    ContextShutDown,

    #[error("negotiation step {step:?} cannot run from state {state}")]
    UnexpectedStep { step: NegotiationStep, state: &'static str },
}

/// Failure reported by the external media/transport library.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Unsupported track: {0}")]
    UnsupportedTrack(String),

    #[error("Engine is closed")]
    Closed,

    #[error("{0}")]
    Library(String),
}

impl From<webrtc::Error> for EngineError {
    fn from(e: webrtc::Error) -> Self {
        EngineError::Library(e.to_string())
    }
}

/// A negotiation round was aborted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("negotiation step {step:?} failed: {reason}")]
    Failed { step: NegotiationStep, reason: String },

    #[error("negotiation step {step:?} timed out")]
    Timeout { step: NegotiationStep },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Candidate relay failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("candidate from {origin:?} dropped: {target:?} connection has been torn down")]
    PeerClosed { origin: Role, target: Role },

    #[error("candidate from {origin:?} rejected by {target:?}: {reason}")]
    Rejected {
        origin: Role,
        target: Role,
        reason: String,
    },
}

/// Crate-level error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
