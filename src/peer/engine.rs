//! Boundary to the external media/transport library.

use async_trait::async_trait;

use crate::description::SessionDescription;
use crate::error::EngineError;
use crate::ice::Candidate;
use crate::media::{Track, TrackKind, TransceiverDirection};

/// Operations a connection delegates to the media engine.
///
/// Sequencing rules are enforced by `Connection`; an engine only has to do
/// the work and report failures. Events (candidates, inbound tracks) are
/// published through the `EventSink` the engine was built with.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    /// Apply a local description and start gathering candidates.
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), EngineError>;

    /// Discard a pending local or remote offer and return to stable.
    /// Nothing to discard is not an error.
    async fn rollback(&self) -> Result<(), EngineError>;

    async fn add_track(&self, track: &Track) -> Result<(), EngineError>;

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: &Candidate) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}
