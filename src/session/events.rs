use crate::codec::VideoCodec;
use crate::error::{NegotiationError, RelayError};
use crate::media::TrackKind;
use crate::negotiation::RoundReport;

/// Notifications published to the host while a session runs
#[derive(Debug, Clone)]
pub enum SessionEvent {
    NegotiationCompleted(RoundReport),
    /// Round aborted; the host may call `Session::renegotiate`
    NegotiationFailed { round: u64, error: NegotiationError },
    RelayFailed(RelayError),
    /// A track joined the receive stream
    TrackReceived {
        track_id: String,
        kind: TrackKind,
        codec: Option<VideoCodec>,
    },
}
