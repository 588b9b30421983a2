//! Connection roles and the events a connection publishes.
//!
//! Engines never call back into the session directly: every event goes
//! through an unbounded channel tagged with the emitting role, and a single
//! scheduler task drains it.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::codec::VideoCodec;
use crate::ice::Candidate;
use crate::media::Track;

/// Identity of one of the two endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sender / offerer
    Local,
    /// Receiver / answerer
    Remote,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Local => Role::Remote,
            Role::Remote => Role::Local,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Role::Local => 0,
            Role::Remote => 1,
        }
    }
}

/// Inbound track announcement
#[derive(Debug, Clone)]
pub struct TrackEvent {
    pub track: Track,
    /// Negotiated video codec, if known
    pub codec: Option<VideoCodec>,
}

/// Events fired by a connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A locally gathered candidate, to be relayed to the peer
    IceCandidate(Candidate),
    /// The track/transceiver set changed and a new offer is required
    NegotiationNeeded,
    /// A remote track arrived
    Track(TrackEvent),
}

pub type EventSender = mpsc::UnboundedSender<(Role, ConnectionEvent)>;
pub type EventReceiver = mpsc::UnboundedReceiver<(Role, ConnectionEvent)>;

/// Role-tagged sending half of the connection event channel
#[derive(Clone)]
pub struct EventSink {
    role: Role,
    tx: EventSender,
}

impl EventSink {
    pub fn new(role: Role, tx: EventSender) -> Self {
        Self { role, tx }
    }

    /// Channel shared by both connections of a session
    pub fn channel() -> (EventSender, EventReceiver) {
        mpsc::unbounded_channel()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Publish an event. Returns false if the scheduler is gone.
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        self.tx.send((self.role, event)).is_ok()
    }
}
