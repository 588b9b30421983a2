//! Peer connections and the engines behind them.

pub mod connection;
pub mod engine;
pub mod events;
pub mod loopback_engine;
pub mod webrtc_engine;

pub use connection::{Connection, SignalingState, Transceiver};
pub use engine::PeerEngine;
pub use events::{ConnectionEvent, EventReceiver, EventSender, EventSink, Role, TrackEvent};
pub use loopback_engine::{LoopbackEngine, LoopbackNetwork, LoopbackProbe};
pub use webrtc_engine::WebRtcEngine;
