//! webrtc-loopback - two-peer WebRTC negotiation core
//!
//! Wires a sender (Local) and a receiver (Remote) connection in one process,
//! runs the offer/answer exchange as an explicit state machine, relays
//! trickled ICE candidates between them and hands the received video track
//! to a render target.
//!
//! Features:
//! - Offer/answer state machine with bounded per-step waits and timing reports
//! - Trickle ICE relay with buffer-and-flush per connection
//! - Queued negotiation triggers, one round per media change
//! - webrtc-rs engine (real ICE/DTLS/SRTP) or deterministic loopback engine
//! - Idempotent teardown of sessions, connections and render targets
//!
//! ```no_run
//! use webrtc_loopback::{RenderTarget, RtcContext, Session, SessionConfig};
//!
//! # async fn run() -> webrtc_loopback::Result<()> {
//! let context = RtcContext::initialize(SessionConfig::default())?;
//! let session = Session::start(&context, Some(RenderTarget::new("screen"))).await?;
//! let track = session.add_local_video_track().await?;
//! // ... push frames into `track` ...
//! session.close().await;
//! context.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod description;
pub mod error;
pub mod ice;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;

pub use codec::VideoCodec;
pub use config::{google_stun_servers, EngineKind, IceServerConfig, SessionConfig};
pub use context::RtcContext;
pub use description::{SdpKind, SessionDescription};
pub use error::{EngineError, Error, NegotiationError, RelayError, Result, StateError};
pub use ice::{Candidate, CandidateRelay, Delivery, FlushReport};
pub use media::{
    attach_video_output, MediaFrame, MediaStream, RenderTarget, Track, TrackKind,
    TransceiverDirection, DEFAULT_VIDEO_FRAME_DURATION,
};
pub use negotiation::{NegotiationState, NegotiationStep, Negotiator, RoundReport, StepTiming};
pub use peer::{Connection, ConnectionEvent, PeerEngine, Role, SignalingState};
pub use session::{Session, SessionEvent};
