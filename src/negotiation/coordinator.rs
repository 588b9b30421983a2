//! Drives negotiation rounds from queued triggers.
//!
//! Triggers are processed in arrival order, one full round each. A trigger
//! that arrives mid-round waits until the machine is back in `Idle`.

use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Negotiator;
use crate::error::{NegotiationError, StateError};
use crate::session::SessionEvent;

/// Reason a round was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Local connection fired negotiation-needed
    NegotiationNeeded,
    /// Host re-triggered after a failure
    Manual,
}

pub struct Coordinator {
    tx: mpsc::UnboundedSender<Trigger>,
    handle: JoinHandle<()>,
}

impl Coordinator {
    /// Spawn the driver loop on the current runtime.
    pub fn spawn(negotiator: Negotiator, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(drive(negotiator, rx, events));
        Self { tx, handle }
    }

    /// Queue a round. Returns false once the driver has stopped.
    pub fn trigger(&self, trigger: Trigger) -> bool {
        self.tx.send(trigger).is_ok()
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Trigger> {
        self.tx.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the driver, abandoning any in-flight round
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn drive(
    mut negotiator: Negotiator,
    mut rx: mpsc::UnboundedReceiver<Trigger>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(trigger) = rx.recv().await {
        debug!("coordinator: {:?} -> round {}", trigger, negotiator.rounds_started() + 1);
        match negotiator.run_round().await {
            Ok(report) => {
                let _ = events.send(SessionEvent::NegotiationCompleted(report));
            }
            Err(e) => {
                let round = negotiator.rounds_started();
                error!("coordinator: round {} failed: {}", round, e);
                let closed = matches!(e, NegotiationError::State(StateError::Closed { .. }));
                let _ = events.send(SessionEvent::NegotiationFailed { round, error: e });
                if closed {
                    break;
                }
            }
        }
    }
    info!("coordinator: stopped after {} rounds", negotiator.rounds_started());
}
