//! Offer/answer round state machine.
//!
//! ```text
//! Idle -> OfferCreated -> LocalOfferSet -> RemoteOfferSet
//!      -> AnswerCreated -> RemoteLocalAnswerSet -> LocalRemoteAnswerSet -> Idle
//! ```
//!
//! `Negotiator::step` performs exactly one transition and must complete
//! before the next one starts. Any failure aborts the round, rolls both
//! connections back to `Stable` and resets the machine to `Idle`.

pub mod coordinator;

pub use coordinator::{Coordinator, Trigger};

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::description::SessionDescription;
use crate::error::{Error, NegotiationError, RelayError, StateError};
use crate::ice::CandidateRelay;
use crate::peer::{Connection, Role};

/// One library call of a negotiation round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationStep {
    CreateOffer,
    SetLocalOffer,
    SetRemoteOffer,
    CreateAnswer,
    SetLocalAnswer,
    SetRemoteAnswer,
}

impl NegotiationStep {
    /// Connection the step operates on
    pub fn target(self) -> Role {
        match self {
            NegotiationStep::CreateOffer
            | NegotiationStep::SetLocalOffer
            | NegotiationStep::SetRemoteAnswer => Role::Local,
            NegotiationStep::SetRemoteOffer
            | NegotiationStep::CreateAnswer
            | NegotiationStep::SetLocalAnswer => Role::Remote,
        }
    }
}

/// Round progress. Descriptions are carried by value between steps.
#[derive(Debug, Clone, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    OfferCreated {
        offer: SessionDescription,
    },
    LocalOfferSet {
        offer: SessionDescription,
    },
    RemoteOfferSet {
        offer: SessionDescription,
    },
    AnswerCreated {
        offer: SessionDescription,
        answer: SessionDescription,
    },
    RemoteLocalAnswerSet {
        offer: SessionDescription,
        answer: SessionDescription,
    },
    LocalRemoteAnswerSet {
        offer: SessionDescription,
        answer: SessionDescription,
    },
}

impl NegotiationState {
    pub fn name(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "Idle",
            NegotiationState::OfferCreated { .. } => "OfferCreated",
            NegotiationState::LocalOfferSet { .. } => "LocalOfferSet",
            NegotiationState::RemoteOfferSet { .. } => "RemoteOfferSet",
            NegotiationState::AnswerCreated { .. } => "AnswerCreated",
            NegotiationState::RemoteLocalAnswerSet { .. } => "RemoteLocalAnswerSet",
            NegotiationState::LocalRemoteAnswerSet { .. } => "LocalRemoteAnswerSet",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, NegotiationState::Idle)
    }

    /// Step the next transition will run, if any
    pub fn next_step(&self) -> Option<NegotiationStep> {
        match self {
            NegotiationState::Idle => Some(NegotiationStep::CreateOffer),
            NegotiationState::OfferCreated { .. } => Some(NegotiationStep::SetLocalOffer),
            NegotiationState::LocalOfferSet { .. } => Some(NegotiationStep::SetRemoteOffer),
            NegotiationState::RemoteOfferSet { .. } => Some(NegotiationStep::CreateAnswer),
            NegotiationState::AnswerCreated { .. } => Some(NegotiationStep::SetLocalAnswer),
            NegotiationState::RemoteLocalAnswerSet { .. } => Some(NegotiationStep::SetRemoteAnswer),
            NegotiationState::LocalRemoteAnswerSet { .. } => None,
        }
    }
}

/// Wall time of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTiming {
    pub step: NegotiationStep,
    pub elapsed: Duration,
}

/// Summary of a completed round
#[derive(Debug, Clone)]
pub struct RoundReport {
    /// 1-based round number
    pub round: u64,
    pub offer: SessionDescription,
    pub answer: SessionDescription,
    pub timings: Vec<StepTiming>,
    pub total: Duration,
    /// Buffered candidates that could not be applied when flushed
    pub relay_errors: Vec<RelayError>,
}

pub struct Negotiator {
    local: Arc<Connection>,
    remote: Arc<Connection>,
    relay: Arc<CandidateRelay>,
    step_timeout: Duration,
    state: NegotiationState,
    rounds_started: u64,
    relay_errors: Vec<RelayError>,
}

impl Negotiator {
    pub fn new(
        local: Arc<Connection>,
        remote: Arc<Connection>,
        relay: Arc<CandidateRelay>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            local,
            remote,
            relay,
            step_timeout,
            state: NegotiationState::Idle,
            rounds_started: 0,
            relay_errors: Vec::new(),
        }
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn rounds_started(&self) -> u64 {
        self.rounds_started
    }

    /// Perform exactly one transition.
    ///
    /// Returns the timing of the library call, or `None` for the final
    /// `LocalRemoteAnswerSet -> Idle` transition, which calls nothing.
    pub async fn step(&mut self) -> Result<Option<StepTiming>, NegotiationError> {
        let state = std::mem::take(&mut self.state);
        let Some(step) = state.next_step() else {
            // LocalRemoteAnswerSet -> Idle
            return Ok(None);
        };

        if state.is_idle() {
            self.rounds_started += 1;
            self.relay_errors.clear();
        }

        let started = Instant::now();
        match self.transition(step, state).await {
            Ok(next) => {
                let elapsed = started.elapsed();
                debug!("negotiation: {:?} took {:?} -> {}", step, elapsed, next.name());
                self.state = next;
                Ok(Some(StepTiming { step, elapsed }))
            }
            Err(e) => {
                warn!("negotiation: round {} aborted at {:?}: {}", self.rounds_started, step, e);
                self.state = NegotiationState::Idle;
                self.roll_back().await;
                Err(e)
            }
        }
    }

    async fn transition(
        &mut self,
        step: NegotiationStep,
        state: NegotiationState,
    ) -> Result<NegotiationState, NegotiationError> {
        let next = match state {
            NegotiationState::Idle => {
                let offer = self.bounded(step, self.local.create_offer()).await?;
                NegotiationState::OfferCreated { offer }
            }
            NegotiationState::OfferCreated { offer } => {
                self.bounded(step, self.local.set_local_description(offer.clone())).await?;
                NegotiationState::LocalOfferSet { offer }
            }
            NegotiationState::LocalOfferSet { offer } => {
                self.bounded(step, self.remote.set_remote_description(offer.clone())).await?;
                self.flush(Role::Remote).await;
                NegotiationState::RemoteOfferSet { offer }
            }
            NegotiationState::RemoteOfferSet { offer } => {
                let answer = self.bounded(step, self.remote.create_answer()).await?;
                NegotiationState::AnswerCreated { offer, answer }
            }
            NegotiationState::AnswerCreated { offer, answer } => {
                self.bounded(step, self.remote.set_local_description(answer.clone())).await?;
                NegotiationState::RemoteLocalAnswerSet { offer, answer }
            }
            NegotiationState::RemoteLocalAnswerSet { offer, answer } => {
                self.bounded(step, self.local.set_remote_description(answer.clone())).await?;
                self.flush(Role::Local).await;
                NegotiationState::LocalRemoteAnswerSet { offer, answer }
            }
            NegotiationState::LocalRemoteAnswerSet { .. } => {
                return Err(StateError::UnexpectedStep {
                    step,
                    state: "LocalRemoteAnswerSet",
                }
                .into())
            }
        };
        Ok(next)
    }

    async fn bounded<T>(
        &self,
        step: NegotiationStep,
        op: impl Future<Output = crate::error::Result<T>>,
    ) -> Result<T, NegotiationError> {
        match tokio::time::timeout(self.step_timeout, op).await {
            Err(_) => Err(NegotiationError::Timeout { step }),
            Ok(Err(Error::State(e))) => Err(NegotiationError::State(e)),
            Ok(Err(e)) => Err(NegotiationError::Failed {
                step,
                reason: e.to_string(),
            }),
            Ok(Ok(value)) => Ok(value),
        }
    }

    /// Undo whatever the aborted round applied so the next one starts clean.
    async fn roll_back(&self) {
        for conn in [&self.local, &self.remote] {
            match tokio::time::timeout(self.step_timeout, conn.rollback()).await {
                Ok(Ok(true)) => debug!("negotiation: {:?} rolled back to Stable", conn.role()),
                Ok(Ok(false)) | Ok(Err(Error::State(StateError::Closed { .. }))) => {}
                Ok(Err(e)) => warn!("negotiation: {:?} rollback failed: {}", conn.role(), e),
                Err(_) => warn!("negotiation: {:?} rollback timed out", conn.role()),
            }
        }
    }

    async fn flush(&mut self, target: Role) {
        let report = self.relay.flush(target).await;
        self.relay_errors.extend(report.errors);
    }

    /// Run a whole round from `Idle` back to `Idle`.
    pub async fn run_round(&mut self) -> Result<RoundReport, NegotiationError> {
        if !self.state.is_idle() {
            return Err(StateError::UnexpectedStep {
                step: NegotiationStep::CreateOffer,
                state: self.state.name(),
            }
            .into());
        }

        let started = Instant::now();
        let mut timings = Vec::with_capacity(6);
        loop {
            if let NegotiationState::LocalRemoteAnswerSet { offer, answer } = &self.state {
                let report = RoundReport {
                    round: self.rounds_started,
                    offer: offer.clone(),
                    answer: answer.clone(),
                    timings,
                    total: started.elapsed(),
                    relay_errors: std::mem::take(&mut self.relay_errors),
                };
                self.step().await?;
                info!("negotiation: round {} completed in {:?}", report.round, report.total);
                return Ok(report);
            }
            if let Some(timing) = self.step().await? {
                timings.push(timing);
            }
        }
    }
}
