//! Trickle ICE relay between the two connections.
//!
//! Candidates that reach a connection before it has a remote description are
//! queued per target and flushed, in emission order, once the remote
//! description is in place. The queue lock is held across delivery, so a
//! candidate never overtakes one buffered before it.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::sync::Mutex;

use super::Candidate;
use crate::error::{Error, RelayError, StateError};
use crate::peer::{Connection, Role};

/// Outcome of handing a candidate to the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Applied to the target connection
    Applied,
    /// Queued until the target has a remote description
    Buffered,
}

/// Result of flushing a target's queue
#[derive(Debug, Default)]
pub struct FlushReport {
    pub applied: usize,
    pub errors: Vec<RelayError>,
}

#[derive(Default)]
struct PendingQueue {
    pending: VecDeque<Candidate>,
    delivered: u64,
}

pub struct CandidateRelay {
    peers: [Arc<Connection>; 2],
    queues: [Mutex<PendingQueue>; 2],
}

impl CandidateRelay {
    pub fn new(local: Arc<Connection>, remote: Arc<Connection>) -> Self {
        Self {
            peers: [local, remote],
            queues: [Mutex::new(PendingQueue::default()), Mutex::new(PendingQueue::default())],
        }
    }

    fn connection(&self, role: Role) -> &Arc<Connection> {
        &self.peers[role.index()]
    }

    /// Forward a candidate to the connection opposite its origin.
    pub async fn deliver(&self, candidate: Candidate) -> Result<Delivery, RelayError> {
        let origin = candidate.origin;
        let target = origin.peer();
        let conn = self.connection(target);
        let mut queue = self.queues[target.index()].lock().await;

        if conn.is_closed() {
            queue.pending.clear();
            return Err(RelayError::PeerClosed { origin, target });
        }

        if !conn.has_remote_description() {
            trace!("relay: buffering {:?} candidate for {:?}", origin, target);
            queue.pending.push_back(candidate);
            return Ok(Delivery::Buffered);
        }

        // Remote description landed but the flush has not run yet
        if !queue.pending.is_empty() {
            queue.pending.push_back(candidate);
            let report = drain(conn, &mut queue).await;
            return match report.errors.into_iter().next() {
                Some(e) => Err(e),
                None => Ok(Delivery::Applied),
            };
        }

        apply(conn, &candidate).await?;
        queue.delivered += 1;
        Ok(Delivery::Applied)
    }

    /// Apply everything buffered for `target`. Call right after its remote
    /// description has been set.
    pub async fn flush(&self, target: Role) -> FlushReport {
        let conn = self.connection(target);
        let mut queue = self.queues[target.index()].lock().await;
        if queue.pending.is_empty() {
            return FlushReport::default();
        }
        let report = drain(conn, &mut queue).await;
        debug!(
            "relay: flushed {} candidates to {:?} ({} failed)",
            report.applied,
            target,
            report.errors.len()
        );
        report
    }

    /// Candidates waiting for `target`'s remote description
    pub async fn pending(&self, target: Role) -> usize {
        self.queues[target.index()].lock().await.pending.len()
    }

    /// Candidates applied to `target` so far
    pub async fn delivered(&self, target: Role) -> u64 {
        self.queues[target.index()].lock().await.delivered
    }

    /// Drop all buffered candidates
    pub async fn clear(&self) {
        for queue in &self.queues {
            queue.lock().await.pending.clear();
        }
    }
}

async fn apply(conn: &Connection, candidate: &Candidate) -> Result<(), RelayError> {
    let origin = candidate.origin;
    let target = conn.role();
    conn.add_ice_candidate(candidate).await.map_err(|e| match e {
        Error::State(StateError::Closed { .. }) => RelayError::PeerClosed { origin, target },
        other => RelayError::Rejected {
            origin,
            target,
            reason: other.to_string(),
        },
    })
}

async fn drain(conn: &Connection, queue: &mut PendingQueue) -> FlushReport {
    let mut report = FlushReport::default();
    while let Some(candidate) = queue.pending.pop_front() {
        match apply(conn, &candidate).await {
            Ok(()) => {
                queue.delivered += 1;
                report.applied += 1;
            }
            Err(RelayError::PeerClosed { origin, target }) => {
                queue.pending.clear();
                report.errors.push(RelayError::PeerClosed { origin, target });
                break;
            }
            Err(e) => {
                warn!("relay: {}", e);
                report.errors.push(e);
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{Track, TrackKind, TransceiverDirection};
    use crate::peer::{EventSink, LoopbackEngine, LoopbackNetwork, LoopbackProbe};

    struct Pair {
        local: Arc<Connection>,
        remote: Arc<Connection>,
        remote_probe: LoopbackProbe,
        relay: CandidateRelay,
    }

    fn pair() -> Pair {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = EventSink::channel();
        let local_sink = EventSink::new(Role::Local, tx.clone());
        let remote_sink = EventSink::new(Role::Remote, tx);
        let local_engine = LoopbackEngine::new(local_sink.clone(), network.clone(), 0);
        let remote_engine = LoopbackEngine::new(remote_sink.clone(), network, 0);
        let remote_probe = remote_engine.probe();
        let local = Arc::new(Connection::new(Role::Local, Box::new(local_engine), local_sink));
        let remote = Arc::new(Connection::new(Role::Remote, Box::new(remote_engine), remote_sink));
        let relay = CandidateRelay::new(local.clone(), remote.clone());
        Pair {
            local,
            remote,
            remote_probe,
            relay,
        }
    }

    fn local_candidate(n: u16) -> Candidate {
        Candidate::new(
            Role::Local,
            &format!("candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host", n, 40_000 + n),
            Some("0"),
            Some(0),
        )
    }

    async fn offer_to_remote(p: &Pair) {
        p.remote
            .add_transceiver(TrackKind::Video, TransceiverDirection::RecvOnly)
            .await
            .unwrap();
        p.local.add_track(Track::video("cam", "s")).await.unwrap();
        let offer = p.local.create_offer().await.unwrap();
        p.local.set_local_description(offer.clone()).await.unwrap();
        p.remote.set_remote_description(offer).await.unwrap();
    }

    #[tokio::test]
    async fn test_early_candidates_flushed_in_order_once() {
        let p = pair();
        for n in 1..=5 {
            assert_eq!(p.relay.deliver(local_candidate(n)).await, Ok(Delivery::Buffered));
        }
        assert_eq!(p.relay.pending(Role::Remote).await, 5);
        assert!(p.remote_probe.applied_candidates().is_empty());

        offer_to_remote(&p).await;
        let report = p.relay.flush(Role::Remote).await;
        assert_eq!(report.applied, 5);
        assert!(report.errors.is_empty());

        let applied = p.remote_probe.applied_candidates();
        let expected: Vec<Candidate> = (1..=5).map(local_candidate).collect();
        assert_eq!(applied, expected);

        // A second flush has nothing left to apply
        assert_eq!(p.relay.flush(Role::Remote).await.applied, 0);
        assert_eq!(p.relay.delivered(Role::Remote).await, 5);
    }

    #[tokio::test]
    async fn test_late_candidate_does_not_overtake_buffered() {
        let p = pair();
        p.relay.deliver(local_candidate(1)).await.unwrap();
        p.relay.deliver(local_candidate(2)).await.unwrap();
        offer_to_remote(&p).await;

        // Delivered between set_remote_description and flush
        assert_eq!(p.relay.deliver(local_candidate(3)).await, Ok(Delivery::Applied));
        assert_eq!(p.relay.flush(Role::Remote).await.applied, 0);

        let order: Vec<String> = p
            .remote_probe
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(order.len(), 3);
        assert!(order[0].starts_with("candidate:1 "));
        assert!(order[2].starts_with("candidate:3 "));
    }

    #[tokio::test]
    async fn test_candidate_to_closed_peer_is_relay_error() {
        let p = pair();
        p.relay.deliver(local_candidate(1)).await.unwrap();
        p.remote.close().await;

        let err = p.relay.deliver(local_candidate(2)).await.unwrap_err();
        assert_eq!(
            err,
            RelayError::PeerClosed {
                origin: Role::Local,
                target: Role::Remote
            }
        );
        assert_eq!(p.relay.pending(Role::Remote).await, 0);
    }

    #[tokio::test]
    async fn test_clear_drops_pending() {
        let p = pair();
        p.relay.deliver(local_candidate(1)).await.unwrap();
        p.relay.clear().await;
        assert_eq!(p.relay.pending(Role::Remote).await, 0);
    }
}
