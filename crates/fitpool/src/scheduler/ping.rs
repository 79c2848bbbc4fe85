//! Worker liveness bookkeeping

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::protocol::WorkerId;

/// Last ping of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingState {
    /// Ping sent, no pong yet
    Pending { sent_at: DateTime<Utc> },
    /// Pong received
    Resolved { round_trip: Duration },
}

/// Last ping state and reported pid of every worker
///
/// Entries are overwritten in place; no history is kept. Round trips are
/// measured against the worker's own pong timestamp, so they do not depend on
/// when the pong is collected.
#[derive(Debug, Default)]
pub struct PingTable {
    states: BTreeMap<WorkerId, PingState>,
    pids: BTreeMap<WorkerId, u32>,
}

impl PingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a ping was just sent
    pub fn mark_sent(&mut self, worker: WorkerId, sent_at: DateTime<Utc>) {
        self.states.insert(worker, PingState::Pending { sent_at });
    }

    /// Record a pong the worker stamped at `pong_at`
    ///
    /// Returns the round trip, or `None` when no ping was pending for the
    /// worker (the pid is recorded either way).
    pub fn resolve(
        &mut self,
        worker: WorkerId,
        pid: u32,
        pong_at: DateTime<Utc>,
    ) -> Option<Duration> {
        self.pids.insert(worker, pid);
        match self.states.get(&worker) {
            Some(PingState::Pending { sent_at }) => {
                // Clocks of other hosts may run behind
                let round_trip = (pong_at - *sent_at).to_std().unwrap_or(Duration::ZERO);
                self.states
                    .insert(worker, PingState::Resolved { round_trip });
                Some(round_trip)
            }
            _ => None,
        }
    }

    pub fn state(&self, worker: WorkerId) -> Option<PingState> {
        self.states.get(&worker).copied()
    }

    /// Round trip of the last answered ping
    pub fn round_trip(&self, worker: WorkerId) -> Option<Duration> {
        match self.states.get(&worker) {
            Some(PingState::Resolved { round_trip }) => Some(*round_trip),
            _ => None,
        }
    }

    pub fn pid(&self, worker: WorkerId) -> Option<u32> {
        self.pids.get(&worker).copied()
    }

    /// Workers whose last ping is still unanswered
    pub fn unanswered(&self) -> Vec<WorkerId> {
        self.states
            .iter()
            .filter(|(_, state)| matches!(state, PingState::Pending { .. }))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(n)
    }

    #[test]
    fn test_resolve_records_round_trip_and_pid() {
        let mut table = PingTable::new();
        let sent = Utc::now();
        table.mark_sent(WorkerId(0), sent);
        table.mark_sent(WorkerId(1), sent);

        let rt = table.resolve(WorkerId(0), 4242, sent + ms(12)).unwrap();
        assert_eq!(rt, Duration::from_millis(12));
        assert_eq!(table.round_trip(WorkerId(0)), Some(rt));
        assert_eq!(table.pid(WorkerId(0)), Some(4242));
        assert_eq!(table.unanswered(), vec![WorkerId(1)]);
    }

    #[test]
    fn test_round_trip_never_negative() {
        let mut table = PingTable::new();
        let sent = Utc::now();
        table.mark_sent(WorkerId(2), sent + ms(50));

        let rt = table.resolve(WorkerId(2), 1, sent).unwrap();
        assert_eq!(rt, Duration::ZERO);
    }

    #[test]
    fn test_unsolicited_pong() {
        let mut table = PingTable::new();
        assert_eq!(table.resolve(WorkerId(3), 7, Utc::now()), None);
        assert_eq!(table.pid(WorkerId(3)), Some(7));
        assert_eq!(table.state(WorkerId(3)), None);
    }

    #[test]
    fn test_new_ping_overwrites_previous() {
        let mut table = PingTable::new();
        let sent = Utc::now();
        table.mark_sent(WorkerId(0), sent);
        table.resolve(WorkerId(0), 1, sent + ms(3));

        table.mark_sent(WorkerId(0), sent + ms(10));
        assert!(matches!(
            table.state(WorkerId(0)),
            Some(PingState::Pending { .. })
        ));
        assert_eq!(table.round_trip(WorkerId(0)), None);
    }
}
