//! Applies collected observations in discovery order.
//!
//! Artifacts finish in whatever order their tasks complete, but the
//! collection state expects observations in the order the source walks
//! through time. Each discovered artifact takes a [`CommitTicket`]; its
//! observation is held back until every earlier ticket has resolved,
//! the way a consumer only commits an offset once everything before it is
//! processed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

type ApplyFn = Box<dyn Fn(DateTime<Utc>, &str) + Send + Sync>;

#[derive(Debug, Default)]
struct Sequence {
    issued: u64,
    next: u64,
    finished: BTreeMap<u64, Option<(DateTime<Utc>, String)>>,
}

/// Hands out tickets and forwards their observations in ticket order.
pub struct CommitSequencer {
    sequence: Mutex<Sequence>,
    apply: ApplyFn,
}

impl std::fmt::Debug for CommitSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitSequencer")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl CommitSequencer {
    /// Creates a sequencer forwarding observations to `apply`.
    pub fn new(apply: impl Fn(DateTime<Utc>, &str) + Send + Sync + 'static) -> Self {
        Self {
            sequence: Mutex::new(Sequence::default()),
            apply: Box::new(apply),
        }
    }

    /// Reserves the next position.
    #[must_use]
    pub fn ticket(self: &Arc<Self>) -> CommitTicket {
        let mut sequence = self.lock();
        let position = sequence.issued;
        sequence.issued += 1;
        CommitTicket {
            sequencer: Arc::clone(self),
            position,
            resolved: false,
        }
    }

    /// Observations resolved but still waiting on an earlier ticket.
    #[must_use]
    pub fn held_back(&self) -> usize {
        self.lock().finished.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Sequence> {
        self.sequence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, position: u64, observation: Option<(DateTime<Utc>, String)>) {
        // Held across `apply` so two resolving tasks cannot interleave batches.
        let mut sequence = self.lock();
        sequence.finished.insert(position, observation);
        loop {
            let next = sequence.next;
            let Some(ready) = sequence.finished.remove(&next) else {
                break;
            };
            sequence.next += 1;
            if let Some((timestamp, id)) = ready {
                (self.apply)(timestamp, &id);
            }
        }
    }
}

/// One artifact's place in the commit order.
///
/// Dropping an unresolved ticket resolves it with no observation, so a
/// skipped or failed artifact never holds back the ones after it.
#[derive(Debug)]
pub struct CommitTicket {
    sequencer: Arc<CommitSequencer>,
    position: u64,
    resolved: bool,
}

impl CommitTicket {
    /// Resolves with an observation to record.
    pub fn commit(mut self, timestamp: DateTime<Utc>, id: impl Into<String>) {
        self.resolved = true;
        self.sequencer
            .resolve(self.position, Some((timestamp, id.into())));
    }
}

impl Drop for CommitTicket {
    fn drop(&mut self) {
        if !self.resolved {
            self.sequencer.resolve(self.position, None);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn recording() -> (Arc<CommitSequencer>, Arc<Mutex<Vec<String>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&applied);
        let sequencer = CommitSequencer::new(move |_, id| sink.lock().unwrap().push(id.to_string()));
        (Arc::new(sequencer), applied)
    }

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_observations_applied_in_ticket_order() {
        let (sequencer, applied) = recording();
        let first = sequencer.ticket();
        let second = sequencer.ticket();
        let third = sequencer.ticket();

        third.commit(ts(3), "c");
        second.commit(ts(2), "b");
        assert!(applied.lock().unwrap().is_empty());
        assert_eq!(sequencer.held_back(), 2);

        first.commit(ts(1), "a");
        assert_eq!(*applied.lock().unwrap(), ["a", "b", "c"]);
        assert_eq!(sequencer.held_back(), 0);
    }

    #[test]
    fn test_dropped_ticket_does_not_block_later_ones() {
        let (sequencer, applied) = recording();
        let skipped = sequencer.ticket();
        let collected = sequencer.ticket();

        collected.commit(ts(1), "a");
        assert!(applied.lock().unwrap().is_empty());

        drop(skipped);
        assert_eq!(*applied.lock().unwrap(), ["a"]);
    }
}
