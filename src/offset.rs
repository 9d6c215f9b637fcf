//! Per-partition tracking of emitted offsets and the derived commit point.

use std::collections::BTreeSet;

use tracing::warn;

/// Tracks the offsets one virtual consumer has emitted on one partition and
/// derives the largest offset safe to commit.
///
/// The commit point only ever advances along the contiguous prefix of
/// finalized (acked or abandoned) offsets; out-of-order acks park until the
/// gap before them closes. The in-flight set is bounded by the log client's
/// maximum outstanding poll.
#[derive(Debug)]
pub struct PartitionOffsetTracker {
    /// Offsets emitted but not yet finalized.
    in_flight: BTreeSet<i64>,
    /// Highest offset ever started.
    leading_edge: Option<i64>,
    /// Commit point when nothing is in flight.
    finalized: i64,
}

impl PartitionOffsetTracker {
    /// `starting_offset` is the first offset this consumer may emit; the
    /// initial commit point sits just before it.
    pub fn new(starting_offset: i64) -> Self {
        Self {
            in_flight: BTreeSet::new(),
            leading_edge: None,
            finalized: starting_offset - 1,
        }
    }

    /// Register a newly emitted offset.
    ///
    /// Offsets must arrive in ascending order; re-registering an offset that
    /// is still in flight (a retry re-emission) is a no-op.
    pub fn start_tracking(&mut self, offset: i64) {
        if self.in_flight.contains(&offset) {
            return;
        }
        if let Some(leading_edge) = self.leading_edge {
            if offset <= leading_edge {
                warn!(
                    offset,
                    leading_edge, "offset started out of order, ignoring"
                );
                return;
            }
        }
        self.leading_edge = Some(offset);
        self.in_flight.insert(offset);
    }

    /// Mark an offset finalized (acked or abandoned).
    ///
    /// Finishing an offset that is not in flight (e.g. finishing twice) is a
    /// no-op.
    pub fn finish(&mut self, offset: i64) {
        if !self.in_flight.remove(&offset) {
            return;
        }
        self.finalized = match self.in_flight.first() {
            // Everything before the earliest outstanding offset is done.
            Some(&earliest) => self.finalized.max(earliest - 1),
            None => self.finalized.max(self.leading_edge.unwrap_or(offset)),
        };
    }

    /// The externally observable commit point.
    pub fn commit_offset(&self) -> i64 {
        self.finalized
    }

    /// Number of offsets emitted but not finalized.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_drained(&self) -> bool {
        self.in_flight.is_empty()
    }
}
