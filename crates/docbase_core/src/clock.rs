//! # Revision clock
//!
//! Hybrid logical clock producing document revisions. A revision packs the
//! wall-clock milliseconds into the upper 48 bits and a counter into the
//! lower 16 bits, so revisions from different processes stay comparable
//! while two calls on one clock are always strictly ordered.
//!
//! Wall clocks can step backwards across restarts. Recovery therefore feeds
//! every replayed revision into [`RevisionClock::observe`], which pushes the
//! clock past anything already on disk.

use crate::types::Revision;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Bits reserved for the logical counter.
const COUNTER_BITS: u32 = 16;

/// Milliseconds of 2016-01-01T00:00:00Z. Revisions whose physical part lies
/// before this belong to the pre-clock numbering scheme.
pub const HLC_EPOCH_MS: u64 = 1_451_606_400_000;

/// Packs physical milliseconds and a counter into one revision value.
#[must_use]
pub const fn pack(millis: u64, counter: u16) -> u64 {
    (millis << COUNTER_BITS) | counter as u64
}

/// Returns the physical milliseconds part of a revision.
#[must_use]
pub const fn millis(rev: Revision) -> u64 {
    rev.0 >> COUNTER_BITS
}

/// Thread-safe hybrid logical clock.
#[derive(Debug, Default)]
pub struct RevisionClock {
    last: AtomicU64,
}

impl RevisionClock {
    /// Creates a clock that has not issued anything yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock that will only issue revisions above `seed`.
    #[must_use]
    pub fn seeded(seed: Revision) -> Self {
        Self {
            last: AtomicU64::new(seed.as_u64()),
        }
    }

    /// Issues a revision strictly greater than every earlier one.
    pub fn next(&self) -> Revision {
        self.next_at(wall_clock_ms())
    }

    /// Issues a revision using `now_ms` as the physical time.
    pub fn next_at(&self, now_ms: u64) -> Revision {
        let physical = pack(now_ms, 0);
        let mut issued = 0;
        // fetch_update retries until no other thread raced us
        let _ = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                issued = physical.max(last.saturating_add(1));
                Some(issued)
            });
        Revision::new(issued)
    }

    /// Makes sure later revisions exceed `rev`.
    pub fn observe(&self, rev: Revision) {
        self.last.fetch_max(rev.as_u64(), Ordering::AcqRel);
    }

    /// Returns the highest revision issued or observed so far.
    #[must_use]
    pub fn last(&self) -> Revision {
        Revision::new(self.last.load(Ordering::Acquire))
    }

    /// Returns true if `rev` predates the hybrid clock numbering.
    #[must_use]
    pub fn is_old_epoch(rev: Revision) -> bool {
        millis(rev) < HLC_EPOCH_MS
    }

    /// Reads a revision carried by restored data.
    ///
    /// Strings that do not parse, or that belong to the old numbering, are
    /// replaced by a fresh revision. Returns the revision and whether it
    /// was replaced.
    pub fn restore(&self, text: &str) -> (Revision, bool) {
        match Revision::parse(text) {
            Some(rev) if !Self::is_old_epoch(rev) => {
                self.observe(rev);
                (rev, false)
            }
            _ => {
                let fresh = self.next();
                warn!(
                    original = text,
                    replacement = %fresh,
                    "unusable revision in restored document replaced"
                );
                (fresh, true)
            }
        }
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX >> COUNTER_BITS))
        .unwrap_or(0)
}
