//! Victim selection for the paging policy.
//!
//! When the resident budget is exhausted, a batch of unpinned segments is
//! ranked oldest-first by recency stamp and consumed victim by victim. The
//! batch carries the recency floor it was built against so segments touched
//! after the ranking are skipped rather than evicted out of order.

use std::cmp::Reverse;

use smallvec::SmallVec;
use tracing::debug;

use crate::directory::Directory;
use crate::error::{QuireError, Result};

/// Fraction of the resident cap selected per batch: `max(1, cap / 32)`.
const BATCH_DIVISOR: usize = 32;

#[derive(Default)]
pub(crate) struct VictimQueue {
    /// Candidate ordinals, oldest first; consumed from the back.
    batch: SmallVec<[usize; 8]>,
    /// Recency stamp of the youngest batch member at build time.
    floor: u64,
}

impl VictimQueue {
    /// Drops any precomputed batch, e.g. after a structural edit shifts
    /// segment ordinals.
    pub(crate) fn clear(&mut self) {
        self.batch.clear();
        self.floor = 0;
    }

    /// Pops the next victim that is still evictable: resident, unpinned, and
    /// not touched since the batch was ranked.
    pub(crate) fn pop_valid<T: Default, X: Default>(
        &mut self,
        dir: &Directory<T, X>,
    ) -> Option<usize> {
        while let Some(ordinal) = self.batch.pop() {
            if ordinal >= dir.len() {
                continue;
            }
            let seg = dir.get(ordinal);
            if seg.is_resident() && !seg.is_pinned() && seg.stamp <= self.floor {
                return Some(ordinal);
            }
        }
        None
    }

    /// Ranks resident, unpinned segments by age and keeps the oldest slice
    /// of them as the new batch.
    ///
    /// Fails with [`QuireError::CapacityExhausted`] when a full scan finds no
    /// candidate at all, since eviction can then make no progress.
    pub(crate) fn rebuild<T: Default, X: Default>(
        &mut self,
        dir: &Directory<T, X>,
        counter: u64,
        cap: usize,
    ) -> Result<usize> {
        let mut ranked: Vec<(u64, usize)> = dir
            .iter()
            .enumerate()
            .filter(|(_, seg)| seg.is_resident() && !seg.is_pinned())
            .map(|(ordinal, seg)| (counter.wrapping_sub(seg.stamp), ordinal))
            .collect();
        if ranked.is_empty() {
            return Err(QuireError::CapacityExhausted);
        }
        ranked.sort_by_key(|&(age, _)| Reverse(age));

        let want = std::cmp::max(1, cap / BATCH_DIVISOR);
        let take = std::cmp::min(want, ranked.len());
        self.batch.clear();
        self.batch.extend(ranked[..take].iter().map(|&(_, o)| o));
        self.floor = counter.wrapping_sub(ranked[take - 1].0);
        debug!(
            candidates = ranked.len(),
            batch = take,
            floor = self.floor,
            "quire.victims.rebuild"
        );
        Ok(take)
    }
}
