//! Duplicate detection over the 16-bit packet id space.
//!
//! The same packet may arrive over several links. [`DuplicateFilter`] remembers
//! which ids it has seen using two 0x8000-bit halves ("low" for ids below
//! 0x8000, "high" for the rest). Each half is split into a normal quadrant and
//! a clearing quadrant:
//!
//! ```text
//! 0x0000..0x4000  low, normal
//! 0x4000..0x8000  low, clearing   (wipes the high half if it is dirty)
//! 0x8000..0xC000  high, normal
//! 0xC000..0x10000 high, clearing  (wipes the low half if it is dirty)
//! ```
//!
//! As a sender's counter advances, the half it is about to re-enter is wiped a
//! full quadrant ahead of time, so memory stays fixed while ids wrap. A late
//! copy is still recognised as long as it trails the newest id by less than one
//! quadrant ([`REORDER_WINDOW`]); copies later than that may be forwarded again.

use std::sync::{Mutex, PoisonError};

const HALF_BITS: usize = 0x8000;
const WORDS: usize = HALF_BITS / 64;

/// Guaranteed reorder distance within which duplicates are detected.
pub const REORDER_WINDOW: u16 = 0x4000;

const HIGH_START: u16 = 0x8000;

struct Bitmap([u64; WORDS]);

impl Bitmap {
    fn new() -> Self {
        Self([0; WORDS])
    }

    /// Set bit `idx` and return its previous value.
    fn test_and_set(&mut self, idx: usize) -> bool {
        let (word, bit) = (idx / 64, 1u64 << (idx % 64));
        let seen = self.0[word] & bit != 0;
        self.0[word] |= bit;
        seen
    }

    fn clear(&mut self) {
        self.0 = [0; WORDS];
    }

    fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }
}

struct FilterState {
    low: Bitmap,
    high: Bitmap,
    low_clear: bool,
    high_clear: bool,
}

/// Two-half sliding bitmap of recently seen packet ids.
pub struct DuplicateFilter {
    state: Mutex<FilterState>,
}

impl DuplicateFilter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FilterState {
                low: Bitmap::new(),
                high: Bitmap::new(),
                low_clear: true,
                high_clear: true,
            }),
        }
    }

    /// Record `id` and report whether it had already been seen.
    pub fn check_and_mark(&self, id: u16) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *guard;

        if id < HIGH_START {
            let seen = state.low.test_and_set(id as usize);
            state.low_clear = false;
            if id >= REORDER_WINDOW && !state.high_clear {
                state.high.clear();
                state.high_clear = true;
            }
            seen
        } else {
            let seen = state.high.test_and_set((id - HIGH_START) as usize);
            state.high_clear = false;
            if id >= HIGH_START + REORDER_WINDOW && !state.low_clear {
                state.low.clear();
                state.low_clear = true;
            }
            seen
        }
    }

    /// Number of ids currently marked in the (low, high) halves.
    pub fn occupancy(&self) -> (u32, u32) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.low.count(), state.high.count())
    }
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_then_duplicate_for_every_id() {
        let filter = DuplicateFilter::new();
        for id in 0..=u16::MAX {
            assert!(!filter.check_and_mark(id), "id {id:#06x} reported seen on first use");
            assert!(filter.check_and_mark(id), "id {id:#06x} not reported on repeat");
        }
    }

    #[test]
    fn test_two_full_wraps_clear_old_halves() {
        let filter = DuplicateFilter::new();
        for lap in 0..2 {
            for id in 0..=u16::MAX {
                assert!(!filter.check_and_mark(id), "lap {lap}: id {id:#06x} stale");
                if id == 0xC000 {
                    assert_eq!(filter.occupancy().0, 0, "lap {lap}: low half not wiped");
                }
                if lap == 1 && id == REORDER_WINDOW {
                    assert_eq!(filter.occupancy().1, 0, "high half not wiped");
                }
            }
        }
    }

    #[test]
    fn test_clearing_quadrant_wipes_opposite_half() {
        let filter = DuplicateFilter::new();
        for id in 0x8000..0x8010u16 {
            filter.check_and_mark(id);
        }
        for id in 0..0x10u16 {
            filter.check_and_mark(id);
        }
        assert_eq!(filter.occupancy(), (0x10, 0x10));

        // Still in the low normal quadrant: high half untouched.
        filter.check_and_mark(0x3FFF);
        assert_eq!(filter.occupancy(), (0x11, 0x10));

        filter.check_and_mark(REORDER_WINDOW);
        assert_eq!(filter.occupancy(), (0x12, 0));
    }

    #[test]
    fn test_late_duplicate_within_window_detected() {
        let filter = DuplicateFilter::new();
        for id in 0x0000..0x4000u16 {
            filter.check_and_mark(id);
        }
        // Sender moved a full window ahead; an old copy of 0x0001 shows up.
        filter.check_and_mark(0x4001);
        assert!(filter.check_and_mark(0x0001));

        for id in 0x4002..=0xBFFFu16 {
            filter.check_and_mark(id);
        }
        // 0x7FFE ids behind the newest and still remembered.
        assert!(filter.check_and_mark(0x4001));
    }

    #[test]
    fn test_duplicate_beyond_window_is_forgotten() {
        let filter = DuplicateFilter::new();
        for id in 0x0000..=0xC000u16 {
            filter.check_and_mark(id);
        }
        // Entering 0xC000 wiped the low half; 0x7FFF trails by 0x4001.
        assert!(!filter.check_and_mark(0x7FFF));
        assert_eq!(filter.occupancy().0, 1);
    }

    #[test]
    fn test_high_half_wrap_into_low() {
        let filter = DuplicateFilter::new();
        for id in 0xF000..=0xFFFFu16 {
            filter.check_and_mark(id);
        }
        assert!(!filter.check_and_mark(0));
        // Reordered tail of the previous lap is still a duplicate.
        assert!(filter.check_and_mark(0xFFF0));
    }
}
