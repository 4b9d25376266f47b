use embassy_time::{Duration, Instant};

use crate::{Address, PacketId};

#[derive(Clone, Copy)]
struct CacheEntry {
    src: Address,
    last_pktid_seen: PacketId,
    mtime: Instant,
}

/// Small associative table remembering the last packet id seen per source,
/// used to suppress replays of retransmitted frames.
///
/// At most one entry exists per source. Entries age out after the discard
/// delay; when the table is full a new source evicts the entry with the
/// greatest age.
pub(crate) struct PacketIdCache<const SIZE: usize> {
    entries: [Option<CacheEntry>; SIZE],
    discard_delay: Duration,
}

impl<const SIZE: usize> PacketIdCache<SIZE> {
    pub(crate) fn new(discard_delay: Duration) -> Self {
        PacketIdCache {
            entries: [None; SIZE],
            discard_delay,
        }
    }

    /// Records the observation of `(src, pktid)` at `now` and reports
    /// whether that exact pair was already the last one seen from `src`.
    ///
    /// One pass over the table discards over-age entries, refreshes or
    /// installs the entry for `src`, and tracks the oldest entry as the
    /// eviction candidate for when no free slot is left.
    pub(crate) fn observe(&mut self, src: Address, pktid: PacketId, now: Instant) -> bool {
        let mut unused_idx: Option<usize> = None;
        let mut oldest_idx: Option<usize> = None;
        let mut biggest_age = Duration::from_millis(0);
        let mut src_found = false;
        let mut already_seen = false;

        for (i, slot) in self.entries.iter_mut().enumerate() {
            // age out stale entries before anything else
            if let Some(entry) = slot {
                if now.saturating_duration_since(entry.mtime) >= self.discard_delay {
                    *slot = None;
                }
            }
            match slot {
                Some(entry) if entry.src == src => {
                    // one entry per source
                    debug_assert!(!src_found);
                    src_found = true;
                    entry.mtime = now;
                    if entry.last_pktid_seen == pktid {
                        already_seen = true;
                    } else {
                        entry.last_pktid_seen = pktid;
                    }
                }
                Some(entry) => {
                    let age = now.saturating_duration_since(entry.mtime);
                    if oldest_idx.is_none() || age > biggest_age {
                        biggest_age = age;
                        oldest_idx = Some(i);
                    }
                }
                None => {
                    if unused_idx.is_none() {
                        unused_idx = Some(i);
                    }
                }
            }
        }

        if !src_found {
            // a full table always has an eviction candidate
            let idx = match unused_idx.or(oldest_idx) {
                Some(idx) => idx,
                None => 0,
            };
            self.entries[idx] = Some(CacheEntry {
                src,
                last_pktid_seen: pktid,
                mtime: now,
            });
        }

        already_seen
    }

    #[cfg(test)]
    fn occupied(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISCARD: Duration = Duration::from_millis(176_400_000);

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn first_observation_is_not_a_duplicate() {
        let mut cache: PacketIdCache<10> = PacketIdCache::new(DISCARD);
        assert!(!cache.observe(0x0B, 1, at(0)));
        assert_eq!(cache.occupied(), 1);
    }

    #[test]
    fn repeated_pktid_is_a_duplicate_until_it_changes() {
        let mut cache: PacketIdCache<10> = PacketIdCache::new(DISCARD);
        assert!(!cache.observe(0x0B, 7, at(0)));
        assert!(cache.observe(0x0B, 7, at(10)));
        assert!(cache.observe(0x0B, 7, at(20)));
        // a new pktid replaces the stored one
        assert!(!cache.observe(0x0B, 8, at(30)));
        // and the old one counts as fresh again
        assert!(!cache.observe(0x0B, 7, at(40)));
        assert_eq!(cache.occupied(), 1);
    }

    #[test]
    fn sources_are_tracked_independently() {
        let mut cache: PacketIdCache<10> = PacketIdCache::new(DISCARD);
        assert!(!cache.observe(0x01, 5, at(0)));
        assert!(!cache.observe(0x02, 5, at(1)));
        assert!(cache.observe(0x01, 5, at(2)));
        assert!(cache.observe(0x02, 5, at(3)));
        assert_eq!(cache.occupied(), 2);
    }

    #[test]
    fn entries_age_out_after_discard_delay() {
        let mut cache: PacketIdCache<10> = PacketIdCache::new(DISCARD);
        assert!(!cache.observe(0x0B, 7, at(0)));
        // one millisecond short of the discard delay, still remembered
        assert!(cache.observe(0x0B, 7, at(DISCARD.as_millis() - 1)));
        // the refresh above restarted the clock; jump past it
        let later = DISCARD.as_millis() - 1 + DISCARD.as_millis();
        assert!(!cache.observe(0x0B, 7, at(later)));
    }

    #[test]
    fn eviction_under_pressure_drops_the_oldest_source() {
        let mut cache: PacketIdCache<10> = PacketIdCache::new(DISCARD);
        // 11 distinct sources in rapid succession
        for src in 0u8..10 {
            assert!(!cache.observe(src, 1, at(src as u64)));
        }
        assert_eq!(cache.occupied(), 10);
        // the 11th source evicts source 0, the oldest entry
        assert!(!cache.observe(10, 1, at(100)));
        assert_eq!(cache.occupied(), 10);
        // the evicted source's retransmit is treated as first-seen again
        assert!(!cache.observe(0, 1, at(101)));
    }

    #[test]
    fn refreshed_entry_is_not_the_eviction_victim() {
        let mut cache: PacketIdCache<3> = PacketIdCache::new(DISCARD);
        assert!(!cache.observe(1, 1, at(0)));
        assert!(!cache.observe(2, 1, at(1)));
        assert!(!cache.observe(3, 1, at(2)));
        // touch source 1 so source 2 becomes the oldest
        assert!(cache.observe(1, 1, at(50)));
        assert!(!cache.observe(4, 1, at(60)));
        // source 2 got evicted, sources 1 and 3 survived
        assert!(cache.observe(1, 1, at(61)));
        assert!(cache.observe(3, 1, at(62)));
        assert!(!cache.observe(2, 1, at(63)));
    }
}
