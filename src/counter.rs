use std::sync::atomic::{AtomicU64, Ordering};

/// Ring size of every [`SlicedCounter`]. The configured window plus one gauge
/// tick must fit inside it.
pub const BUCKET_COUNT: u64 = 64;

/// 按时间单位分片的滑动窗口计数器 / Sliding window counter sliced by time unit.
///
/// Bucket `i` holds the count of time unit `t` with `t % BUCKET_COUNT == i`,
/// valid while `t - oldest_valid < BUCKET_COUNT`. `total` always equals the
/// sum of the buckets once in-flight operations settle.
///
/// Any number of tasks may call [`inc`](Self::inc); only one may call
/// [`erase_stale`](Self::erase_stale) at a time.
#[derive(Debug)]
pub struct SlicedCounter {
    fresh: u64,
    oldest_valid: AtomicU64,
    total: AtomicU64,
    buckets: [AtomicU64; BUCKET_COUNT as usize],
}

impl SlicedCounter {
    /// `fresh` is the number of most recent units kept by `erase_stale`,
    /// `now` the unit the counter starts valid from.
    pub fn new(fresh: u64, now: u64) -> Self {
        Self {
            fresh,
            oldest_valid: AtomicU64::new(now),
            total: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Count one event in time unit `unit`. Returns false when `unit` is
    /// outside the ring.
    pub fn inc(&self, unit: u64) -> bool {
        let oldest = self.oldest_valid.load(Ordering::Acquire);
        if unit.wrapping_sub(oldest) >= BUCKET_COUNT {
            return false;
        }
        self.total.fetch_add(1, Ordering::AcqRel);
        self.buckets[(unit % BUCKET_COUNT) as usize].fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Drop every unit older than `now - fresh`.
    pub fn erase_stale(&self, now: u64) {
        let Some(stale) = now.checked_sub(self.fresh) else {
            return;
        };

        let mut oldest = self.oldest_valid.load(Ordering::Acquire);
        if stale >= oldest + BUCKET_COUNT {
            // Every bucket falls out of the window: jump to the last full ring.
            oldest = stale - BUCKET_COUNT + 1;
            self.oldest_valid.store(oldest, Ordering::Release);
        }

        while oldest <= stale {
            let prev = self.buckets[(oldest % BUCKET_COUNT) as usize].swap(0, Ordering::AcqRel);
            if prev > 0 {
                self.total.fetch_sub(prev, Ordering::AcqRel);
            }
            oldest += 1;
            self.oldest_valid.store(oldest, Ordering::Release);
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn oldest_valid(&self) -> u64 {
        self.oldest_valid.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn bucket_sum(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Acquire)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn inc_inside_window_counts() {
        let c = SlicedCounter::new(10, 100);
        for unit in 100..100 + BUCKET_COUNT {
            assert!(c.inc(unit));
        }
        assert_eq!(c.total(), BUCKET_COUNT);
        assert_eq!(c.bucket_sum(), BUCKET_COUNT);
    }

    #[test]
    fn inc_outside_window_is_rejected() {
        let c = SlicedCounter::new(10, 100);
        assert!(c.inc(100));
        assert!(!c.inc(100 + BUCKET_COUNT));
        assert!(!c.inc(100 + 5 * BUCKET_COUNT));
        // Units before the window wrap around and are rejected too.
        assert!(!c.inc(99));
        assert_eq!(c.total(), 1);
    }

    #[test]
    fn erase_stale_keeps_fresh_units() {
        let c = SlicedCounter::new(3, 0);
        for unit in 0..6 {
            assert!(c.inc(unit));
            assert!(c.inc(unit));
        }
        assert_eq!(c.total(), 12);

        // stale = 2: units 0..=2 go away.
        c.erase_stale(5);
        assert_eq!(c.oldest_valid(), 3);
        assert_eq!(c.total(), 6);
        assert_eq!(c.total(), c.bucket_sum());
    }

    #[test]
    fn erase_stale_is_idempotent() {
        let c = SlicedCounter::new(3, 0);
        for unit in 0..8 {
            c.inc(unit);
        }
        c.erase_stale(7);
        let (oldest, total) = (c.oldest_valid(), c.total());
        c.erase_stale(7);
        assert_eq!(c.oldest_valid(), oldest);
        assert_eq!(c.total(), total);
    }

    #[test]
    fn erase_stale_jumps_over_long_idle_periods() {
        let c = SlicedCounter::new(5, 0);
        c.inc(0);
        c.inc(1);
        c.erase_stale(10_000);
        assert_eq!(c.total(), 0);
        assert_eq!(c.oldest_valid(), 10_000 - 5 + 1);
        assert!(c.inc(10_000));
        assert_eq!(c.total(), 1);
    }

    #[test]
    fn erase_stale_before_window_fills_is_noop() {
        let c = SlicedCounter::new(5, 2);
        c.inc(2);
        c.erase_stale(3);
        assert_eq!(c.total(), 1);
        assert_eq!(c.oldest_valid(), 2);
    }

    #[test]
    fn concurrent_inc_and_erase_keep_total_consistent() {
        let c = Arc::new(SlicedCounter::new(4, 0));
        let handles = (0..8)
            .map(|_| {
                let c = Arc::clone(&c);
                thread::spawn(move || {
                    let mut ok = 0u64;
                    for i in 0..1000u64 {
                        if c.inc(i % 16) {
                            ok += 1;
                        }
                    }
                    ok
                })
            })
            .collect::<Vec<_>>();

        let eraser = {
            let c = Arc::clone(&c);
            thread::spawn(move || {
                for now in 0..8 {
                    c.erase_stale(now);
                }
            })
        };

        for h in handles {
            h.join().expect("incrementer panicked");
        }
        eraser.join().expect("eraser panicked");

        assert_eq!(c.total(), c.bucket_sum());
    }
}
