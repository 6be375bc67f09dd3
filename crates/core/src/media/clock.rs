use std::time::{Duration, Instant};

/// Tuning for [`PresentationClock`].
///
/// The defaults suit ~30 fps sources: one frame is 3000 ticks at 90 kHz and
/// anything longer than 100 ms between frames is treated as a stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockConfig {
    /// Timestamp ticks per second.
    pub clock_rate: u32,
    /// Step used when the measured delta is zero or clamped.
    pub default_step: u32,
    /// Largest measured delta accepted as-is.
    pub max_step: u32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            clock_rate: 90_000,
            default_step: 3_000,
            max_step: 9_000,
        }
    }
}

impl ClockConfig {
    /// Wall-clock length of one default step.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(self.default_step as u64 * 1_000_000_000 / self.clock_rate as u64)
    }

    fn ticks(&self, elapsed: Duration) -> u64 {
        (elapsed.as_nanos() * self.clock_rate as u128 / 1_000_000_000) as u64
    }
}

/// Monotonic, jitter-bounded presentation timestamps.
///
/// Each [`tick`](Self::tick) measures wall time since the previous call and
/// advances a running counter by that many ticks. Zero deltas (calls faster
/// than clock resolution) and deltas above `max_step` (stalls, restarts)
/// advance by `default_step` instead. The first call has nothing to measure
/// against and also advances by `default_step` from an origin of zero.
///
/// Owned by one manager instance; there is no global clock.
#[derive(Debug)]
pub struct PresentationClock {
    config: ClockConfig,
    last: Option<Instant>,
    current: u64,
}

impl PresentationClock {
    pub fn new(config: ClockConfig) -> Self {
        Self {
            config,
            last: None,
            current: 0,
        }
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Most recently returned timestamp (0 before the first tick).
    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn tick(&mut self) -> u64 {
        self.tick_at(Instant::now())
    }

    /// Advance using an explicit "now". An instant earlier than the previous
    /// one counts as a zero delta.
    pub fn tick_at(&mut self, now: Instant) -> u64 {
        let step = match self.last {
            None => self.config.default_step as u64,
            Some(prev) => {
                let delta = self.config.ticks(now.saturating_duration_since(prev));
                if delta == 0 || delta > self.config.max_step as u64 {
                    self.config.default_step as u64
                } else {
                    delta
                }
            }
        };
        self.last = Some(now);
        self.current += step;
        self.current
    }
}

impl Default for PresentationClock {
    fn default() -> Self {
        Self::new(ClockConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rapid_calls_advance_by_default_step() {
        let mut clock = PresentationClock::default();
        let now = Instant::now();
        let mut prev = clock.tick_at(now);
        assert_eq!(prev, 3000);
        for _ in 0..10 {
            let ts = clock.tick_at(now);
            assert_eq!(ts - prev, 3000);
            prev = ts;
        }
    }

    #[test]
    fn long_gap_is_clamped() {
        let mut clock = PresentationClock::default();
        let start = Instant::now();
        let first = clock.tick_at(start);
        let after_gap = clock.tick_at(start + Duration::from_secs(180));
        assert_eq!(after_gap - first, 3000);
    }

    #[test]
    fn measured_delta_within_bounds_is_used() {
        let mut clock = PresentationClock::default();
        let start = Instant::now();
        let first = clock.tick_at(start);
        let second = clock.tick_at(start + Duration::from_millis(40));
        assert_eq!(second - first, 3600);
    }

    #[test]
    fn never_decreases() {
        let mut clock = PresentationClock::new(ClockConfig {
            clock_rate: 90_000,
            default_step: 1500,
            max_step: 4500,
        });
        let base = Instant::now() + Duration::from_secs(10);
        let offsets_ms = [0u64, 5, 5, 3, 90, 20, 1000, 0, 16];
        let mut prev = 0;
        for ms in offsets_ms {
            let ts = clock.tick_at(base + Duration::from_millis(ms));
            assert!(ts > prev, "{ts} <= {prev}");
            prev = ts;
        }
        // Going backwards in wall time is still a forward step.
        let ts = clock.tick_at(base);
        assert_eq!(ts - prev, 1500);
    }

    #[test]
    fn frame_duration_matches_default_step() {
        assert_eq!(
            ClockConfig::default().frame_duration(),
            Duration::from_nanos(33_333_333)
        );
    }
}
