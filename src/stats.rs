//! Downlink throughput statistics.
//!
//! Rates are estimated over fixed reporting intervals and smoothed with the
//! previous interval. The first cycles after any reconfiguration are treated
//! as warm-up and excluded, since they include whatever backlog built up
//! while the output was being changed.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

pub const DEFAULT_STATS_INTERVAL_MS: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsState {
    /// Warm-up cycles, then accumulating the first reporting interval.
    Warmup,
    /// One interval reported, averages are raw rates.
    FirstInterval,
    /// Averages are smoothed over two intervals.
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub state: StatsState,
    pub valid: bool,
    pub avg_packets_per_sec: f64,
    pub avg_bytes_per_sec: f64,
    pub warmup_cycles_remaining: u32,
    pub cycle_period_ms: u32,
}

#[derive(Debug, Clone)]
pub struct StatisticsEngine {
    state: StatsState,
    cycle_period_ms: u32,
    interval_ms: u32,
    warmup_cycles_remaining: u32,

    interval_elapsed_ms: f64,
    interval_packets: u64,
    interval_bytes: u64,

    avg_packets_per_sec: f64,
    avg_bytes_per_sec: f64,
    prev_avg_packets: f64,
    prev_avg_bytes: f64,

    last_sample: Option<Instant>,
}

impl StatisticsEngine {
    pub fn new(cycle_period_ms: u32, warmup_delay_ms: u32, interval_ms: u32) -> Self {
        let mut engine = Self {
            state: StatsState::Warmup,
            cycle_period_ms: cycle_period_ms.max(1),
            interval_ms,
            warmup_cycles_remaining: 1,
            interval_elapsed_ms: 0.0,
            interval_packets: 0,
            interval_bytes: 0,
            avg_packets_per_sec: 0.0,
            avg_bytes_per_sec: 0.0,
            prev_avg_packets: 0.0,
            prev_avg_bytes: 0.0,
            last_sample: None,
        };
        engine.reinit(None, warmup_delay_ms);
        engine
    }

    /// Restart the estimate. `cycle_period_ms` of `None` keeps the current period.
    pub fn reinit(&mut self, cycle_period_ms: Option<u32>, warmup_delay_ms: u32) {
        if let Some(period) = cycle_period_ms.filter(|&p| p > 0) {
            self.cycle_period_ms = period;
        }

        self.state = StatsState::Warmup;
        self.warmup_cycles_remaining = warmup_cycles(self.cycle_period_ms, warmup_delay_ms);

        self.interval_elapsed_ms = 0.0;
        self.interval_packets = 0;
        self.interval_bytes = 0;

        self.prev_avg_packets = 0.0;
        self.prev_avg_bytes = 0.0;
        self.avg_packets_per_sec = 0.0;
        self.avg_bytes_per_sec = 0.0;

        debug!(
            cycle_period_ms = self.cycle_period_ms,
            warmup_cycles = self.warmup_cycles_remaining,
            "statistics reinitialised"
        );
    }

    /// Advance one output cycle.
    pub fn update(&mut self, packets_sent: u32, bytes_sent: u64, now: Instant) {
        if self.warmup_cycles_remaining > 0 {
            self.warmup_cycles_remaining -= 1;
            self.last_sample = Some(now);
            return;
        }

        let elapsed = self
            .last_sample
            .map_or(0.0, |prev| now.saturating_duration_since(prev).as_micros() as f64 / 1000.0);
        self.last_sample = Some(now);

        self.interval_elapsed_ms += elapsed;
        self.interval_packets += u64::from(packets_sent);
        self.interval_bytes += bytes_sent;

        if self.interval_elapsed_ms < f64::from(self.interval_ms) {
            return;
        }

        let seconds = self.interval_elapsed_ms / 1000.0;
        let raw_packets = self.interval_packets as f64 / seconds;
        let raw_bytes = self.interval_bytes as f64 / seconds;

        debug!(
            interval_secs = seconds,
            interval_pkts = self.interval_packets,
            interval_bytes = self.interval_bytes,
            "statistics interval complete"
        );

        match self.state {
            StatsState::Warmup => {
                self.avg_packets_per_sec = raw_packets;
                self.avg_bytes_per_sec = raw_bytes;
                self.state = StatsState::FirstInterval;
            }
            StatsState::FirstInterval | StatsState::Steady => {
                self.avg_packets_per_sec = (raw_packets + self.prev_avg_packets) / 2.0;
                self.avg_bytes_per_sec = (raw_bytes + self.prev_avg_bytes) / 2.0;
                self.state = StatsState::Steady;
            }
        }

        self.prev_avg_packets = raw_packets;
        self.prev_avg_bytes = raw_bytes;

        self.interval_elapsed_ms = 0.0;
        self.interval_packets = 0;
        self.interval_bytes = 0;
    }

    pub fn state(&self) -> StatsState {
        self.state
    }

    pub fn is_valid(&self) -> bool {
        self.state == StatsState::Steady
    }

    pub fn avg_packets_per_sec(&self) -> f64 {
        self.avg_packets_per_sec
    }

    pub fn avg_bytes_per_sec(&self) -> f64 {
        self.avg_bytes_per_sec
    }

    pub fn cycle_period_ms(&self) -> u32 {
        self.cycle_period_ms
    }

    pub fn warmup_cycles_remaining(&self) -> u32 {
        self.warmup_cycles_remaining
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            state: self.state,
            valid: self.is_valid(),
            avg_packets_per_sec: self.avg_packets_per_sec,
            avg_bytes_per_sec: self.avg_bytes_per_sec,
            warmup_cycles_remaining: self.warmup_cycles_remaining,
            cycle_period_ms: self.cycle_period_ms,
        }
    }
}

/// At least one warm-up cycle, more when the delay spans several periods.
fn warmup_cycles(cycle_period_ms: u32, warmup_delay_ms: u32) -> u32 {
    if cycle_period_ms >= warmup_delay_ms {
        1
    } else {
        (warmup_delay_ms / cycle_period_ms).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn run(engine: &mut StatisticsEngine, start: Instant, cycles: u32, period_ms: u64, pkts: u32, bytes: u64) -> Instant {
        let mut now = start;
        for _ in 0..cycles {
            now += Duration::from_millis(period_ms);
            engine.update(pkts, bytes, now);
        }
        now
    }

    #[test]
    fn test_warmup_cycle_count() {
        assert_eq!(warmup_cycles(100, 50), 1);
        assert_eq!(warmup_cycles(100, 100), 1);
        assert_eq!(warmup_cycles(100, 5000), 50);
        assert_eq!(warmup_cycles(300, 1000), 3);
        assert_eq!(warmup_cycles(500, 0), 1);
    }

    #[test]
    fn test_warmup_excludes_traffic() {
        let mut engine = StatisticsEngine::new(100, 500, 1000);
        assert_eq!(engine.warmup_cycles_remaining(), 5);

        let start = Instant::now();
        run(&mut engine, start, 5, 100, 1000, 100_000);

        assert_eq!(engine.warmup_cycles_remaining(), 0);
        assert_eq!(engine.state(), StatsState::Warmup);
        assert_eq!(engine.avg_packets_per_sec(), 0.0);
    }

    #[test]
    fn test_first_interval_reports_raw_then_smooths() {
        let mut engine = StatisticsEngine::new(100, 100, 1000);
        let start = Instant::now();

        // One warm-up cycle, then ten cycles of 100 ms at 5 packets / 500 bytes
        let now = run(&mut engine, start, 1, 100, 0, 0);
        let now = run(&mut engine, now, 10, 100, 5, 500);

        assert_eq!(engine.state(), StatsState::FirstInterval);
        assert!(!engine.is_valid());
        assert!((engine.avg_packets_per_sec() - 50.0).abs() < 1e-6);
        assert!((engine.avg_bytes_per_sec() - 5000.0).abs() < 1e-6);

        // Second interval at twice the rate averages with the first
        run(&mut engine, now, 10, 100, 10, 1000);

        assert_eq!(engine.state(), StatsState::Steady);
        assert!(engine.is_valid());
        assert!((engine.avg_packets_per_sec() - 75.0).abs() < 1e-6);
        assert!((engine.avg_bytes_per_sec() - 7500.0).abs() < 1e-6);
    }

    #[test]
    fn test_smoothing_uses_previous_raw_rate() {
        let mut engine = StatisticsEngine::new(100, 100, 1000);
        let start = Instant::now();
        let now = run(&mut engine, start, 1, 100, 0, 0);
        let now = run(&mut engine, now, 10, 100, 1, 0); // raw 10
        let now = run(&mut engine, now, 10, 100, 3, 0); // raw 30 -> 20
        run(&mut engine, now, 10, 100, 5, 0); // raw 50 -> (50 + 30) / 2

        assert!((engine.avg_packets_per_sec() - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_reinit_returns_to_warmup() {
        let mut engine = StatisticsEngine::new(100, 100, 1000);
        let start = Instant::now();
        let now = run(&mut engine, start, 1, 100, 0, 0);
        run(&mut engine, now, 20, 100, 5, 500);
        assert!(engine.is_valid());

        engine.reinit(Some(50), 1000);

        assert_eq!(engine.state(), StatsState::Warmup);
        assert_eq!(engine.cycle_period_ms(), 50);
        assert_eq!(engine.warmup_cycles_remaining(), 20);
        assert_eq!(engine.avg_packets_per_sec(), 0.0);
        assert!(!engine.is_valid());
    }

    #[test]
    fn test_reinit_keeps_period_when_none() {
        let mut engine = StatisticsEngine::new(250, 0, 1000);
        engine.reinit(None, 1000);
        assert_eq!(engine.cycle_period_ms(), 250);
        assert_eq!(engine.warmup_cycles_remaining(), 4);
    }
}
