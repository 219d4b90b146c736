// Quadrature encoder sampling
//
// The edge interrupt only bumps counters. The main loop turns them into a
// tick frequency once per window; direction is the majority vote of the
// companion channel sampled at each edge.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::ENCODER_WINDOW_MICROS;

#[derive(Debug)]
pub struct QuadEncoder {
    ticks: AtomicU32,
    negative: AtomicU32,
    odometry: AtomicU32,
    window: u32,
    prev_time: u32,
    frequency: f32,
}

impl QuadEncoder {
    pub fn new(now_micros: u32) -> Self {
        Self::with_window(now_micros, ENCODER_WINDOW_MICROS)
    }

    pub fn with_window(now_micros: u32, window: u32) -> Self {
        Self {
            ticks: AtomicU32::new(0),
            negative: AtomicU32::new(0),
            odometry: AtomicU32::new(0),
            window,
            prev_time: now_micros,
            frequency: 0.0,
        }
    }

    /// Edge interrupt on channel A. `companion_high` is channel B's level.
    pub fn tick(&self, companion_high: bool) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.odometry.fetch_add(1, Ordering::Relaxed);
        if companion_high {
            self.negative.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Recompute the frequency once more than a window has elapsed. Returns true when a
    /// new reading is available. A clock that went backwards restarts the
    /// window and drops its counts.
    pub fn update(&mut self, now_micros: u32) -> bool {
        if now_micros < self.prev_time {
            self.prev_time = now_micros;
            self.ticks.store(0, Ordering::Relaxed);
            self.negative.store(0, Ordering::Relaxed);
            return false;
        }
        let elapsed = now_micros - self.prev_time;
        if elapsed <= self.window {
            return false;
        }

        let ct = self.ticks.swap(0, Ordering::Relaxed);
        let neg = self.negative.swap(0, Ordering::Relaxed);
        let mut freq = ct as f32 * 1.0e6 / elapsed as f32;
        if neg > ct / 3 {
            freq = -freq;
        }
        self.frequency = freq;
        self.prev_time = now_micros;
        true
    }

    /// Signed ticks per second from the last window
    pub fn tick_freq(&self) -> f32 {
        self.frequency
    }

    /// Total edges since the last odometry reset
    pub fn odometry(&self) -> u32 {
        self.odometry.load(Ordering::Relaxed)
    }

    pub fn reset_odometry(&self) {
        self.odometry.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(enc: &QuadEncoder, forward: u32, backward: u32) {
        for _ in 0..forward {
            enc.tick(false);
        }
        for _ in 0..backward {
            enc.tick(true);
        }
    }

    #[test]
    fn test_forward_frequency() {
        let mut enc = QuadEncoder::new(0);
        feed(&enc, 30, 0);
        assert!(!enc.update(100_000));
        assert!(enc.update(150_001));
        assert!((enc.tick_freq() - 200.0).abs() < 0.01);
    }

    #[test]
    fn test_window_closes_only_after_it_is_over() {
        let mut enc = QuadEncoder::new(0);
        feed(&enc, 30, 0);
        assert!(!enc.update(150_000));
        assert_eq!(enc.tick_freq(), 0.0);
        assert!(enc.update(150_001));
        assert!(enc.tick_freq() > 0.0);
    }

    #[test]
    fn test_majority_negative() {
        let mut enc = QuadEncoder::new(0);
        // 14 of 40 is over a third
        feed(&enc, 26, 14);
        assert!(enc.update(200_000));
        assert_eq!(enc.tick_freq(), -200.0);

        // 13 of 40 is not
        feed(&enc, 27, 13);
        assert!(enc.update(400_000));
        assert_eq!(enc.tick_freq(), 200.0);
    }

    #[test]
    fn test_backwards_time_discards_window() {
        let mut enc = QuadEncoder::new(1_000_000);
        feed(&enc, 0, 90);
        assert!(!enc.update(500));

        feed(&enc, 40, 0);
        assert!(enc.update(200_500));
        assert_eq!(enc.tick_freq(), 200.0);
    }

    #[test]
    fn test_odometry_survives_windows() {
        let mut enc = QuadEncoder::new(0);
        feed(&enc, 5, 5);
        enc.update(200_000);
        feed(&enc, 3, 0);
        assert_eq!(enc.odometry(), 13);
        enc.reset_odometry();
        assert_eq!(enc.odometry(), 0);
    }
}
