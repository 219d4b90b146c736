// Interval-based PID estimator
//
// Derivative is taken on the measurement rather than the error so a setpoint
// step does not kick the output. The integral decays each tick and is
// clamped to the cap.

/// PID state and gains. All fields except the bookkeeping are exposed as
/// registers.
#[derive(Debug, Clone, Default)]
pub struct PidLoop {
    pub required: f32,
    pub actual: f32,
    pub p_gain: f32,
    pub i_gain: f32,
    pub d_gain: f32,
    pub error: f32,
    pub integral: f32,
    pub derivative: f32,
    pub integral_cap: f32,
    pub integral_decay: f32,
    pub dead_zone: f32,
    /// Milliseconds between the last two ticks
    pub interval_ms: u32,
    prev_actual: f32,
    prev_time: u32,
}

impl PidLoop {
    /// All gains and limits start at zero
    pub fn new(now_micros: u32) -> Self {
        Self {
            prev_time: now_micros,
            ..Self::default()
        }
    }

    /// Update error, integral and derivative for this tick. Returns false,
    /// touching nothing but the timestamp, if the clock went backwards.
    pub fn step(&mut self, now_micros: u32) -> bool {
        if now_micros < self.prev_time {
            self.prev_time = now_micros;
            return false;
        }
        self.interval_ms = (now_micros - self.prev_time) / 1000;
        self.prev_time = now_micros;

        self.error = self.required - self.actual;
        if self.error.abs() < self.dead_zone {
            self.error = 0.0;
        }

        self.integral += self.error;
        self.integral *= self.integral_decay;
        if self.integral > self.integral_cap {
            self.integral = self.integral_cap;
        }
        if self.integral < -self.integral_cap {
            self.integral = -self.integral_cap;
        }

        self.derivative = -(self.actual - self.prev_actual);
        self.prev_actual = self.actual;
        true
    }

    pub fn output(&self) -> f32 {
        self.p_gain * self.error + self.i_gain * self.integral + self.d_gain * self.derivative
    }

    /// `step` followed by `output`
    pub fn correction(&mut self, now_micros: u32) -> Option<f32> {
        self.step(now_micros).then(|| self.output())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuned(now: u32) -> PidLoop {
        let mut pid = PidLoop::new(now);
        pid.p_gain = 2.0;
        pid.i_gain = 0.5;
        pid.d_gain = 1.0;
        pid.integral_cap = 10.0;
        pid.integral_decay = 1.0;
        pid
    }

    #[test]
    fn test_proportional_and_interval() {
        let mut pid = tuned(1_000);
        pid.required = 3.0;
        let out = pid.correction(21_000).unwrap();
        assert_eq!(pid.interval_ms, 20);
        assert_eq!(pid.error, 3.0);
        assert_eq!(pid.integral, 3.0);
        // derivative on a static measurement is zero
        assert_eq!(out, 2.0 * 3.0 + 0.5 * 3.0);
    }

    #[test]
    fn test_backwards_clock_skips_tick() {
        let mut pid = tuned(50_000);
        pid.required = 1.0;
        assert_eq!(pid.correction(10_000), None);
        assert_eq!(pid.integral, 0.0);
        assert_eq!(pid.error, 0.0);
        // bookkeeping moved to the new time
        assert!(pid.correction(20_000).is_some());
        assert_eq!(pid.interval_ms, 10);
    }

    #[test]
    fn test_dead_zone() {
        let mut pid = tuned(0);
        pid.dead_zone = 0.5;
        pid.required = 0.3;
        pid.step(1000);
        assert_eq!(pid.error, 0.0);
        pid.required = -0.6;
        pid.step(2000);
        assert_eq!(pid.error, -0.6);
    }

    #[test]
    fn test_derivative_on_measurement() {
        let mut pid = tuned(0);
        pid.actual = 1.0;
        pid.step(1000);
        pid.actual = 4.0;
        // setpoint jump does not show up in the derivative
        pid.required = 100.0;
        pid.step(2000);
        assert_eq!(pid.derivative, -3.0);
    }

    #[test]
    fn test_integral_stays_within_cap() {
        let mut pid = tuned(0);
        pid.integral_decay = 0.98;
        let mut now = 0;
        let setpoints = [500.0, -500.0, 3.0, 0.0, 1e6, -1e6, 0.01];
        for i in 0..700 {
            pid.required = setpoints[i % setpoints.len()] * ((i % 5) as f32 - 2.0);
            pid.actual = (i % 13) as f32;
            now += 7_000;
            pid.step(now);
            assert!(pid.integral.abs() <= pid.integral_cap, "tick {}: {}", i, pid.integral);
        }
    }

    #[test]
    fn test_zero_decay_clears_integral() {
        let mut pid = tuned(0);
        pid.integral_decay = 0.0;
        pid.required = 5.0;
        pid.step(1000);
        assert_eq!(pid.integral, 0.0);
    }
}
