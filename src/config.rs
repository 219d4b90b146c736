// Timeouts, addresses, firmware tuning defaults and the link configuration file
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::fixed::Fixed;

// Host polling loop frequency
pub const LOOP_HZ: u64 = 10;

// Serial port for the master controller
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";
pub const DEFAULT_BAUD: u32 = 115200;

// How long a snapshot may be missing before the link is reported stale
pub const LINK_TIMEOUT: Duration = Duration::from_millis(1500);

// Read-set slots, one per board layout
pub const READSET_DRIVESTEER: u8 = 0;
pub const READSET_LIFT: u8 = 1;
pub const READSET_MASTER: u8 = 2;

// Board addresses behind the master (0 is the master itself)
pub const MASTER_ADDR: u8 = 0;
pub const DRIVE_STEER_ADDRS: [u8; 6] = [1, 2, 4, 5, 7, 8];
pub const LIFT_ADDRS: [u8; 3] = [3, 6, 9];

// Motor controller
pub const MAX_DUTY: u8 = 255;
// Control above this is a genuine overcurrent, below it a likely short
pub const HIGH_CONTROL: u8 = 250;
pub const DEFAULT_OVERCURRENT_THRESHOLD: u16 = 150;
// Set when a PID loop takes over the motor
pub const PID_OVERCURRENT_THRESHOLD: u16 = 300;
pub const DEFAULT_STALL_CHECK: u8 = 120;
pub const CURRENT_RISE: Fixed = Fixed::from_bits(26); // ~0.1
pub const CURRENT_FALL: Fixed = Fixed::from_bits(3); // ~0.01

// Filtered current bands for stall classification (ADC units)
pub const NOMINAL_CURRENT: Fixed = Fixed::from_int(10);
pub const LOW_CURRENT: Fixed = Fixed::from_int(1);

// Ticks a stall condition must persist before it latches
pub const FAULT_DEBOUNCE_TICKS: u32 = 50;

// Speed role: control decay per tick while the required speed is ~0
pub const MOTOR_SPEED_DECAY: f32 = 0.96;
pub const SPEED_ZERO_BAND: f32 = 0.001;

// Position role: potentiometer full scale and default calibration
pub const POT_FULL_SCALE: f32 = 1024.0;
pub const DEFAULT_CALIB_MIN: f32 = -512.0;
pub const DEFAULT_CALIB_MAX: f32 = 512.0;

// Quadrature encoder sampling window
pub const ENCODER_WINDOW_MICROS: u32 = 150_000;

// ADC scheduler
pub const MAX_ADC_READS: usize = 8;
pub const DEFAULT_ADC_INTERVAL: u16 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Link settings, loadable from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub port: String,
    pub baud: u32,
    pub simulate: bool,
    pub loop_hz: u64,
    pub drive_steer: Vec<u8>,
    pub lift: Vec<u8>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud: DEFAULT_BAUD,
            simulate: false,
            loop_hz: LOOP_HZ,
            drive_steer: DRIVE_STEER_ADDRS.to_vec(),
            lift: LIFT_ADDRS.to_vec(),
        }
    }
}

impl LinkConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(1000 / self.loop_hz.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let cfg: LinkConfig = serde_json::from_str(r#"{"port": "/dev/ttyUSB1", "simulate": true}"#).unwrap();
        assert_eq!(cfg.port, "/dev/ttyUSB1");
        assert!(cfg.simulate);
        assert_eq!(cfg.baud, DEFAULT_BAUD);
        assert_eq!(cfg.drive_steer, DRIVE_STEER_ADDRS.to_vec());
    }

    #[test]
    fn test_poll_period() {
        let cfg = LinkConfig {
            loop_hz: 0,
            ..LinkConfig::default()
        };
        assert_eq!(cfg.poll_period(), Duration::from_millis(1000));
        assert_eq!(LinkConfig::default().poll_period(), Duration::from_millis(100));
    }

    #[test]
    fn test_current_coefficients() {
        assert!((CURRENT_RISE.to_f32() - 0.1).abs() < 0.01);
        assert!((CURRENT_FALL.to_f32() - 0.01).abs() < 0.005);
    }
}
