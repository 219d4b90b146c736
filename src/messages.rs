// Message types exchanged with the rover's boards

use serde::{Deserialize, Serialize};

use crate::firmware::fault::{FaultKind, FaultOrigin, unpack_exception_data};

/// PID parameters shared by every motor kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorParams {
    pub p_gain: f32,
    pub i_gain: f32,
    pub d_gain: f32,
    pub i_cap: f32,
    pub i_decay: f32,
    pub overcurrent_thresh: f32,
    /// Control level above which stall checks apply; 255 disables them
    pub stall_check: f32,
    pub dead_zone: f32,
}

impl Default for MotorParams {
    fn default() -> Self {
        Self {
            p_gain: 0.0,
            i_gain: 0.0,
            d_gain: 0.0,
            i_cap: 0.0,
            i_decay: 0.0,
            overcurrent_thresh: 10.0,
            stall_check: 255.0,
            dead_zone: 1.0,
        }
    }
}

/// Parameters for a potentiometer-fed motor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PosMotorParams {
    #[serde(flatten)]
    pub pid: MotorParams,
    /// Reading 0 on the pot maps to this
    pub calib_min: f32,
    /// Full scale on the pot maps to this
    pub calib_max: f32,
}

impl Default for PosMotorParams {
    fn default() -> Self {
        Self {
            pid: MotorParams::default(),
            calib_min: -100.0,
            calib_max: 100.0,
        }
    }
}

/// A latched fault as read from an exception data register
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    /// `None` for codes this host does not know
    pub kind: Option<FaultKind>,
    pub code: u8,
    pub origin: FaultOrigin,
}

impl FaultReport {
    pub fn from_exception_data(word: u16) -> Self {
        let (kind, origin) = unpack_exception_data(word);
        Self {
            kind,
            code: (word & 0xFF) as u8,
            origin,
        }
    }

    /// Whether this fault concerns motor `index` of board `address`. Faults
    /// naming another board, or no particular motor, concern both motors.
    pub fn affects_motor(&self, address: u8, index: u8) -> bool {
        if self.origin.device != address || self.origin.motor > 1 {
            return true;
        }
        self.origin.motor == index
    }
}

/// Common registers of a slave
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardStatus {
    pub address: u8,
    pub timer_ms: u16,
    pub bus_interval_ms: u16,
    pub fault: Option<FaultReport>,
}

/// Telemetry for one motor
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MotorSnapshot {
    pub actual: f32,
    pub error: f32,
    pub error_integral: f32,
    pub error_deriv: f32,
    pub control: u16,
    pub interval_ms: u16,
    pub current: u16,
    /// Drive motors only: encoder edges / 256
    pub odometry: Option<u16>,
    /// The board's latched fault concerns this motor
    pub faulted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveSteerSnapshot {
    pub status: BoardStatus,
    pub chassis: u16,
    pub drive: MotorSnapshot,
    pub steer: MotorSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiftSnapshot {
    pub status: BoardStatus,
    pub motors: [MotorSnapshot; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterSnapshot {
    pub temperatures: Vec<f32>,
    pub fault: Option<FaultReport>,
}

/// Link state reported by the runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    Ok,
    /// No complete poll within the link timeout
    Stale,
}

/// Everything one poll of the rover produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoverSnapshot {
    pub health: LinkHealth,
    pub master: Option<MasterSnapshot>,
    pub drive_steer: Vec<DriveSteerSnapshot>,
    pub lift: Vec<LiftSnapshot>,
}
