// H-bridge drive and current supervision for one motor
//
// The bridge has two direction lines and a PWM enable line. Current samples
// arrive at ADC rate: the instantaneous sample is checked against the
// overcurrent threshold and a filtered copy is kept for telemetry and stall
// classification.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, trace};

use super::fault::{FaultController, FaultKind, FaultListener, FaultOrigin};
use crate::config::{
    CURRENT_FALL, CURRENT_RISE, DEFAULT_OVERCURRENT_THRESHOLD, DEFAULT_STALL_CHECK,
    FAULT_DEBOUNCE_TICKS, HIGH_CONTROL, LOW_CURRENT, MAX_DUTY, NOMINAL_CURRENT,
};
use crate::fixed::{AsymmetricEma, Fixed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Stop,
    Brake,
    Forward,
    Reverse,
}

/// Output lines of one H-bridge
pub trait DrivePins {
    fn set_direction(&mut self, pos: bool, neg: bool);
    fn set_duty(&mut self, duty: u8);
}

/// Shared handle on the bridge so the fault controller can stop it from
/// inside a call that is already driving it
pub struct HBridge<P> {
    pins: RefCell<P>,
    state: Cell<Option<DriveState>>,
}

impl<P: DrivePins> HBridge<P> {
    pub fn new(pins: P) -> Self {
        Self {
            pins: RefCell::new(pins),
            state: Cell::new(None),
        }
    }

    pub fn state(&self) -> Option<DriveState> {
        self.state.get()
    }

    /// Drive the direction lines for `state`. STOP and BRAKE also set the
    /// enable line; nothing happens if the state is unchanged.
    pub fn set_state(&self, state: DriveState) {
        if self.state.get() == Some(state) {
            return;
        }
        let mut pins = self.pins.borrow_mut();
        let (pos, neg) = match state {
            DriveState::Stop => {
                pins.set_duty(0);
                (false, false)
            }
            DriveState::Brake => {
                pins.set_duty(MAX_DUTY);
                (true, true)
            }
            DriveState::Forward => (true, false),
            DriveState::Reverse => (false, true),
        };
        pins.set_direction(pos, neg);
        self.state.set(Some(state));
        trace!("Bridge state -> {:?}", state);
    }

    pub fn set_duty(&self, duty: u8) {
        self.pins.borrow_mut().set_duty(duty);
    }

    /// Access the pins, for tests and diagnostics
    pub fn with_pins<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.pins.borrow())
    }
}

impl<P: DrivePins> FaultListener for HBridge<P> {
    fn on_fault(&self, _origin: FaultOrigin, _kind: FaultKind) {
        self.set_state(DriveState::Stop);
    }
}

/// Stall/encoder/drive fault classifier. Off by default; when enabled a
/// condition must persist for `FAULT_DEBOUNCE_TICKS` checks before it latches.
#[derive(Debug, Clone, Copy, Default)]
pub struct StallPolicy {
    pub enabled: bool,
    ticks: u32,
}

impl StallPolicy {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ticks: 0,
        }
    }

    /// Classify a stationary motor from its filtered current
    pub fn classify(actual_speed: f32, control: u8, stall_check: u8, current: Fixed) -> Option<FaultKind> {
        if actual_speed >= 1.0 || control <= stall_check {
            return None;
        }
        Some(if current > NOMINAL_CURRENT {
            FaultKind::Stall
        } else if current >= LOW_CURRENT {
            FaultKind::EncoderFault
        } else {
            FaultKind::DriveFault
        })
    }

    /// Count a classification; returns the kind once it has persisted
    fn observe(&mut self, candidate: Option<FaultKind>) -> Option<FaultKind> {
        match candidate {
            Some(kind) => {
                self.ticks += 1;
                (self.ticks > FAULT_DEBOUNCE_TICKS).then_some(kind)
            }
            None => {
                self.ticks = 0;
                None
            }
        }
    }
}

pub struct MotorController<P> {
    origin: FaultOrigin,
    bridge: Rc<HBridge<P>>,
    control: u8,
    actual_speed: f32,
    current: AsymmetricEma,
    pub overcurrent_threshold: u16,
    pub stall_check: u8,
    pub stall_policy: StallPolicy,
}

impl<P: DrivePins + 'static> MotorController<P> {
    /// Take over the bridge, stop the motor and subscribe it to faults
    pub fn new(origin: FaultOrigin, pins: P, faults: &mut FaultController) -> Self {
        let bridge = Rc::new(HBridge::new(pins));
        faults.add_listener(bridge.clone());
        let mut motor = Self {
            origin,
            bridge,
            control: 0,
            actual_speed: 0.0,
            current: AsymmetricEma::new(CURRENT_RISE, CURRENT_FALL),
            overcurrent_threshold: DEFAULT_OVERCURRENT_THRESHOLD,
            stall_check: DEFAULT_STALL_CHECK,
            stall_policy: StallPolicy::default(),
        };
        motor.bridge.set_state(DriveState::Stop);
        motor.set_speed(0.0);
        motor
    }
}

impl<P: DrivePins> MotorController<P> {
    pub fn origin(&self) -> FaultOrigin {
        self.origin
    }

    pub fn bridge(&self) -> &HBridge<P> {
        &self.bridge
    }

    pub fn state(&self) -> Option<DriveState> {
        self.bridge.state()
    }

    /// Magnitude of the last commanded duty
    pub fn control(&self) -> u8 {
        self.control
    }

    pub fn actual_speed(&self) -> f32 {
        self.actual_speed
    }

    pub fn set_actual_speed(&mut self, speed: f32) {
        self.actual_speed = speed;
    }

    /// Filtered current in ADC units
    pub fn current(&self) -> u16 {
        self.current.value().to_int().min(u16::MAX as u32) as u16
    }

    pub fn filtered_current(&self) -> Fixed {
        self.current.value()
    }

    /// Drive at `speed`, clamped to full duty. The sign picks the direction.
    pub fn set_speed(&mut self, speed: f32) {
        let magnitude = speed.abs().min(MAX_DUTY as f32);
        self.control = magnitude as u8;
        self.bridge.set_state(if speed >= 0.0 {
            DriveState::Forward
        } else {
            DriveState::Reverse
        });
        self.bridge.set_duty(self.control);
    }

    /// Feed an instantaneous current sample
    pub fn set_current(&mut self, raw: i32, faults: &mut FaultController) {
        let raw = raw.max(0) as u32;
        if raw > self.overcurrent_threshold as u32 {
            let kind = if self.control > HIGH_CONTROL {
                FaultKind::Overcurrent
            } else {
                FaultKind::Short
            };
            debug!(
                "Motor {:?}: current {} over threshold {} at control {}",
                self.origin, raw, self.overcurrent_threshold, self.control
            );
            faults.raise(self.origin, kind);
        }
        self.current.update(Fixed::from_int(raw));
    }

    /// Run the stall classifier if enabled
    pub fn check_for_fault(&mut self, faults: &mut FaultController) {
        if !self.stall_policy.enabled {
            return;
        }
        let candidate = StallPolicy::classify(
            self.actual_speed,
            self.control,
            self.stall_check,
            self.current.value(),
        );
        if let Some(kind) = self.stall_policy.observe(candidate) {
            debug!(
                "Motor {:?}: {} at control {}, filtered current {:.2}",
                self.origin,
                kind,
                self.control,
                self.current.value().to_f32()
            );
            faults.raise(self.origin, kind);
        }
    }
}
