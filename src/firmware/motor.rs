// Closed-loop motor: drive + PID + an estimator chosen by role
//
// Position motors read a potentiometer through the ADC; speed motors read a
// quadrature encoder. While a fault is latched the estimator keeps running
// and the setpoint tracks the measurement, but nothing reaches the bridge.

use super::adc::AdcKind;
use super::drive::{DrivePins, MotorController};
use super::encoder::QuadEncoder;
use super::fault::{FaultController, FaultOrigin};
use super::pid::PidLoop;
use crate::config::{
    DEFAULT_CALIB_MAX, DEFAULT_CALIB_MIN, MOTOR_SPEED_DECAY, PID_OVERCURRENT_THRESHOLD,
    POT_FULL_SCALE, SPEED_ZERO_BAND,
};
use crate::registers::tables::MotorField;

#[derive(Debug)]
pub enum MotorRole {
    Position {
        calib_min: f32,
        calib_max: f32,
        /// A potentiometer reading arrived since the last update
        updated: bool,
    },
    Speed {
        encoder: QuadEncoder,
        /// Accumulated output
        ctl: f32,
    },
}

pub struct ControlledMotor<P> {
    drive: MotorController<P>,
    pid: PidLoop,
    role: MotorRole,
}

impl<P: DrivePins + 'static> ControlledMotor<P> {
    fn with_role(origin: FaultOrigin, pins: P, faults: &mut FaultController, now: u32, role: MotorRole) -> Self {
        let mut drive = MotorController::new(origin, pins, faults);
        drive.overcurrent_threshold = PID_OVERCURRENT_THRESHOLD;
        Self {
            drive,
            pid: PidLoop::new(now),
            role,
        }
    }

    pub fn position(origin: FaultOrigin, pins: P, faults: &mut FaultController, now: u32) -> Self {
        let role = MotorRole::Position {
            calib_min: DEFAULT_CALIB_MIN,
            calib_max: DEFAULT_CALIB_MAX,
            updated: false,
        };
        Self::with_role(origin, pins, faults, now, role)
    }

    pub fn speed(origin: FaultOrigin, pins: P, faults: &mut FaultController, now: u32) -> Self {
        let role = MotorRole::Speed {
            encoder: QuadEncoder::new(now),
            ctl: 0.0,
        };
        Self::with_role(origin, pins, faults, now, role)
    }
}

impl<P: DrivePins> ControlledMotor<P> {
    pub fn drive(&self) -> &MotorController<P> {
        &self.drive
    }

    pub fn drive_mut(&mut self) -> &mut MotorController<P> {
        &mut self.drive
    }

    pub fn pid(&self) -> &PidLoop {
        &self.pid
    }

    pub fn pid_mut(&mut self) -> &mut PidLoop {
        &mut self.pid
    }

    pub fn role(&self) -> &MotorRole {
        &self.role
    }

    /// Encoder of a speed motor, for the edge interrupt
    pub fn encoder(&self) -> Option<&QuadEncoder> {
        match &self.role {
            MotorRole::Speed { encoder, .. } => Some(encoder),
            MotorRole::Position { .. } => None,
        }
    }

    /// Odometry as exposed on the bus: edges / 256
    pub fn odometry(&self) -> Option<u16> {
        self.encoder().map(|e| (e.odometry() >> 8) as u16)
    }

    pub fn reset_odometry(&self) {
        if let Some(e) = self.encoder() {
            e.reset_odometry();
        }
    }

    /// ADC callback: current for either role, position for position motors
    pub fn on_adc(&mut self, kind: AdcKind, raw: u16, faults: &mut FaultController) {
        match (kind, &mut self.role) {
            (AdcKind::Current, _) => self.drive.set_current(raw as i32, faults),
            (
                AdcKind::Position,
                MotorRole::Position {
                    calib_min,
                    calib_max,
                    updated,
                },
            ) => {
                self.pid.actual = raw as f32 * (*calib_max - *calib_min) / POT_FULL_SCALE + *calib_min;
                *updated = true;
            }
            (AdcKind::Position, MotorRole::Speed { .. }) => {}
        }
    }

    /// One control pass; runs only when the estimator has a fresh reading
    pub fn update(&mut self, now: u32, faults: &mut FaultController) {
        match &mut self.role {
            MotorRole::Position { updated, .. } => {
                if !*updated {
                    return;
                }
                *updated = false;
                if faults.is_active() {
                    self.pid.required = self.pid.actual;
                }
                if let Some(out) = self.pid.correction(now) {
                    if !faults.is_active() {
                        self.drive.set_speed(out);
                    }
                }
                self.drive.set_actual_speed(self.pid.derivative.abs());
                self.drive.check_for_fault(faults);
            }
            MotorRole::Speed { encoder, ctl } => {
                if encoder.update(now) {
                    self.pid.actual = encoder.tick_freq();
                    if faults.is_active() {
                        self.pid.required = self.pid.actual;
                    }
                    if let Some(t) = self.pid.correction(now) {
                        *ctl += t;
                        if self.pid.required.abs() < SPEED_ZERO_BAND {
                            *ctl *= MOTOR_SPEED_DECAY;
                        }
                        if !faults.is_active() {
                            self.drive.set_speed(*ctl);
                        }
                    }
                    self.drive.check_for_fault(faults);
                }
                // tick frequency is already a rate
                self.drive.set_actual_speed(self.pid.actual.abs());
            }
        }
    }

    /// Current value of a register-visible field
    pub fn field(&self, field: MotorField) -> f32 {
        let pid = &self.pid;
        match field {
            MotorField::Required => pid.required,
            MotorField::PGain => pid.p_gain,
            MotorField::IGain => pid.i_gain,
            MotorField::DGain => pid.d_gain,
            MotorField::IntegralCap => pid.integral_cap,
            MotorField::IntegralDecay => pid.integral_decay,
            MotorField::OvercurrentThresh => self.drive.overcurrent_threshold as f32,
            MotorField::Actual => pid.actual,
            MotorField::Error => pid.error,
            MotorField::ErrorIntegral => pid.integral,
            MotorField::ErrorDeriv => pid.derivative,
            MotorField::Control => self.drive.control() as f32,
            MotorField::IntervalCtrl => pid.interval_ms as f32,
            MotorField::Current => self.drive.current() as f32,
            MotorField::Odometry => self.odometry().unwrap_or(0) as f32,
            MotorField::StallCheck => self.drive.stall_check as f32,
            MotorField::DeadZone => pid.dead_zone,
            MotorField::CalibMin => match self.role {
                MotorRole::Position { calib_min, .. } => calib_min,
                MotorRole::Speed { .. } => 0.0,
            },
            MotorField::CalibMax => match self.role {
                MotorRole::Position { calib_max, .. } => calib_max,
                MotorRole::Speed { .. } => 0.0,
            },
        }
    }

    /// Store a writable field; read-only fields are left alone
    pub fn set_field(&mut self, field: MotorField, value: f32) {
        let pid = &mut self.pid;
        match field {
            MotorField::Required => pid.required = value,
            MotorField::PGain => pid.p_gain = value,
            MotorField::IGain => pid.i_gain = value,
            MotorField::DGain => pid.d_gain = value,
            MotorField::IntegralCap => pid.integral_cap = value,
            MotorField::IntegralDecay => pid.integral_decay = value,
            MotorField::OvercurrentThresh => self.drive.overcurrent_threshold = value as u16,
            MotorField::StallCheck => self.drive.stall_check = value as u8,
            MotorField::DeadZone => pid.dead_zone = value,
            MotorField::CalibMin => {
                if let MotorRole::Position { calib_min, .. } = &mut self.role {
                    *calib_min = value;
                }
            }
            MotorField::CalibMax => {
                if let MotorRole::Position { calib_max, .. } = &mut self.role {
                    *calib_max = value;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::drive::tests::RecordingPins;
    use crate::firmware::drive::DriveState;
    use crate::firmware::fault::FaultKind;

    fn position_motor() -> (ControlledMotor<RecordingPins>, FaultController) {
        let mut faults = FaultController::new();
        let m = ControlledMotor::position(FaultOrigin::new(3, 1), RecordingPins::default(), &mut faults, 0);
        faults.reset();
        (m, faults)
    }

    #[test]
    fn test_pot_calibration() {
        let (mut m, mut faults) = position_motor();
        m.on_adc(AdcKind::Position, 512, &mut faults);
        assert_eq!(m.pid().actual, 0.0);
        m.set_field(MotorField::CalibMin, -90.0);
        m.set_field(MotorField::CalibMax, 90.0);
        m.on_adc(AdcKind::Position, 256, &mut faults);
        assert_eq!(m.pid().actual, -45.0);
    }

    #[test]
    fn test_position_drives_towards_setpoint() {
        let (mut m, mut faults) = position_motor();
        m.set_field(MotorField::PGain, 2.0);
        m.set_field(MotorField::Required, 40.0);
        m.on_adc(AdcKind::Position, 512, &mut faults);
        m.update(10_000, &mut faults);
        assert_eq!(m.drive().control(), 80);
        assert_eq!(m.drive().state(), Some(DriveState::Forward));

        // no fresh reading, no update
        m.set_field(MotorField::Required, -40.0);
        m.update(20_000, &mut faults);
        assert_eq!(m.drive().state(), Some(DriveState::Forward));
    }

    #[test]
    fn test_position_actual_speed_is_reading_change() {
        let (mut m, mut faults) = position_motor();
        m.on_adc(AdcKind::Position, 512, &mut faults);
        m.update(10_000, &mut faults);
        assert_eq!(m.drive().actual_speed(), 0.0);

        // 0 to 50 in one control pass
        m.on_adc(AdcKind::Position, 768, &mut faults);
        m.update(20_000, &mut faults);
        assert_eq!(m.drive().actual_speed(), 50.0);
    }

    #[test]
    fn test_fault_snaps_setpoint_and_withholds_drive() {
        let (mut m, mut faults) = position_motor();
        m.set_field(MotorField::PGain, 2.0);
        m.set_field(MotorField::Required, 40.0);
        faults.raise(FaultOrigin::new(3, 0), FaultKind::Remote);
        assert_eq!(m.drive().state(), Some(DriveState::Stop));

        m.on_adc(AdcKind::Position, 600, &mut faults);
        m.update(10_000, &mut faults);
        assert_eq!(m.pid().required, m.pid().actual);
        assert_eq!(m.drive().state(), Some(DriveState::Stop));
        assert_eq!(m.drive().bridge().with_pins(|p| p.duty), 0);
    }

    #[test]
    fn test_current_routes_to_drive() {
        let (mut m, mut faults) = position_motor();
        m.on_adc(AdcKind::Current, 301, &mut faults);
        // threshold is raised for PID-controlled motors
        assert_eq!(faults.active_fault().map(|f| f.0), Some(FaultKind::Short));
        assert_eq!(faults.active_fault().map(|f| f.1), Some(FaultOrigin::new(3, 1)));
    }

    #[test]
    fn test_speed_decays_when_stopped() {
        let mut faults = FaultController::new();
        let mut m = ControlledMotor::speed(FaultOrigin::new(1, 0), RecordingPins::default(), &mut faults, 0);
        faults.reset();
        m.set_field(MotorField::PGain, 1.0);
        m.set_field(MotorField::Required, 100.0);

        // 20 edges in a 200 ms window is 100 ticks/s: on target
        let encoder = m.encoder().unwrap();
        for _ in 0..20 {
            encoder.tick(false);
        }
        m.update(200_000, &mut faults);
        assert_eq!(m.pid().actual, 100.0);
        assert_eq!(m.drive().actual_speed(), 100.0);

        // build up 200 counts of output then ask for zero
        m.set_field(MotorField::Required, 200.0);
        m.update(400_000, &mut faults);
        let built_up = m.drive().control();
        assert_eq!(built_up, 200);

        m.set_field(MotorField::Required, 0.0);
        m.update(600_000, &mut faults);
        // error of 0 from a stopped wheel, so only the decay acts
        assert_eq!(m.drive().control(), (200.0 * MOTOR_SPEED_DECAY) as u8);
    }

    #[test]
    fn test_odometry_register_scaling() {
        let mut faults = FaultController::new();
        let m = ControlledMotor::speed(FaultOrigin::new(1, 0), RecordingPins::default(), &mut faults, 0);
        for _ in 0..515 {
            m.encoder().unwrap().tick(false);
        }
        assert_eq!(m.odometry(), Some(2));
        assert_eq!(m.field(MotorField::Odometry), 2.0);
        m.reset_odometry();
        assert_eq!(m.odometry(), Some(0));
    }
}
