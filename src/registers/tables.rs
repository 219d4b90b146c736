// Compiled-in register tables for the rover boards
//
// Ids 0-8 are common to every slave. The drive/steer board carries a speed
// motor and a position motor, the lift board two position motors, and the
// master its own small table.

use super::{Register, RegisterTable};

// Common block
pub const REG_RESET: u8 = 0; // reset bits (write)
pub const REG_TIMER: u8 = 1; // millis since start
pub const REG_INTERVALI2C: u8 = 2; // interval between bus ticks (ms)
pub const REG_STATUS: u8 = 3; // status flags
pub const REG_DEBUGLED: u8 = 4;
pub const REG_EXCEPTIONDATA: u8 = 5; // LSB: type, MSB: origin. Write raises REMOTE
pub const REG_DISABLEDEXCEPTIONS: u8 = 6; // bitfield of disabled fault kinds
pub const REG_PING: u8 = 7;
pub const REG_DEBUG: u8 = 8;

/// First id after the common block
pub const FIRST_MOTOR_REG: u8 = 9;

// Drive/steer board
pub const REGDS_DRIVE_REQSPEED: u8 = 9;
pub const REGDS_DRIVE_PGAIN: u8 = 10;
pub const REGDS_DRIVE_IGAIN: u8 = 11;
pub const REGDS_DRIVE_DGAIN: u8 = 12;
pub const REGDS_DRIVE_INTEGRALCAP: u8 = 13;
pub const REGDS_DRIVE_INTEGRALDECAY: u8 = 14;
pub const REGDS_DRIVE_OVERCURRENTTHRESH: u8 = 15;
pub const REGDS_DRIVE_ACTUALSPEED: u8 = 16;
pub const REGDS_DRIVE_ERROR: u8 = 17;
pub const REGDS_DRIVE_ERRORINTEGRAL: u8 = 18;
pub const REGDS_DRIVE_ERRORDERIV: u8 = 19;
pub const REGDS_DRIVE_CONTROL: u8 = 20;
pub const REGDS_DRIVE_INTERVALCTRL: u8 = 21;
pub const REGDS_DRIVE_CURRENT: u8 = 22;
pub const REGDS_DRIVE_ODO: u8 = 23;
pub const REGDS_DRIVE_STALLCHECK: u8 = 24;
pub const REGDS_DRIVE_DEADZONE: u8 = 25;
pub const REGDS_STEER_REQPOS: u8 = 26;
pub const REGDS_STEER_PGAIN: u8 = 27;
pub const REGDS_STEER_IGAIN: u8 = 28;
pub const REGDS_STEER_DGAIN: u8 = 29;
pub const REGDS_STEER_INTEGRALCAP: u8 = 30;
pub const REGDS_STEER_INTEGRALDECAY: u8 = 31;
pub const REGDS_STEER_OVERCURRENTTHRESH: u8 = 32;
pub const REGDS_STEER_ACTUALPOS: u8 = 33;
pub const REGDS_STEER_ERROR: u8 = 34;
pub const REGDS_STEER_ERRORINTEGRAL: u8 = 35;
pub const REGDS_STEER_ERRORDERIV: u8 = 36;
pub const REGDS_STEER_CONTROL: u8 = 37;
pub const REGDS_STEER_INTERVALCTRL: u8 = 38;
pub const REGDS_STEER_CURRENT: u8 = 39;
pub const REGDS_STEER_STALLCHECK: u8 = 40;
pub const REGDS_STEER_DEADZONE: u8 = 41;
pub const REGDS_STEER_CALIBMIN: u8 = 42;
pub const REGDS_STEER_CALIBMAX: u8 = 43;
pub const REGDS_CHASSIS: u8 = 44;

// Lift board: two identical position-motor blocks
pub const REGLL_ONE_BASE: u8 = 9;
pub const REGLL_TWO_BASE: u8 = 27;
pub const REGLL_ONE_REQPOS: u8 = 9;
pub const REGLL_ONE_ACTUALPOS: u8 = 16;
pub const REGLL_ONE_CURRENT: u8 = 22;
pub const REGLL_TWO_REQPOS: u8 = 27;
pub const REGLL_TWO_ACTUALPOS: u8 = 34;
pub const REGLL_TWO_CURRENT: u8 = 40;

// Master
pub const REGMASTER_RESET: u8 = 0;
pub const REGMASTER_TEMPAMBIENT: u8 = 1;
pub const REGMASTER_EXCEPTIONDATA: u8 = 11;
pub const MASTER_TEMP_COUNT: usize = 10;

/// Status register bit: a fault is latched
pub const ST_EXCEPTION: u16 = 0x01;

/// Reset register bits
pub const RESET_EXCEPTIONS: u16 = 0x01;
pub const RESET_ODO: u16 = 0x02;
pub const RESET_HARD: u16 = 0x04;

/// Fields of a motor register block. Each block kind lists them in its own
/// wire order below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorField {
    Required,
    PGain,
    IGain,
    DGain,
    IntegralCap,
    IntegralDecay,
    OvercurrentThresh,
    Actual,
    Error,
    ErrorIntegral,
    ErrorDeriv,
    Control,
    IntervalCtrl,
    Current,
    Odometry,
    StallCheck,
    DeadZone,
    CalibMin,
    CalibMax,
}

use MotorField::*;

pub const DRIVE_FIELDS: [MotorField; 17] = [
    Required,
    PGain,
    IGain,
    DGain,
    IntegralCap,
    IntegralDecay,
    OvercurrentThresh,
    Actual,
    Error,
    ErrorIntegral,
    ErrorDeriv,
    Control,
    IntervalCtrl,
    Current,
    Odometry,
    StallCheck,
    DeadZone,
];

pub const STEER_FIELDS: [MotorField; 18] = [
    Required,
    PGain,
    IGain,
    DGain,
    IntegralCap,
    IntegralDecay,
    OvercurrentThresh,
    Actual,
    Error,
    ErrorIntegral,
    ErrorDeriv,
    Control,
    IntervalCtrl,
    Current,
    StallCheck,
    DeadZone,
    CalibMin,
    CalibMax,
];

pub const LIFT_FIELDS: [MotorField; 18] = [
    Required,
    PGain,
    IGain,
    DGain,
    IntegralCap,
    IntegralDecay,
    OvercurrentThresh,
    Actual,
    Error,
    ErrorIntegral,
    ErrorDeriv,
    Control,
    IntervalCtrl,
    Current,
    CalibMin,
    CalibMax,
    StallCheck,
    DeadZone,
];

const fn common_block() -> [Register; 9] {
    [
        Register::int(1, true),  // RESET
        Register::int(2, false), // TIMER
        Register::int(2, false), // INTERVALI2C
        Register::int(1, false), // STATUS
        Register::int(1, true),  // DEBUGLED
        Register::int(2, true),  // EXCEPTIONDATA
        Register::int(2, true),  // DISABLEDEXCEPTIONS
        Register::int(1, true),  // PING
        Register::int(2, true),  // DEBUG
    ]
}

const fn speed_block() -> [Register; 17] {
    [
        Register::float(2, true, -3000.0, 3000.0), // REQSPEED (ticks/s)
        Register::float(2, true, 0.0, 2.0),        // PGAIN
        Register::float(2, true, 0.0, 2.0),        // IGAIN
        Register::float(2, true, 0.0, 2.0),        // DGAIN
        Register::float(2, true, 0.0, 2000.0),     // INTEGRALCAP
        Register::float(1, true, 0.0, 1.0),        // INTEGRALDECAY
        Register::int(2, true),                    // OVERCURRENTTHRESH
        Register::float(2, false, -3000.0, 3000.0), // ACTUALSPEED
        Register::float(2, false, -6000.0, 6000.0), // ERROR
        Register::float(2, false, -2000.0, 2000.0), // ERRORINTEGRAL
        Register::float(2, false, -6000.0, 6000.0), // ERRORDERIV
        Register::int(1, false),                   // CONTROL
        Register::int(2, false),                   // INTERVALCTRL
        Register::int(2, false),                   // CURRENT
        Register::int(2, false),                   // ODO
        Register::int(1, true),                    // STALLCHECK
        Register::float(2, true, 0.0, 500.0),      // DEADZONE
    ]
}

const fn position_core() -> [Register; 14] {
    [
        Register::float(2, true, -180.0, 180.0), // REQPOS (degrees)
        Register::float(2, true, 0.0, 50.0),     // PGAIN
        Register::float(2, true, 0.0, 10.0),     // IGAIN
        Register::float(2, true, 0.0, 50.0),     // DGAIN
        Register::float(2, true, 0.0, 1000.0),   // INTEGRALCAP
        Register::float(1, true, 0.0, 1.0),      // INTEGRALDECAY
        Register::int(2, true),                  // OVERCURRENTTHRESH
        Register::float(2, false, -180.0, 180.0), // ACTUALPOS
        Register::float(2, false, -360.0, 360.0), // ERROR
        Register::float(2, false, -1000.0, 1000.0), // ERRORINTEGRAL
        Register::float(2, false, -360.0, 360.0), // ERRORDERIV
        Register::int(1, false),                 // CONTROL
        Register::int(2, false),                 // INTERVALCTRL
        Register::int(2, false),                 // CURRENT
    ]
}

const STALLCHECK: Register = Register::int(1, true);
const POS_DEADZONE: Register = Register::float(2, true, 0.0, 90.0);
const CALIB: Register = Register::float(2, true, -180.0, 180.0);

const fn build_drive_steer() -> [Register; 46] {
    let mut t = [Register::sentinel(); 46];
    let common = common_block();
    let speed = speed_block();
    let pos = position_core();
    let mut i = 0;
    while i < 9 {
        t[i] = common[i];
        i += 1;
    }
    let mut j = 0;
    while j < 17 {
        t[9 + j] = speed[j];
        j += 1;
    }
    let mut k = 0;
    while k < 14 {
        t[26 + k] = pos[k];
        k += 1;
    }
    t[40] = STALLCHECK;
    t[41] = POS_DEADZONE;
    t[42] = CALIB;
    t[43] = CALIB;
    t[44] = Register::int(2, false); // CHASSIS
    t
}

const fn build_lift() -> [Register; 46] {
    let mut t = [Register::sentinel(); 46];
    let common = common_block();
    let pos = position_core();
    let mut i = 0;
    while i < 9 {
        t[i] = common[i];
        i += 1;
    }
    let mut m = 0;
    while m < 2 {
        let base = 9 + m * 18;
        let mut k = 0;
        while k < 14 {
            t[base + k] = pos[k];
            k += 1;
        }
        t[base + 14] = CALIB;
        t[base + 15] = CALIB;
        t[base + 16] = STALLCHECK;
        t[base + 17] = POS_DEADZONE;
        m += 1;
    }
    t
}

const fn build_master() -> [Register; 13] {
    let mut t = [Register::sentinel(); 13];
    t[0] = Register::int(1, true); // RESET
    let mut i = 1;
    while i <= MASTER_TEMP_COUNT {
        t[i] = Register::float(2, false, -50.0, 150.0);
        i += 1;
    }
    t[11] = Register::int(2, false); // EXCEPTIONDATA
    t
}

pub static DRIVE_STEER_REGS: [Register; 46] = build_drive_steer();
pub static LIFT_REGS: [Register; 46] = build_lift();
pub static MASTER_REGS: [Register; 13] = build_master();

/// Which table a board speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardKind {
    Master,
    DriveSteer,
    Lift,
}

impl BoardKind {
    pub fn table(self) -> RegisterTable {
        match self {
            BoardKind::Master => RegisterTable::scan("master", &MASTER_REGS),
            BoardKind::DriveSteer => RegisterTable::scan("drive_steer", &DRIVE_STEER_REGS),
            BoardKind::Lift => RegisterTable::scan("lift", &LIFT_REGS),
        }
    }
}

/// Where a motor register lives: motor index on the board plus field
pub fn locate_motor_field(kind: BoardKind, reg: u8) -> Option<(usize, MotorField)> {
    let r = reg as usize;
    match kind {
        BoardKind::Master => None,
        BoardKind::DriveSteer => match r {
            9..=25 => Some((0, DRIVE_FIELDS[r - 9])),
            26..=43 => Some((1, STEER_FIELDS[r - 26])),
            _ => None,
        },
        BoardKind::Lift => match r {
            9..=26 => Some((0, LIFT_FIELDS[r - 9])),
            27..=44 => Some((1, LIFT_FIELDS[r - 27])),
            _ => None,
        },
    }
}

/// Inverse of `locate_motor_field`
pub fn motor_field_reg(kind: BoardKind, motor: usize, field: MotorField) -> Option<u8> {
    let (base, fields): (usize, &[MotorField]) = match (kind, motor) {
        (BoardKind::DriveSteer, 0) => (9, &DRIVE_FIELDS),
        (BoardKind::DriveSteer, 1) => (26, &STEER_FIELDS),
        (BoardKind::Lift, 0) => (9, &LIFT_FIELDS),
        (BoardKind::Lift, 1) => (27, &LIFT_FIELDS),
        _ => return None,
    };
    fields
        .iter()
        .position(|f| *f == field)
        .map(|p| (base + p) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lengths() {
        assert_eq!(BoardKind::DriveSteer.table().len(), 45);
        assert_eq!(BoardKind::Lift.table().len(), 45);
        assert_eq!(BoardKind::Master.table().len(), 12);
    }

    #[test]
    fn test_field_layout_matches_ids() {
        let ds = BoardKind::DriveSteer;
        assert_eq!(motor_field_reg(ds, 0, MotorField::Odometry), Some(REGDS_DRIVE_ODO));
        assert_eq!(motor_field_reg(ds, 0, MotorField::DeadZone), Some(REGDS_DRIVE_DEADZONE));
        assert_eq!(motor_field_reg(ds, 1, MotorField::CalibMax), Some(REGDS_STEER_CALIBMAX));
        assert_eq!(motor_field_reg(ds, 1, MotorField::Current), Some(REGDS_STEER_CURRENT));
        assert_eq!(motor_field_reg(ds, 1, MotorField::Odometry), None);

        let ll = BoardKind::Lift;
        assert_eq!(motor_field_reg(ll, 0, MotorField::Actual), Some(REGLL_ONE_ACTUALPOS));
        assert_eq!(motor_field_reg(ll, 1, MotorField::Required), Some(REGLL_TWO_REQPOS));
        assert_eq!(motor_field_reg(ll, 1, MotorField::Current), Some(REGLL_TWO_CURRENT));
        assert_eq!(motor_field_reg(ll, 1, MotorField::DeadZone), Some(44));
    }

    #[test]
    fn test_locate_round_trips() {
        for kind in [BoardKind::DriveSteer, BoardKind::Lift] {
            for reg in FIRST_MOTOR_REG..45 {
                if let Some((motor, field)) = locate_motor_field(kind, reg) {
                    assert_eq!(motor_field_reg(kind, motor, field), Some(reg));
                }
            }
        }
        assert_eq!(locate_motor_field(BoardKind::DriveSteer, REGDS_CHASSIS), None);
    }

    #[test]
    fn test_writability() {
        let t = BoardKind::DriveSteer.table();
        assert!(t.check_and_load(REGDS_DRIVE_REQSPEED, true).is_ok());
        assert!(t.check_and_load(REGDS_DRIVE_ACTUALSPEED, true).is_err());
        assert!(t.check_and_load(REG_STATUS, true).is_err());
        assert!(t.check_and_load(REG_EXCEPTIONDATA, true).is_ok());
        let m = BoardKind::Master.table();
        assert!(m.check_and_load(REGMASTER_EXCEPTIONDATA, true).is_err());
    }
}
