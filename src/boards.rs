// Host-side views of the rover's boards
//
// Each reader owns a `SlaveDevice`, declares its board layout's read set and
// decodes batch reads positionally into snapshots. Read sets live on the
// master and are shared by every board of a layout, so one declaration per
// layout covers all boards of that kind.

use tracing::{debug, info, warn};

use crate::config::{LinkConfig, MASTER_ADDR, READSET_DRIVESTEER, READSET_LIFT, READSET_MASTER};
use crate::messages::{
    BoardStatus, DriveSteerSnapshot, FaultReport, LiftSnapshot, LinkHealth, MasterSnapshot,
    MotorParams, MotorSnapshot, PosMotorParams, RoverSnapshot,
};
use crate::protocol::{Bus, ProtocolError, Result, SlaveDevice, Transport, WriteBatch};
use crate::registers::RegisterError;
use crate::registers::tables::*;

pub const DRIVE_STEER_READ_SET: [u8; 20] = [
    REG_TIMER,
    REG_INTERVALI2C,
    REG_STATUS,
    REG_EXCEPTIONDATA,
    REGDS_CHASSIS,
    REGDS_DRIVE_ACTUALSPEED,
    REGDS_DRIVE_ERROR,
    REGDS_DRIVE_ERRORINTEGRAL,
    REGDS_DRIVE_ERRORDERIV,
    REGDS_DRIVE_CONTROL,
    REGDS_DRIVE_INTERVALCTRL,
    REGDS_DRIVE_CURRENT,
    REGDS_DRIVE_ODO,
    REGDS_STEER_ACTUALPOS,
    REGDS_STEER_ERROR,
    REGDS_STEER_ERRORINTEGRAL,
    REGDS_STEER_ERRORDERIV,
    REGDS_STEER_CONTROL,
    REGDS_STEER_INTERVALCTRL,
    REGDS_STEER_CURRENT,
];

pub const LIFT_READ_SET: [u8; 18] = [
    REG_TIMER,
    REG_INTERVALI2C,
    REG_STATUS,
    REG_EXCEPTIONDATA,
    REGLL_ONE_ACTUALPOS,
    REGLL_ONE_ACTUALPOS + 1,
    REGLL_ONE_ACTUALPOS + 2,
    REGLL_ONE_ACTUALPOS + 3,
    REGLL_ONE_ACTUALPOS + 4,
    REGLL_ONE_ACTUALPOS + 5,
    REGLL_ONE_CURRENT,
    REGLL_TWO_ACTUALPOS,
    REGLL_TWO_ACTUALPOS + 1,
    REGLL_TWO_ACTUALPOS + 2,
    REGLL_TWO_ACTUALPOS + 3,
    REGLL_TWO_ACTUALPOS + 4,
    REGLL_TWO_ACTUALPOS + 5,
    REGLL_TWO_CURRENT,
];

/// Temperatures first, then the master's exception data
pub const MASTER_READ_SET: [u8; 11] = [
    REGMASTER_TEMPAMBIENT,
    REGMASTER_TEMPAMBIENT + 1,
    REGMASTER_TEMPAMBIENT + 2,
    REGMASTER_TEMPAMBIENT + 3,
    REGMASTER_TEMPAMBIENT + 4,
    REGMASTER_TEMPAMBIENT + 5,
    REGMASTER_TEMPAMBIENT + 6,
    REGMASTER_TEMPAMBIENT + 7,
    REGMASTER_TEMPAMBIENT + 8,
    REGMASTER_TEMPAMBIENT + 9,
    REGMASTER_EXCEPTIONDATA,
];

/// Walks the values of the last read in set order
struct Fields<'a> {
    device: &'a SlaveDevice,
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(device: &'a SlaveDevice) -> Self {
        Self { device, pos: 0 }
    }

    fn short_read(&self) -> ProtocolError {
        ProtocolError::Malformed {
            reason: format!(
                "read from device {} ended at field {}",
                self.device.id(),
                self.pos
            ),
        }
    }

    fn int(&mut self) -> Result<u16> {
        let v = self.device.reg_int(self.pos).ok_or_else(|| self.short_read())?;
        self.pos += 1;
        Ok(v)
    }

    fn float(&mut self) -> Result<f32> {
        let v = self.device.reg_float(self.pos).ok_or_else(|| self.short_read())?;
        self.pos += 1;
        Ok(v)
    }

    fn status(&mut self) -> Result<BoardStatus> {
        let address = self.device.id();
        let timer_ms = self.int()?;
        let bus_interval_ms = self.int()?;
        let status = self.int()?;
        let exception = self.int()?;
        let fault = (status & ST_EXCEPTION != 0).then(|| FaultReport::from_exception_data(exception));
        Ok(BoardStatus {
            address,
            timer_ms,
            bus_interval_ms,
            fault,
        })
    }

    fn motor(&mut self, status: &BoardStatus, index: u8, with_odometry: bool) -> Result<MotorSnapshot> {
        let mut m = MotorSnapshot {
            actual: self.float()?,
            error: self.float()?,
            error_integral: self.float()?,
            error_deriv: self.float()?,
            control: self.int()?,
            interval_ms: self.int()?,
            current: self.int()?,
            ..Default::default()
        };
        if with_odometry {
            m.odometry = Some(self.int()?);
        }
        m.faulted = status
            .fault
            .as_ref()
            .is_some_and(|f| f.affects_motor(status.address, index));
        Ok(m)
    }
}

fn field_reg(kind: BoardKind, motor: usize, field: MotorField) -> Result<u8> {
    motor_field_reg(kind, motor, field).ok_or_else(|| RegisterError::NoSuchRegister { reg: u8::MAX }.into())
}

/// Queue the PID parameters of one motor
fn queue_params(batch: &mut WriteBatch, kind: BoardKind, motor: usize, p: &MotorParams) -> Result<()> {
    let fields = [
        (MotorField::PGain, p.p_gain),
        (MotorField::IGain, p.i_gain),
        (MotorField::DGain, p.d_gain),
        (MotorField::IntegralCap, p.i_cap),
        (MotorField::IntegralDecay, p.i_decay),
        (MotorField::OvercurrentThresh, p.overcurrent_thresh),
        (MotorField::StallCheck, p.stall_check),
        (MotorField::DeadZone, p.dead_zone),
    ];
    for (field, value) in fields {
        batch.write_float(field_reg(kind, motor, field)?, value)?;
    }
    Ok(())
}

fn queue_pos_params(batch: &mut WriteBatch, kind: BoardKind, motor: usize, p: &PosMotorParams) -> Result<()> {
    queue_params(batch, kind, motor, &p.pid)?;
    batch.write_float(field_reg(kind, motor, MotorField::CalibMin)?, p.calib_min)?;
    batch.write_float(field_reg(kind, motor, MotorField::CalibMax)?, p.calib_max)
}

/// A drive/steer board: a speed-controlled drive motor and a
/// position-controlled steering motor
#[derive(Debug, Clone)]
pub struct DriveSteerReader {
    device: SlaveDevice,
}

impl DriveSteerReader {
    pub fn new(address: u8) -> Self {
        Self {
            device: SlaveDevice::new(address, BoardKind::DriveSteer),
        }
    }

    pub fn address(&self) -> u8 {
        self.device.id()
    }

    pub fn declare_read_set<T: Transport>(&self, bus: &mut Bus<T>) -> Result<()> {
        self.device.set_read_set(bus, READSET_DRIVESTEER, &DRIVE_STEER_READ_SET)
    }

    pub fn read<T: Transport>(&mut self, bus: &mut Bus<T>) -> Result<DriveSteerSnapshot> {
        self.device.read_regs(bus, READSET_DRIVESTEER)?;
        let mut f = Fields::new(&self.device);
        let status = f.status()?;
        let chassis = f.int()?;
        let drive = f.motor(&status, 0, true)?;
        let steer = f.motor(&status, 1, false)?;
        Ok(DriveSteerSnapshot {
            status,
            chassis,
            drive,
            steer,
        })
    }

    /// Required drive speed in encoder ticks per second
    pub fn set_drive_speed<T: Transport>(&self, bus: &mut Bus<T>, speed: f32) -> Result<()> {
        self.device.write_float(bus, REGDS_DRIVE_REQSPEED, speed)
    }

    /// Required steering angle in degrees
    pub fn set_steer_position<T: Transport>(&self, bus: &mut Bus<T>, degrees: f32) -> Result<()> {
        self.device.write_float(bus, REGDS_STEER_REQPOS, degrees)
    }

    /// Send both motors' parameters in one WRITE
    pub fn send_params<T: Transport>(
        &self,
        bus: &mut Bus<T>,
        drive: &MotorParams,
        steer: &PosMotorParams,
    ) -> Result<()> {
        let mut batch = self.device.start_writes();
        queue_params(&mut batch, BoardKind::DriveSteer, 0, drive)?;
        queue_pos_params(&mut batch, BoardKind::DriveSteer, 1, steer)?;
        debug!("Sending {} parameters to board {}", batch.len(), self.address());
        bus.write_batch(&batch)
    }

    pub fn reset_faults<T: Transport>(&self, bus: &mut Bus<T>) -> Result<()> {
        self.device.reset_faults(bus)
    }

    pub fn reset_odometry<T: Transport>(&self, bus: &mut Bus<T>) -> Result<()> {
        self.device.reset_odometry(bus)
    }
}

/// A lift board: two position-controlled motors
#[derive(Debug, Clone)]
pub struct LiftReader {
    device: SlaveDevice,
}

impl LiftReader {
    pub fn new(address: u8) -> Self {
        Self {
            device: SlaveDevice::new(address, BoardKind::Lift),
        }
    }

    pub fn address(&self) -> u8 {
        self.device.id()
    }

    pub fn declare_read_set<T: Transport>(&self, bus: &mut Bus<T>) -> Result<()> {
        self.device.set_read_set(bus, READSET_LIFT, &LIFT_READ_SET)
    }

    pub fn read<T: Transport>(&mut self, bus: &mut Bus<T>) -> Result<LiftSnapshot> {
        self.device.read_regs(bus, READSET_LIFT)?;
        let mut f = Fields::new(&self.device);
        let status = f.status()?;
        let one = f.motor(&status, 0, false)?;
        let two = f.motor(&status, 1, false)?;
        Ok(LiftSnapshot {
            status,
            motors: [one, two],
        })
    }

    /// Required position of motor 0 or 1 in degrees
    pub fn set_position<T: Transport>(&self, bus: &mut Bus<T>, motor: usize, degrees: f32) -> Result<()> {
        let reg = field_reg(BoardKind::Lift, motor, MotorField::Required)?;
        self.device.write_float(bus, reg, degrees)
    }

    pub fn send_params<T: Transport>(&self, bus: &mut Bus<T>, params: &[PosMotorParams; 2]) -> Result<()> {
        let mut batch = self.device.start_writes();
        for (motor, p) in params.iter().enumerate() {
            queue_pos_params(&mut batch, BoardKind::Lift, motor, p)?;
        }
        bus.write_batch(&batch)
    }

    pub fn reset_faults<T: Transport>(&self, bus: &mut Bus<T>) -> Result<()> {
        self.device.reset_faults(bus)
    }
}

/// The master's own registers
#[derive(Debug, Clone)]
pub struct MasterReader {
    device: SlaveDevice,
}

impl Default for MasterReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterReader {
    pub fn new() -> Self {
        Self {
            device: SlaveDevice::new(MASTER_ADDR, BoardKind::Master),
        }
    }

    pub fn declare_read_set<T: Transport>(&self, bus: &mut Bus<T>) -> Result<()> {
        self.device.set_read_set(bus, READSET_MASTER, &MASTER_READ_SET)
    }

    pub fn read<T: Transport>(&mut self, bus: &mut Bus<T>) -> Result<MasterSnapshot> {
        self.device.read_regs(bus, READSET_MASTER)?;
        let mut f = Fields::new(&self.device);
        let mut temperatures = Vec::with_capacity(MASTER_TEMP_COUNT);
        for _ in 0..MASTER_TEMP_COUNT {
            temperatures.push(f.float()?);
        }
        let exception = f.int()?;
        // the master has no status register; zero data means nothing latched
        let fault = (exception != 0).then(|| FaultReport::from_exception_data(exception));
        Ok(MasterSnapshot { temperatures, fault })
    }

    /// Clear the master's latch. Slaves keep theirs until reset separately.
    pub fn reset_faults<T: Transport>(&self, bus: &mut Bus<T>) -> Result<()> {
        info!("Resetting master faults");
        self.device.write_int(bus, REGMASTER_RESET, 1)
    }
}

/// Every board of one rover behind a single bus
pub struct Rover<T: Transport> {
    bus: Bus<T>,
    master: MasterReader,
    drive_steer: Vec<DriveSteerReader>,
    lift: Vec<LiftReader>,
}

impl<T: Transport> Rover<T> {
    pub fn new(transport: T, config: &LinkConfig) -> Self {
        Self {
            bus: Bus::new(transport),
            master: MasterReader::new(),
            drive_steer: config.drive_steer.iter().map(|&a| DriveSteerReader::new(a)).collect(),
            lift: config.lift.iter().map(|&a| LiftReader::new(a)).collect(),
        }
    }

    pub fn bus_mut(&mut self) -> &mut Bus<T> {
        &mut self.bus
    }

    pub fn drive_steer(&self) -> &[DriveSteerReader] {
        &self.drive_steer
    }

    pub fn lift(&self) -> &[LiftReader] {
        &self.lift
    }

    /// Declare each layout's read set through the first board using it
    pub fn declare_read_sets(&mut self) -> Result<()> {
        self.master.declare_read_set(&mut self.bus)?;
        if let Some(ds) = self.drive_steer.first() {
            ds.declare_read_set(&mut self.bus)?;
        }
        if let Some(ll) = self.lift.first() {
            ll.declare_read_set(&mut self.bus)?;
        }
        Ok(())
    }

    /// Clear the boot faults: slaves first, then the master, so it does not
    /// relay a slave's stale boot latch
    pub fn reset_faults(&mut self) -> Result<()> {
        for ds in &self.drive_steer {
            ds.reset_faults(&mut self.bus)?;
        }
        for ll in &self.lift {
            ll.reset_faults(&mut self.bus)?;
        }
        self.master.reset_faults(&mut self.bus)
    }

    /// Read every board once
    pub fn poll(&mut self) -> Result<RoverSnapshot> {
        let master = self.master.read(&mut self.bus)?;
        if let Some(fault) = &master.fault {
            warn!("Master fault latched: {:?} from {:?}", fault.kind, fault.origin);
        }
        let mut drive_steer = Vec::with_capacity(self.drive_steer.len());
        for ds in &mut self.drive_steer {
            drive_steer.push(ds.read(&mut self.bus)?);
        }
        let mut lift = Vec::with_capacity(self.lift.len());
        for ll in &mut self.lift {
            lift.push(ll.read(&mut self.bus)?);
        }
        Ok(RoverSnapshot {
            health: LinkHealth::Ok,
            master: Some(master),
            drive_steer,
            lift,
        })
    }
}
