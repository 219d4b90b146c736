// In-memory stand-in for the master and its slaves
//
// Frames written to the transport are answered by the same command
// processor the firmware uses. Each board is a register file with a
// first-order motor model behind it. Every frame advances the simulation by
// one tick after it has been answered.

use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

use super::frame::FrameRef;
use super::transport::Transport;
use super::{LinkError, ProtocolError};
use crate::firmware::fault::{FaultKind, FaultOrigin, pack_exception_data, unpack_exception_data};
use crate::firmware::master::{MasterDevice, SlaveLink};
use crate::firmware::store::{CommandProcessor, RegisterDevice, RegisterFile};
use crate::registers::tables::*;
use crate::registers::{RegisterError, RegisterTable};

/// Simulated milliseconds per tick
pub const SIM_TICK_MS: u32 = 10;

/// Share of the required value applied per tick
const DRIVE_SMOOTHING: f32 = 0.05;
const STEER_SMOOTHING: f32 = 0.2;
const LIFT_SMOOTHING: f32 = 0.1;

/// Current drawn per unit of required value, before saturation
const SIM_CURRENT_FACTOR: f32 = 0.05;

/// Exponential smoothing of required -> actual, with a saturating current model
#[derive(Debug, Clone, Copy)]
pub struct MotorSim {
    smoothing: f32,
    actual: f32,
    current: f32,
}

impl MotorSim {
    pub fn new(smoothing: f32) -> Self {
        Self {
            smoothing,
            actual: 0.0,
            current: 0.0,
        }
    }

    pub fn update(&mut self, required: f32) {
        self.actual = required * self.smoothing + self.actual * (1.0 - self.smoothing);
        let c = (required * SIM_CURRENT_FACTOR).abs();
        let c = (1.0 - 1.02f32.powf(-c)) * 50.0;
        self.current = 0.1 * c + 0.9 * self.current;
    }

    pub fn actual(&self) -> f32 {
        self.actual
    }

    pub fn current(&self) -> f32 {
        self.current
    }
}

/// One simulated slave
#[derive(Debug, Clone)]
struct SimBoard {
    kind: BoardKind,
    file: RegisterFile,
    motors: [MotorSim; 2],
    odometry: f32,
}

impl SimBoard {
    fn new(address: u8, kind: BoardKind) -> Self {
        let mut file = RegisterFile::new(kind.table());
        // boards come up latched with a boot fault
        file.set(REG_STATUS, ST_EXCEPTION);
        file.set(
            REG_EXCEPTIONDATA,
            pack_exception_data(FaultKind::Boot, FaultOrigin::new(address, 0)),
        );
        let smoothing = match kind {
            BoardKind::DriveSteer => [DRIVE_SMOOTHING, STEER_SMOOTHING],
            _ => [LIFT_SMOOTHING, LIFT_SMOOTHING],
        };
        let mut board = Self {
            kind,
            file,
            motors: smoothing.map(MotorSim::new),
            odometry: 0.0,
        };
        for m in 0..2 {
            board.set_field(m, MotorField::CalibMin, -60.0);
            board.set_field(m, MotorField::CalibMax, 60.0);
        }
        board
    }

    fn set_field(&mut self, motor: usize, field: MotorField, value: f32) {
        if let Some(reg) = motor_field_reg(self.kind, motor, field) {
            self.file.set_float(reg, value);
        }
    }

    fn field(&self, motor: usize, field: MotorField) -> f32 {
        motor_field_reg(self.kind, motor, field)
            .map(|reg| self.file.get_float(reg))
            .unwrap_or(0.0)
    }

    fn latch(&mut self, kind: FaultKind, origin: FaultOrigin) {
        if self.file.get(REG_STATUS) & ST_EXCEPTION != 0 {
            return;
        }
        if self.file.get(REG_DISABLEDEXCEPTIONS) & kind.mask_bit() != 0 {
            return;
        }
        self.file.set(REG_STATUS, ST_EXCEPTION);
        self.file.set(REG_EXCEPTIONDATA, pack_exception_data(kind, origin));
    }

    fn step(&mut self, ticks: u32) {
        self.file.set(REG_TIMER, ticks.wrapping_mul(SIM_TICK_MS) as u16);
        let faulted = self.file.get(REG_STATUS) & ST_EXCEPTION != 0;
        for m in 0..2 {
            // a latched board holds its motors stopped
            let required = if faulted { 0.0 } else { self.field(m, MotorField::Required) };
            self.motors[m].update(required);
            let sim = self.motors[m];
            self.set_field(m, MotorField::Actual, sim.actual());
            self.set_field(m, MotorField::Current, sim.current());
            self.set_field(m, MotorField::Error, required - sim.actual());
        }
        if self.kind == BoardKind::DriveSteer {
            self.odometry += self.motors[0].actual().abs();
            self.set_field(0, MotorField::Odometry, self.odometry);
        }
    }
}

impl RegisterDevice for SimBoard {
    fn table(&self) -> &RegisterTable {
        self.file.table()
    }

    fn read_register(&mut self, reg: u8) -> Result<u16, RegisterError> {
        self.file.read_register(reg)
    }

    fn write_register(&mut self, reg: u8, value: u16) -> Result<(), RegisterError> {
        let own_exception = self.file.get(REG_EXCEPTIONDATA);
        self.file.write_register(reg, value)?;
        match reg {
            REG_RESET => {
                if value & RESET_EXCEPTIONS != 0 {
                    self.file.set(REG_STATUS, 0);
                    self.file.set(REG_EXCEPTIONDATA, 0);
                }
                if value & RESET_ODO != 0 {
                    self.odometry = 0.0;
                    self.set_field(0, MotorField::Odometry, 0.0);
                }
                self.file.set(REG_RESET, 0);
            }
            REG_EXCEPTIONDATA => {
                // written data is the relayed fault, not ours
                self.file.set(REG_EXCEPTIONDATA, own_exception);
                let (_, origin) = unpack_exception_data(value);
                self.latch(FaultKind::Remote, origin);
            }
            _ => {}
        }
        Ok(())
    }
}

/// The master's view of the simulated slaves
struct BoardLink<'a>(&'a mut BTreeMap<u8, SimBoard>);

impl SlaveLink for BoardLink<'_> {
    fn read_register(&mut self, addr: u8, reg: u8) -> Result<u16, LinkError> {
        let board = self
            .0
            .get_mut(&addr)
            .ok_or(ProtocolError::Timeout { device: addr })?;
        Ok(board.read_register(reg)?)
    }

    fn write_register(&mut self, addr: u8, reg: u8, value: u16) -> Result<(), LinkError> {
        let board = self
            .0
            .get_mut(&addr)
            .ok_or(ProtocolError::Timeout { device: addr })?;
        Ok(board.write_register(reg, value)?)
    }
}

/// Simulated master with a full rover of boards behind it
pub struct SimulatedRover {
    processor: CommandProcessor,
    master: MasterDevice,
    boards: BTreeMap<u8, SimBoard>,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    dropped_replies: usize,
    ticks: u32,
}

impl Default for SimulatedRover {
    fn default() -> Self {
        Self::new(&crate::config::DRIVE_STEER_ADDRS, &crate::config::LIFT_ADDRS)
    }
}

impl SimulatedRover {
    pub fn new(drive_steer: &[u8], lift: &[u8]) -> Self {
        let mut boards = BTreeMap::new();
        for &a in drive_steer {
            boards.insert(a, SimBoard::new(a, BoardKind::DriveSteer));
        }
        for &a in lift {
            boards.insert(a, SimBoard::new(a, BoardKind::Lift));
        }
        let mut master = MasterDevice::new();
        master.set_temperature(0, 13.0);
        for i in 1..MASTER_TEMP_COUNT {
            master.set_temperature(i, 15.0);
        }
        Self {
            processor: CommandProcessor::new(),
            master,
            boards,
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            dropped_replies: 0,
            ticks: 0,
        }
    }

    pub fn master(&self) -> &MasterDevice {
        &self.master
    }

    /// Swallow the next `n` replies, as a lost frame on the wire would
    pub fn drop_next_replies(&mut self, n: usize) {
        self.dropped_replies += n;
    }

    /// Latch a fault on a board as its own controller would
    pub fn inject_fault(&mut self, addr: u8, kind: FaultKind, motor: u8) {
        if let Some(board) = self.boards.get_mut(&addr) {
            board.latch(kind, FaultOrigin::new(addr, motor));
        }
    }

    /// Set a register on a board directly, bypassing writability
    pub fn poke(&mut self, addr: u8, reg: u8, value: u16) {
        if let Some(board) = self.boards.get_mut(&addr) {
            board.file.set(reg, value);
        }
    }

    pub fn peek(&self, addr: u8, reg: u8) -> Option<u16> {
        self.boards.get(&addr).map(|b| b.file.get(reg))
    }

    /// Advance the motor models and let the master poll the boards
    pub fn step(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
        for board in self.boards.values_mut() {
            board.step(self.ticks);
        }
        let addrs: Vec<u8> = self.boards.keys().copied().collect();
        let unreachable = self.master.check_slaves(&mut BoardLink(&mut self.boards), &addrs);
        if unreachable > 0 {
            warn!("Simulated master could not reach {} boards", unreachable);
        }
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let parsed = match FrameRef::parse(frame) {
            Ok(f) => f,
            Err(e) => {
                warn!("Simulator dropping frame: {}", e);
                return;
            }
        };
        let result = match parsed.device {
            0 => self.processor.process(&parsed, &mut self.master),
            addr => match self.boards.get_mut(&addr) {
                Some(board) => self.processor.process(&parsed, board),
                None => {
                    debug!("No simulated board at {}", addr);
                    return;
                }
            },
        };
        match result {
            Ok(reply) if self.dropped_replies > 0 => {
                self.dropped_replies -= 1;
                debug!("Dropping {} byte reply", reply.len());
            }
            Ok(reply) => self.outbox.extend(reply.iter()),
            Err(e) => warn!("Simulator rejected frame: {}", e),
        }
    }
}

impl Transport for SimulatedRover {
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.inbox.extend_from_slice(data);
        loop {
            let Some(&len) = self.inbox.first() else {
                break;
            };
            let len = len as usize;
            if len < 2 {
                warn!("Simulator got length byte {}, resynchronising", len);
                self.inbox.clear();
                break;
            }
            if self.inbox.len() < len {
                break;
            }
            let frame: Vec<u8> = self.inbox.drain(..len).collect();
            self.handle_frame(&frame);
            self.step();
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        if self.outbox.len() < buf.len() {
            // a short reply is consumed and then times out
            self.outbox.clear();
            return Err(ProtocolError::Timeout { device: 0 });
        }
        for b in buf.iter_mut() {
            if let Some(v) = self.outbox.pop_front() {
                *b = v;
            }
        }
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), ProtocolError> {
        self.outbox.clear();
        Ok(())
    }
}
