// A slave board: fault latch, two controlled motors, ADC and registers
//
// `tick` is one pass of the cooperative main loop and `serve` answers one bus
// frame. Register access goes through `RegisterDevice`, which checks the
// table first and then maps motor registers onto motor fields.

use tracing::{info, warn};

use super::adc::{AdcConverter, AdcKind, AdcScheduler, AdcSink, AdcTableFull};
use super::clock::Clock;
use super::drive::DrivePins;
use super::fault::{FaultController, FaultKind, FaultOrigin, unpack_exception_data};
use super::motor::ControlledMotor;
use super::store::{CommandProcessor, RegisterDevice, Reply};
use crate::protocol::frame::FrameRef;
use crate::protocol::ProtocolError;
use crate::registers::tables::*;
use crate::registers::{RegisterError, RegisterTable};

/// ADC channels wired on every board
pub const CURRENT_CHANNELS: [u8; 2] = [0, 1];
pub const POSITION_CHANNELS: [u8; 2] = [2, 3];

/// The motors and the fault latch they report to. Kept apart from the ADC
/// scheduler so the scheduler can deliver readings into it.
pub struct MotorBank<P> {
    pub faults: FaultController,
    pub motors: [ControlledMotor<P>; 2],
}

impl<P: DrivePins> AdcSink<usize> for MotorBank<P> {
    fn on_adc(&mut self, motor: usize, kind: AdcKind, raw: u16) {
        if let Some(m) = self.motors.get_mut(motor) {
            m.on_adc(kind, raw, &mut self.faults);
        }
    }
}

pub struct SlaveBoard<P, C> {
    address: u8,
    kind: BoardKind,
    table: RegisterTable,
    bank: MotorBank<P>,
    adc: AdcScheduler<C, usize>,
    start_millis: u32,
    now_millis: u32,
    last_transaction: Option<u32>,
    interval_i2c: u16,
    debug_led: u16,
    ping: u16,
    debug: u16,
    chassis: u16,
    hard_reset_requested: bool,
}

impl<P: DrivePins + 'static, C: AdcConverter> SlaveBoard<P, C> {
    /// Drive/steer layout: a speed motor (0) and a position motor (1)
    pub fn drive_steer<K: Clock>(address: u8, drive: P, steer: P, converter: C, clock: &K) -> Result<Self, AdcTableFull> {
        let now_micros = clock.micros();
        let mut faults = FaultController::new();
        let motors = [
            ControlledMotor::speed(FaultOrigin::new(address, 0), drive, &mut faults, now_micros),
            ControlledMotor::position(FaultOrigin::new(address, 1), steer, &mut faults, now_micros),
        ];
        let mut adc = AdcScheduler::new(converter);
        adc.add_read(CURRENT_CHANNELS[0], AdcKind::Current, 0)?;
        adc.add_read(CURRENT_CHANNELS[1], AdcKind::Current, 1)?;
        adc.add_read(POSITION_CHANNELS[1], AdcKind::Position, 1)?;
        Ok(Self::assemble(address, BoardKind::DriveSteer, faults, motors, adc, now_micros))
    }

    /// Lift layout: two position motors
    pub fn lift<K: Clock>(address: u8, one: P, two: P, converter: C, clock: &K) -> Result<Self, AdcTableFull> {
        let now_micros = clock.micros();
        let mut faults = FaultController::new();
        let motors = [
            ControlledMotor::position(FaultOrigin::new(address, 0), one, &mut faults, now_micros),
            ControlledMotor::position(FaultOrigin::new(address, 1), two, &mut faults, now_micros),
        ];
        let mut adc = AdcScheduler::new(converter);
        for m in 0..2 {
            adc.add_read(CURRENT_CHANNELS[m], AdcKind::Current, m)?;
            adc.add_read(POSITION_CHANNELS[m], AdcKind::Position, m)?;
        }
        Ok(Self::assemble(address, BoardKind::Lift, faults, motors, adc, now_micros))
    }

    fn assemble(
        address: u8,
        kind: BoardKind,
        faults: FaultController,
        motors: [ControlledMotor<P>; 2],
        adc: AdcScheduler<C, usize>,
        now_micros: u32,
    ) -> Self {
        info!("Slave {} up as {:?}", address, kind);
        Self {
            address,
            kind,
            table: kind.table(),
            bank: MotorBank { faults, motors },
            adc,
            start_millis: now_micros / 1000,
            now_millis: now_micros / 1000,
            last_transaction: None,
            interval_i2c: 0,
            debug_led: 0,
            ping: 0,
            debug: 0,
            chassis: 0,
            hard_reset_requested: false,
        }
    }
}

impl<P: DrivePins, C: AdcConverter> SlaveBoard<P, C> {
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn kind(&self) -> BoardKind {
        self.kind
    }

    pub fn faults(&self) -> &FaultController {
        &self.bank.faults
    }

    pub fn motor(&self, index: usize) -> Option<&ControlledMotor<P>> {
        self.bank.motors.get(index)
    }

    pub fn motor_mut(&mut self, index: usize) -> Option<&mut ControlledMotor<P>> {
        self.bank.motors.get_mut(index)
    }

    pub fn adc_mut(&mut self) -> &mut AdcScheduler<C, usize> {
        &mut self.adc
    }

    /// Chassis sensor value, fed by whatever reads it
    pub fn set_chassis(&mut self, value: u16) {
        self.chassis = value;
    }

    /// A RESET_HARD write was received; the caller restarts the board
    pub fn take_hard_reset(&mut self) -> bool {
        std::mem::take(&mut self.hard_reset_requested)
    }

    /// Answer one frame addressed to this board. The gap since the previous
    /// frame is what INTERVALI2C reports.
    pub fn serve<K: Clock>(
        &mut self,
        processor: &mut CommandProcessor,
        frame: &FrameRef<'_>,
        clock: &K,
    ) -> Result<Reply, ProtocolError> {
        self.note_transaction(clock.millis());
        processor.process(frame, self)
    }

    fn note_transaction(&mut self, now_millis: u32) {
        if let Some(prev) = self.last_transaction {
            self.interval_i2c = now_millis.wrapping_sub(prev).min(u16::MAX as u32) as u16;
        }
        self.last_transaction = Some(now_millis);
    }

    /// One main-loop pass
    pub fn tick<K: Clock>(&mut self, clock: &K) {
        let now_micros = clock.micros();
        self.now_millis = now_micros / 1000;
        self.adc.poll(&mut self.bank);
        let MotorBank { faults, motors } = &mut self.bank;
        for m in motors.iter_mut() {
            m.update(now_micros, faults);
        }
    }

    fn apply_reset(&mut self, bits: u16) {
        if bits & RESET_EXCEPTIONS != 0 {
            self.bank.faults.reset();
        }
        if bits & RESET_ODO != 0 {
            for m in &self.bank.motors {
                m.reset_odometry();
            }
        }
        if bits & RESET_HARD != 0 {
            warn!("Slave {}: hard reset requested", self.address);
            self.hard_reset_requested = true;
        }
    }
}

impl<P: DrivePins, C: AdcConverter> RegisterDevice for SlaveBoard<P, C> {
    fn table(&self) -> &RegisterTable {
        &self.table
    }

    fn read_register(&mut self, reg: u8) -> Result<u16, RegisterError> {
        let desc = *self.table.check_and_load(reg, false)?;
        let value = match reg {
            REG_RESET => 0,
            REG_TIMER => self.now_millis.wrapping_sub(self.start_millis) as u16,
            REG_INTERVALI2C => self.interval_i2c,
            REG_STATUS => self.bank.faults.status_bits(),
            REG_DEBUGLED => self.debug_led,
            REG_EXCEPTIONDATA => self.bank.faults.exception_data(),
            REG_DISABLEDEXCEPTIONS => self.bank.faults.disabled_mask(),
            REG_PING => self.ping,
            REG_DEBUG => self.debug,
            REGDS_CHASSIS if self.kind == BoardKind::DriveSteer => self.chassis,
            _ => match locate_motor_field(self.kind, reg) {
                Some((motor, field)) => desc.map(self.bank.motors[motor].field(field)),
                None => 0,
            },
        };
        Ok(value)
    }

    fn write_register(&mut self, reg: u8, value: u16) -> Result<(), RegisterError> {
        let desc = *self.table.check_and_load(reg, true)?;
        match reg {
            REG_RESET => self.apply_reset(value),
            REG_DEBUGLED => self.debug_led = value,
            REG_EXCEPTIONDATA => {
                // the master relaying a fault from elsewhere
                let (_, origin) = unpack_exception_data(value);
                self.bank.faults.raise(origin, FaultKind::Remote);
            }
            REG_DISABLEDEXCEPTIONS => self.bank.faults.set_disabled_mask(value),
            REG_PING => self.ping = value,
            REG_DEBUG => self.debug = value,
            _ => {
                if let Some((motor, field)) = locate_motor_field(self.kind, reg) {
                    self.bank.motors[motor].set_field(field, desc.unmap(value));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::adc::tests::ScriptedConverter;
    use crate::firmware::clock::tests::ManualClock;
    use crate::firmware::drive::tests::RecordingPins;
    use crate::firmware::drive::DriveState;

    type TestBoard = SlaveBoard<RecordingPins, ScriptedConverter>;

    fn drive_steer() -> TestBoard {
        let clock = ManualClock::new(0);
        SlaveBoard::drive_steer(4, RecordingPins::default(), RecordingPins::default(), ScriptedConverter::default(), &clock)
            .unwrap()
    }

    fn frame(bytes: &[u8]) -> Vec<u8> {
        let mut f = vec![(bytes.len() + 1) as u8];
        f.extend_from_slice(bytes);
        f
    }

    #[test]
    fn test_boots_faulted_until_reset() {
        let mut b = drive_steer();
        assert_eq!(b.read_register(REG_STATUS), Ok(ST_EXCEPTION));
        assert_eq!(b.read_register(REG_EXCEPTIONDATA), Ok(FaultKind::Boot as u16));
        b.write_register(REG_RESET, RESET_EXCEPTIONS).unwrap();
        assert_eq!(b.read_register(REG_STATUS), Ok(0));
    }

    #[test]
    fn test_register_checks() {
        let mut b = drive_steer();
        assert_eq!(
            b.write_register(REG_TIMER, 1),
            Err(RegisterError::ReadOnly { reg: REG_TIMER })
        );
        assert_eq!(
            b.read_register(45),
            Err(RegisterError::NoSuchRegister { reg: 45 })
        );
    }

    #[test]
    fn test_motor_registers_map_to_fields() {
        let mut b = drive_steer();
        let table = BoardKind::DriveSteer.table();
        let raw = table.map_checked(REGDS_STEER_REQPOS, 30.0).unwrap();
        b.write_register(REGDS_STEER_REQPOS, raw).unwrap();
        let required = b.motor(1).unwrap().pid().required;
        assert!((required - 30.0).abs() <= table.get(REGDS_STEER_REQPOS).unwrap().step());

        b.write_register(REGDS_DRIVE_OVERCURRENTTHRESH, 420).unwrap();
        assert_eq!(b.motor(0).unwrap().drive().overcurrent_threshold, 420);
        assert_eq!(b.read_register(REGDS_DRIVE_OVERCURRENTTHRESH), Ok(420));
    }

    #[test]
    fn test_timer_register() {
        let mut b = drive_steer();
        b.tick(&ManualClock::new(2_500_000));
        assert_eq!(b.read_register(REG_TIMER), Ok(2500));
    }

    #[test]
    fn test_interval_between_frames() {
        let mut b = drive_steer();
        let mut proc = CommandProcessor::new();
        let clock = ManualClock::new(1_000_000);
        let ping = frame(&[0x42, 1, REG_PING, 1]);
        let read_interval = frame(&[0x44, 0, REG_INTERVALI2C, 0xFF]);
        let read = frame(&[0x43, 0]);

        b.serve(&mut proc, &FrameRef::parse(&ping).unwrap(), &clock).unwrap();
        assert_eq!(b.read_register(REG_INTERVALI2C), Ok(0));

        clock.advance(25_000);
        b.serve(&mut proc, &FrameRef::parse(&read_interval).unwrap(), &clock).unwrap();
        clock.advance(40_000);
        let reply = b.serve(&mut proc, &FrameRef::parse(&read).unwrap(), &clock).unwrap();
        assert_eq!(reply.as_slice(), &[40, 0]);
    }

    #[test]
    fn test_remote_fault_write() {
        let mut b = drive_steer();
        b.write_register(REG_RESET, RESET_EXCEPTIONS).unwrap();
        // overcurrent on board 7 motor 1, relayed by the master
        b.write_register(REG_EXCEPTIONDATA, 0x1701).unwrap();
        assert_eq!(
            b.faults().active_fault(),
            Some((FaultKind::Remote, FaultOrigin::new(7, 1)))
        );
        assert_eq!(b.motor(0).unwrap().drive().state(), Some(DriveState::Stop));
    }

    #[test]
    fn test_adc_feeds_steer_position() {
        let mut b = drive_steer();
        let clock = ManualClock::new(0);
        b.write_register(REG_RESET, RESET_EXCEPTIONS).unwrap();
        b.adc_mut().set_interval(0);
        b.adc_mut().converter_mut().values[POSITION_CHANNELS[1] as usize] = 768;
        // three reads, two polls each, plus one to restart
        for _ in 0..7 {
            clock.advance(1000);
            b.tick(&clock);
        }
        assert_eq!(b.motor(1).unwrap().pid().actual, 256.0);
    }

    #[test]
    fn test_reset_odometry_bit() {
        let mut b = drive_steer();
        for _ in 0..600 {
            b.motor(0).unwrap().encoder().unwrap().tick(false);
        }
        assert_eq!(b.read_register(REGDS_DRIVE_ODO), Ok(2));
        b.write_register(REG_RESET, RESET_ODO).unwrap();
        assert_eq!(b.read_register(REGDS_DRIVE_ODO), Ok(0));
        // odometry reset leaves the boot fault alone
        assert!(b.faults().is_active());
    }

    #[test]
    fn test_lift_layout() {
        let clock = ManualClock::new(0);
        let mut b = SlaveBoard::lift(3, RecordingPins::default(), RecordingPins::default(), ScriptedConverter::default(), &clock)
            .unwrap();
        let table = BoardKind::Lift.table();
        let raw = table.map_checked(REGLL_TWO_REQPOS, -20.0).unwrap();
        b.write_register(REGLL_TWO_REQPOS, raw).unwrap();
        assert!(b.motor(1).unwrap().pid().required < -19.9);
        assert_eq!(b.motor(0).unwrap().pid().required, 0.0);
        assert!(b.motor(0).unwrap().encoder().is_none());
    }
}
