// The master controller's own device (address 0)
//
// Holds the master fault latch and the temperature slots, and polls slaves
// for faults: a fault latched on a slave is latched on the master with the
// slave's address as origin, then relayed to every other slave.

use tracing::{debug, info, warn};

use super::fault::{FaultController, FaultKind, FaultOrigin, pack_exception_data, unpack_exception_data};
use super::store::RegisterDevice;
use crate::protocol::LinkError;
use crate::registers::tables::{
    BoardKind, MASTER_TEMP_COUNT, REG_EXCEPTIONDATA, REG_PING, REG_STATUS, REGMASTER_EXCEPTIONDATA,
    REGMASTER_RESET, REGMASTER_TEMPAMBIENT, ST_EXCEPTION,
};
use crate::registers::{RegisterError, RegisterTable};

/// Single-register access to slaves on the master's side of the bus
pub trait SlaveLink {
    fn read_register(&mut self, addr: u8, reg: u8) -> Result<u16, LinkError>;

    fn write_register(&mut self, addr: u8, reg: u8, value: u16) -> Result<(), LinkError>;
}

#[derive(Debug)]
pub struct MasterDevice {
    table: RegisterTable,
    faults: FaultController,
    temperatures: [f32; MASTER_TEMP_COUNT],
    /// Slaves still owed the latched fault, one bit per 4-bit address
    relay_pending: u16,
}

impl Default for MasterDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterDevice {
    pub fn new() -> Self {
        Self {
            table: BoardKind::Master.table(),
            faults: FaultController::new(),
            temperatures: [0.0; MASTER_TEMP_COUNT],
            relay_pending: 0,
        }
    }

    pub fn faults(&self) -> &FaultController {
        &self.faults
    }

    /// Clear the master latch and forget any relay still outstanding
    pub fn reset_faults(&mut self) {
        self.faults.reset();
        self.relay_pending = 0;
    }

    /// Addresses that have not yet been told about the latched fault
    pub fn relay_pending(&self) -> Vec<u8> {
        (0..16u8).filter(|a| self.relay_pending & (1 << a) != 0).collect()
    }

    /// Store a reading from the temperature bus; out-of-range slots are ignored
    pub fn set_temperature(&mut self, index: usize, celsius: f32) {
        if let Some(t) = self.temperatures.get_mut(index) {
            *t = celsius;
        }
    }

    pub fn temperature(&self, index: usize) -> Option<f32> {
        self.temperatures.get(index).copied()
    }

    /// Ping a slave and pull in any fault it has latched. BOOT and REMOTE
    /// faults are local to the slave and are not raised here. Returns the
    /// fault kind if one was latched on the master.
    pub fn check_slave<L: SlaveLink>(&mut self, link: &mut L, addr: u8) -> Result<Option<FaultKind>, LinkError> {
        link.write_register(addr, REG_PING, 0)?;
        let status = link.read_register(addr, REG_STATUS)?;
        if status & ST_EXCEPTION == 0 {
            return Ok(None);
        }

        let data = link.read_register(addr, REG_EXCEPTIONDATA)?;
        let (kind, slave_origin) = unpack_exception_data(data);
        debug!("Slave {} reports exception data {:#06x}", addr, data);
        match kind {
            Some(FaultKind::Boot | FaultKind::Remote) => Ok(None),
            Some(kind) => {
                let origin = FaultOrigin::new(addr, slave_origin.motor);
                Ok(self.faults.raise(origin, kind).then_some(kind))
            }
            None => {
                warn!("Slave {} reports unknown fault code {}", addr, data & 0xFF);
                Ok(None)
            }
        }
    }

    /// Check every slave in turn. When one of them latches a fault here,
    /// tell the others so they stop too. A slave that does not answer is
    /// logged and skipped; relay writes that fail are retried on the next
    /// sweep for as long as the fault stays latched. Returns how many slaves
    /// could not be reached.
    pub fn check_slaves<L: SlaveLink>(&mut self, link: &mut L, addrs: &[u8]) -> u32 {
        let mut unreachable: u16 = 0;
        for &addr in addrs {
            match self.check_slave(link, addr) {
                Ok(Some(kind)) => {
                    info!("Relaying {} from slave {} to the rover", kind, addr);
                    self.relay_pending = addrs
                        .iter()
                        .filter(|&&a| a != addr)
                        .fold(0, |set, &a| set | address_bit(a));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Slave {} did not answer the fault check: {}", addr, e);
                    unreachable |= address_bit(addr);
                }
            }
        }

        if self.faults.is_active() {
            unreachable |= self.relay(link);
        } else {
            self.relay_pending = 0;
        }
        unreachable.count_ones()
    }

    /// Write the latched fault to every pending slave. Returns the slaves
    /// that are still pending.
    fn relay<L: SlaveLink>(&mut self, link: &mut L) -> u16 {
        let word = self.faults.exception_data();
        for addr in self.relay_pending() {
            match link.write_register(addr, REG_EXCEPTIONDATA, word) {
                Ok(()) => self.relay_pending &= !address_bit(addr),
                Err(e) => warn!("Relay to slave {} failed, retrying next sweep: {}", addr, e),
            }
        }
        self.relay_pending
    }
}

fn address_bit(addr: u8) -> u16 {
    1 << (addr & 0x0F)
}

impl RegisterDevice for MasterDevice {
    fn table(&self) -> &RegisterTable {
        &self.table
    }

    fn read_register(&mut self, reg: u8) -> Result<u16, RegisterError> {
        let desc = *self.table.check_and_load(reg, false)?;
        let first_temp = REGMASTER_TEMPAMBIENT as usize;
        Ok(match reg {
            REGMASTER_EXCEPTIONDATA => match self.faults.active_fault() {
                Some((kind, origin)) => pack_exception_data(kind, origin),
                None => 0,
            },
            r if (first_temp..first_temp + MASTER_TEMP_COUNT).contains(&(r as usize)) => {
                desc.map(self.temperatures[r as usize - first_temp])
            }
            _ => desc.map(-1.0),
        })
    }

    fn write_register(&mut self, reg: u8, _value: u16) -> Result<(), RegisterError> {
        self.table.check_and_load(reg, true)?;
        if reg == REGMASTER_RESET {
            self.reset_faults();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::store::RegisterFile;
    use std::collections::BTreeMap;

    /// Slaves as plain register files
    #[derive(Default)]
    struct FakeBus {
        slaves: BTreeMap<u8, RegisterFile>,
        writes: Vec<(u8, u8, u16)>,
    }

    impl FakeBus {
        fn with_slaves(addrs: &[u8]) -> Self {
            let mut bus = Self::default();
            for &a in addrs {
                bus.slaves.insert(a, RegisterFile::new(BoardKind::DriveSteer.table()));
            }
            bus
        }

        fn latch(&mut self, addr: u8, kind: FaultKind, motor: u8) {
            let file = self.slaves.get_mut(&addr).unwrap();
            file.set(REG_STATUS, ST_EXCEPTION);
            file.set(REG_EXCEPTIONDATA, pack_exception_data(kind, FaultOrigin::new(addr, motor)));
        }
    }

    impl SlaveLink for FakeBus {
        fn read_register(&mut self, addr: u8, reg: u8) -> Result<u16, LinkError> {
            let file = self
                .slaves
                .get_mut(&addr)
                .ok_or(crate::protocol::ProtocolError::Timeout { device: addr })?;
            Ok(file.read_register(reg)?)
        }

        fn write_register(&mut self, addr: u8, reg: u8, value: u16) -> Result<(), LinkError> {
            self.writes.push((addr, reg, value));
            let file = self
                .slaves
                .get_mut(&addr)
                .ok_or(crate::protocol::ProtocolError::Timeout { device: addr })?;
            Ok(file.write_register(reg, value)?)
        }
    }

    #[test]
    fn test_check_slave_raises_with_slave_origin() {
        let mut master = MasterDevice::new();
        master.reset_faults();
        let mut bus = FakeBus::with_slaves(&[5]);
        bus.latch(5, FaultKind::Stall, 1);

        assert_eq!(master.check_slave(&mut bus, 5).unwrap(), Some(FaultKind::Stall));
        assert_eq!(
            master.faults().active_fault(),
            Some((FaultKind::Stall, FaultOrigin::new(5, 1)))
        );
        assert_eq!(bus.writes[0], (5, REG_PING, 0));
        assert_eq!(master.read_register(REGMASTER_EXCEPTIONDATA), Ok(0x1505));
    }

    #[test]
    fn test_boot_and_remote_not_relayed() {
        let mut master = MasterDevice::new();
        master.reset_faults();
        let mut bus = FakeBus::with_slaves(&[1, 2]);
        bus.latch(1, FaultKind::Boot, 0);
        bus.latch(2, FaultKind::Remote, 0);
        assert_eq!(master.check_slaves(&mut bus, &[1, 2]), 0);
        assert!(!master.faults().is_active());
    }

    #[test]
    fn test_fault_relayed_to_other_slaves() {
        let mut master = MasterDevice::new();
        master.reset_faults();
        let mut bus = FakeBus::with_slaves(&[1, 2, 4]);
        bus.latch(2, FaultKind::Overcurrent, 0);
        assert_eq!(master.check_slaves(&mut bus, &[1, 2, 4]), 0);

        let relayed: Vec<u8> = bus
            .writes
            .iter()
            .filter(|w| w.1 == REG_EXCEPTIONDATA)
            .map(|w| w.0)
            .collect();
        assert_eq!(relayed, vec![1, 4]);
        assert_eq!(bus.slaves[&4].get(REG_EXCEPTIONDATA), 0x0201);
        assert!(master.relay_pending().is_empty());
    }

    #[test]
    fn test_dead_slave_does_not_hide_later_faults() {
        let mut master = MasterDevice::new();
        master.reset_faults();
        // slave 1 never answers
        let mut bus = FakeBus::with_slaves(&[2]);
        bus.latch(2, FaultKind::Overcurrent, 0);

        assert_eq!(master.check_slaves(&mut bus, &[1, 2]), 1);
        assert_eq!(
            master.faults().active_fault(),
            Some((FaultKind::Overcurrent, FaultOrigin::new(2, 0)))
        );
    }

    #[test]
    fn test_failed_relay_retried_until_delivered() {
        let mut master = MasterDevice::new();
        master.reset_faults();
        // slave 4 drops off the bus
        let mut bus = FakeBus::with_slaves(&[2, 9]);
        bus.latch(2, FaultKind::Overcurrent, 0);

        assert_eq!(master.check_slaves(&mut bus, &[2, 4, 9]), 1);
        assert_eq!(bus.slaves[&9].get(REG_EXCEPTIONDATA), 0x0201);
        assert_eq!(master.relay_pending(), vec![4]);

        // still missing: kept pending
        assert_eq!(master.check_slaves(&mut bus, &[2, 4, 9]), 1);
        assert_eq!(master.relay_pending(), vec![4]);

        bus.slaves.insert(4, RegisterFile::new(BoardKind::DriveSteer.table()));
        assert_eq!(master.check_slaves(&mut bus, &[2, 4, 9]), 0);
        assert_eq!(bus.slaves[&4].get(REG_EXCEPTIONDATA), 0x0201);
        assert!(master.relay_pending().is_empty());

        // delivered once, not rewritten on later sweeps
        bus.writes.clear();
        master.check_slaves(&mut bus, &[2, 4, 9]);
        assert!(bus.writes.iter().all(|w| w.1 != REG_EXCEPTIONDATA));
    }

    #[test]
    fn test_reset_drops_pending_relay() {
        let mut master = MasterDevice::new();
        master.reset_faults();
        let mut bus = FakeBus::with_slaves(&[2]);
        bus.latch(2, FaultKind::Stall, 1);
        master.check_slaves(&mut bus, &[2, 4]);
        assert_eq!(master.relay_pending(), vec![4]);

        master.write_register(REGMASTER_RESET, 1).unwrap();
        assert!(master.relay_pending().is_empty());
        assert!(!master.faults().is_active());
    }

    #[test]
    fn test_unreachable_slave_is_an_error() {
        let mut master = MasterDevice::new();
        let mut bus = FakeBus::default();
        assert!(master.check_slave(&mut bus, 9).unwrap_err().is_timeout());
    }

    #[test]
    fn test_registers() {
        let mut master = MasterDevice::new();
        master.set_temperature(0, 21.5);
        let raw = master.read_register(REGMASTER_TEMPAMBIENT).unwrap();
        let desc = *master.table().get(REGMASTER_TEMPAMBIENT).unwrap();
        assert!((desc.unmap(raw) - 21.5).abs() <= desc.step());

        assert!(master.faults().is_active());
        master.write_register(REGMASTER_RESET, 1).unwrap();
        assert!(!master.faults().is_active());
        assert_eq!(
            master.write_register(REGMASTER_TEMPAMBIENT, 1),
            Err(RegisterError::ReadOnly { reg: REGMASTER_TEMPAMBIENT })
        );
    }
}
