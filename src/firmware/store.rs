// Firmware side of the register protocol
//
// `CommandProcessor` answers WRITE, READ and SETREADSET frames against a
// `RegisterDevice`. Read sets belong to the processor and are shared by
// every device it serves.

use heapless::Vec as BoundedVec;
use tracing::{debug, warn};

use crate::protocol::frame::{Command, FrameRef, READSET_TERMINATOR, READSETS, READSETSIZE};
use crate::protocol::ProtocolError;
use crate::registers::{RegisterError, RegisterTable};

/// Longest reply: a full read set of 2-byte registers
pub const MAX_REPLY_LEN: usize = READSETSIZE * 2;

pub type Reply = BoundedVec<u8, MAX_REPLY_LEN>;

/// Something with a register table. Implementations validate every access
/// with `RegisterTable::check_and_load` before acting on it.
pub trait RegisterDevice {
    fn table(&self) -> &RegisterTable;

    fn read_register(&mut self, reg: u8) -> Result<u16, RegisterError>;

    fn write_register(&mut self, reg: u8, value: u16) -> Result<(), RegisterError>;
}

/// Plain storage behind a register table
#[derive(Debug, Clone)]
pub struct RegisterFile {
    table: RegisterTable,
    values: Vec<u16>,
}

impl RegisterFile {
    pub fn new(table: RegisterTable) -> Self {
        Self {
            values: vec![0; table.len()],
            table,
        }
    }

    /// Set any register, writable or not, as the device itself would
    pub fn set(&mut self, reg: u8, value: u16) {
        if let Some(v) = self.values.get_mut(reg as usize) {
            *v = value;
        }
    }

    pub fn get(&self, reg: u8) -> u16 {
        self.values.get(reg as usize).copied().unwrap_or(0)
    }

    pub fn set_float(&mut self, reg: u8, value: f32) {
        if let Some(desc) = self.table.get(reg) {
            let raw = desc.map(value);
            self.set(reg, raw);
        }
    }

    pub fn get_float(&self, reg: u8) -> f32 {
        self.table.get(reg).map(|d| d.unmap(self.get(reg))).unwrap_or(0.0)
    }
}

impl RegisterDevice for RegisterFile {
    fn table(&self) -> &RegisterTable {
        &self.table
    }

    fn read_register(&mut self, reg: u8) -> Result<u16, RegisterError> {
        self.table.check_and_load(reg, false)?;
        Ok(self.get(reg))
    }

    fn write_register(&mut self, reg: u8, value: u16) -> Result<(), RegisterError> {
        let desc = self.table.check_and_load(reg, true)?;
        self.set(reg, value & desc.raw_max());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandProcessor {
    read_sets: [BoundedVec<u8, READSETSIZE>; READSETS],
}

impl CommandProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_set(&self, slot: u8) -> Option<&[u8]> {
        self.read_sets.get(slot as usize).map(|s| s.as_slice())
    }

    /// Handle one frame addressed to `device` and return the reply bytes
    pub fn process<D: RegisterDevice + ?Sized>(
        &mut self,
        frame: &FrameRef<'_>,
        device: &mut D,
    ) -> Result<Reply, ProtocolError> {
        match frame.command {
            Command::Write => Self::process_write(frame.payload, device),
            Command::Read => self.process_read(frame.payload, device),
            Command::SetReadSet => self.process_set_read_set(frame.payload),
        }
    }

    /// Apply each write in turn. The status is the code of the first
    /// failure; later writes still apply unless the failing register's
    /// size is unknown, which leaves the rest of the payload unparseable.
    fn process_write<D: RegisterDevice + ?Sized>(
        payload: &[u8],
        device: &mut D,
    ) -> Result<Reply, ProtocolError> {
        let truncated = || ProtocolError::Malformed {
            reason: "write payload truncated".to_string(),
        };
        let (&count, mut rest) = payload.split_first().ok_or_else(truncated)?;
        let mut status = 0u8;

        for _ in 0..count {
            let (&reg, tail) = rest.split_first().ok_or_else(truncated)?;
            let size = match device.table().get(reg) {
                Some(desc) => desc.size(),
                None => {
                    if status == 0 {
                        status = RegisterError::NoSuchRegister { reg }.code();
                    }
                    warn!("Write to unknown register {}", reg);
                    break;
                }
            };
            if tail.len() < size {
                return Err(truncated());
            }
            let mut value = tail[0] as u16;
            if size == 2 {
                value |= (tail[1] as u16) << 8;
            }
            rest = &tail[size..];

            debug!("Register write: reg={}, raw={}", reg, value);
            if let Err(e) = device.write_register(reg, value) {
                warn!("Register write failed: {}", e);
                if status == 0 {
                    status = e.code();
                }
            }
        }

        let mut reply = Reply::new();
        let _ = reply.push(status);
        Ok(reply)
    }

    /// Concatenate the raw bytes of every register in the set. Registers
    /// that fail read as zeros so the reply length always matches the set.
    fn process_read<D: RegisterDevice + ?Sized>(
        &self,
        payload: &[u8],
        device: &mut D,
    ) -> Result<Reply, ProtocolError> {
        let slot = *payload.first().ok_or(ProtocolError::Malformed {
            reason: "read without a slot".to_string(),
        })?;
        let set = self
            .read_sets
            .get(slot as usize)
            .ok_or(ProtocolError::UnknownReadSet { slot })?;

        let mut reply = Reply::new();
        for &reg in set {
            let size = device.table().get(reg).map(|d| d.size()).unwrap_or(0);
            let value = device.read_register(reg).unwrap_or(0);
            let [lo, hi] = value.to_le_bytes();
            // a set holds at most READSETSIZE registers of 2 bytes
            let _ = reply.push(lo);
            if size == 2 {
                let _ = reply.push(hi);
            }
        }
        Ok(reply)
    }

    /// Replace a read set. Ids are taken until the terminator, the end of
    /// the frame or the set capacity; the reply is how many were kept.
    fn process_set_read_set(&mut self, payload: &[u8]) -> Result<Reply, ProtocolError> {
        let (&slot, ids) = payload.split_first().ok_or(ProtocolError::Malformed {
            reason: "set read set without a slot".to_string(),
        })?;
        let mut reply = Reply::new();
        let Some(set) = self.read_sets.get_mut(slot as usize) else {
            warn!("Read set slot {} out of range", slot);
            let _ = reply.push(0);
            return Ok(reply);
        };

        set.clear();
        for &id in ids.iter().take_while(|&&id| id != READSET_TERMINATOR) {
            if set.push(id).is_err() {
                break;
            }
        }
        debug!("Read set {} = {:?}", slot, set);
        let _ = reply.push(set.len() as u8);
        Ok(reply)
    }
}
