// Host side of the register protocol
//
// A `Bus` owns the transport shared by every device behind the master and
// runs strictly one transaction at a time. `SlaveDevice` is a handle for one
// board: it builds write batches, declares read sets and decodes batch reads.

use heapless::Vec as BoundedVec;
use tracing::{debug, info, warn};

use super::frame::{
    Command, FrameBuilder, HEADER_LEN, MAX_FRAME_LEN, READSET_TERMINATOR, READSETS, READSETSIZE,
};
use super::transport::Transport;
use super::{ProtocolError, Result};
use crate::registers::tables::{BoardKind, REG_RESET, RESET_EXCEPTIONS, RESET_ODO};
use crate::registers::RegisterTable;

/// Space left for the write count and entries in one frame
const WRITE_PAYLOAD_MAX: usize = MAX_FRAME_LEN - HEADER_LEN;

/// Register ids of one read set
pub type ReadSetIds = BoundedVec<u8, READSETSIZE>;

/// Local copy of what each read-set slot holds on the master. Read sets
/// on the master are shared by every device behind it, so the mirror lives
/// with the bus rather than with a device.
#[derive(Debug, Clone)]
pub struct ReadSetMirror {
    slots: [Option<ReadSetIds>; READSETS],
}

impl Default for ReadSetMirror {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl ReadSetMirror {
    pub fn get(&self, slot: u8) -> Option<&[u8]> {
        self.slots
            .get(slot as usize)
            .and_then(|s| s.as_ref())
            .map(|ids| ids.as_slice())
    }

    fn replace(&mut self, slot: u8, ids: ReadSetIds) {
        if let Some(s) = self.slots.get_mut(slot as usize) {
            *s = Some(ids);
        }
    }

    fn invalidate(&mut self, slot: u8) {
        if let Some(s) = self.slots.get_mut(slot as usize) {
            *s = None;
        }
    }
}

/// Shared connection to the master
pub struct Bus<T: Transport> {
    transport: T,
    frame: FrameBuilder,
    read_sets: ReadSetMirror,
    timed_out: bool,
}

impl<T: Transport> Bus<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            frame: FrameBuilder::new(),
            read_sets: ReadSetMirror::default(),
            timed_out: false,
        }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn read_sets(&self) -> &ReadSetMirror {
        &self.read_sets
    }

    /// True after a timeout until `clear_timeout` is called
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Recover from a timeout. Bytes still in flight from the failed
    /// transaction are dropped; the caller must start a fresh transaction
    /// rather than reuse anything from the old one.
    pub fn clear_timeout(&mut self) -> std::result::Result<(), ProtocolError> {
        self.transport.discard_input()?;
        self.timed_out = false;
        Ok(())
    }

    /// Send the frame under construction and read exactly `reply.len()` bytes
    fn transact(&mut self, device: u8, reply: &mut [u8]) -> std::result::Result<(), ProtocolError> {
        if self.timed_out {
            return Err(ProtocolError::TimeoutPending);
        }
        let frame = self.frame.finish()?;
        debug!("Frame to device {}: {:02X?}", device, frame);
        self.transport.write_all(frame)?;

        match self.transport.read_exact(reply) {
            Ok(()) => Ok(()),
            Err(ProtocolError::Timeout { .. }) => {
                warn!("Timeout in read from device {}", device);
                self.timed_out = true;
                Err(ProtocolError::Timeout { device })
            }
            Err(e) => Err(e),
        }
    }

    /// Send a batch of register writes and check the status byte
    pub fn write_batch(&mut self, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.frame.start(batch.device, Command::Write);
        self.frame.add_byte(batch.count)?;
        self.frame.add(&batch.entries)?;

        let mut status = [0u8; 1];
        self.transact(batch.device, &mut status)?;
        if status[0] != 0 {
            warn!("Device {} rejected write batch: code {}", batch.device, status[0]);
            return Err(ProtocolError::Rejected {
                device: batch.device,
                code: status[0],
            }
            .into());
        }
        Ok(())
    }

    /// Declare a read set. The local mirror only changes once the master
    /// acknowledges every register; until then the slot is undeclared.
    pub fn set_read_set(
        &mut self,
        device: u8,
        table: &RegisterTable,
        slot: u8,
        ids: &[u8],
    ) -> Result<()> {
        if slot as usize >= READSETS {
            return Err(ProtocolError::UnknownReadSet { slot }.into());
        }
        if ids.len() > READSETSIZE {
            return Err(ProtocolError::ReadSetTooLarge {
                len: ids.len(),
                max: READSETSIZE,
            }
            .into());
        }
        let mut declared = ReadSetIds::new();
        for &id in ids {
            table.check_and_load(id, false)?;
            // capacity checked above
            let _ = declared.push(id);
        }

        self.read_sets.invalidate(slot);
        self.frame.start(device, Command::SetReadSet);
        self.frame.add_byte(slot)?;
        self.frame.add(ids)?;
        self.frame.add_byte(READSET_TERMINATOR)?;

        let mut ack = [0u8; 1];
        self.transact(device, &mut ack)?;
        let accepted = ack[0] as usize;
        if accepted != ids.len() {
            warn!(
                "Read set {} on device {}: accepted {} of {}",
                slot,
                device,
                accepted,
                ids.len()
            );
            return Err(ProtocolError::ReadSetMismatch {
                device,
                requested: ids.len(),
                accepted,
            }
            .into());
        }

        info!("Read set {} declared via device {}: {:?}", slot, device, ids);
        self.read_sets.replace(slot, declared);
        Ok(())
    }

    /// Issue READ for `slot` and decode the reply positionally. Returns the
    /// register ids of the set alongside the raw values.
    pub fn read_set_values(
        &mut self,
        device: u8,
        table: &RegisterTable,
        slot: u8,
    ) -> Result<(ReadSetIds, BoundedVec<u16, READSETSIZE>)> {
        let ids: ReadSetIds = match self.read_sets.get(slot) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Err(ProtocolError::UnknownReadSet { slot }.into()),
        };

        let mut size = 0;
        for &id in &ids {
            size += table.check_and_load(id, false)?.size();
        }

        self.frame.start(device, Command::Read);
        self.frame.add_byte(slot)?;
        let mut reply = [0u8; READSETSIZE * 2];
        self.transact(device, &mut reply[..size])?;

        let mut values = BoundedVec::new();
        let mut pos = 0;
        for &id in &ids {
            let mut v = reply[pos] as u16;
            pos += 1;
            if table.check_and_load(id, false)?.size() == 2 {
                v |= (reply[pos] as u16) << 8;
                pos += 1;
            }
            // same length as ids
            let _ = values.push(v);
        }
        Ok((ids, values))
    }
}

/// Register writes collected for one WRITE frame
#[derive(Debug, Clone)]
pub struct WriteBatch {
    device: u8,
    table: RegisterTable,
    count: u8,
    entries: BoundedVec<u8, { WRITE_PAYLOAD_MAX - 1 }>,
}

impl WriteBatch {
    pub fn new(device: u8, table: RegisterTable) -> Self {
        Self {
            device,
            table,
            count: 0,
            entries: BoundedVec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Add a raw write. Fails on unknown or read-only registers and when
    /// the frame would overflow.
    pub fn write_int(&mut self, reg: u8, value: u16) -> Result<()> {
        let size = self.table.check_and_load(reg, true)?.size();
        let needed = 1 + size;
        if self.entries.len() + needed > self.entries.capacity() {
            return Err(ProtocolError::FrameTooLong {
                len: HEADER_LEN + 1 + self.entries.len() + needed,
            }
            .into());
        }
        let [lo, hi] = value.to_le_bytes();
        // capacity checked above
        let _ = self.entries.push(reg);
        let _ = self.entries.push(lo);
        if size == 2 {
            let _ = self.entries.push(hi);
        }
        self.count += 1;
        debug!("Queued write to device {}: reg={}, raw={}", self.device, reg, value);
        Ok(())
    }

    /// Add a mapped write; the value must lie inside the register's range
    pub fn write_float(&mut self, reg: u8, value: f32) -> Result<()> {
        let raw = self.table.map_checked(reg, value)?;
        self.write_int(reg, raw)
    }
}

/// Handle for one board behind the master
#[derive(Debug, Clone)]
pub struct SlaveDevice {
    id: u8,
    kind: BoardKind,
    table: RegisterTable,
    last_ids: ReadSetIds,
    values: BoundedVec<u16, READSETSIZE>,
}

impl SlaveDevice {
    pub fn new(id: u8, kind: BoardKind) -> Self {
        Self {
            id,
            kind,
            table: kind.table(),
            last_ids: ReadSetIds::new(),
            values: BoundedVec::new(),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn kind(&self) -> BoardKind {
        self.kind
    }

    pub fn table(&self) -> &RegisterTable {
        &self.table
    }

    /// Begin a batch of writes to this device
    pub fn start_writes(&self) -> WriteBatch {
        WriteBatch::new(self.id, self.table)
    }

    pub fn set_read_set<T: Transport>(&self, bus: &mut Bus<T>, slot: u8, ids: &[u8]) -> Result<()> {
        bus.set_read_set(self.id, &self.table, slot, ids)
    }

    /// Read every register of `slot`; values are indexed by position in
    /// the set, not by register id
    pub fn read_regs<T: Transport>(&mut self, bus: &mut Bus<T>, slot: u8) -> Result<()> {
        let (ids, values) = bus.read_set_values(self.id, &self.table, slot)?;
        self.last_ids = ids;
        self.values = values;
        Ok(())
    }

    /// Raw value at position `n` of the last read
    pub fn reg_int(&self, n: usize) -> Option<u16> {
        self.values.get(n).copied()
    }

    /// Mapped value at position `n` of the last read, using the mapping of
    /// whichever register occupies that position
    pub fn reg_float(&self, n: usize) -> Option<f32> {
        let raw = self.reg_int(n)?;
        let reg = self.table.get(*self.last_ids.get(n)?)?;
        Some(reg.unmap(raw))
    }

    /// Values decoded by the last `read_regs`, in read-set order
    pub fn values(&self) -> &[u16] {
        &self.values
    }

    /// Write a single raw register
    pub fn write_int<T: Transport>(&self, bus: &mut Bus<T>, reg: u8, value: u16) -> Result<()> {
        let mut batch = self.start_writes();
        batch.write_int(reg, value)?;
        bus.write_batch(&batch)
    }

    /// Write a single mapped register
    pub fn write_float<T: Transport>(&self, bus: &mut Bus<T>, reg: u8, value: f32) -> Result<()> {
        let mut batch = self.start_writes();
        batch.write_float(reg, value)?;
        bus.write_batch(&batch)
    }

    /// Clear this device's latched fault
    pub fn reset_faults<T: Transport>(&self, bus: &mut Bus<T>) -> Result<()> {
        info!("Resetting faults on device {}", self.id);
        self.write_int(bus, REG_RESET, RESET_EXCEPTIONS)
    }

    /// Zero the drive odometer
    pub fn reset_odometry<T: Transport>(&self, bus: &mut Bus<T>) -> Result<()> {
        self.write_int(bus, REG_RESET, RESET_ODO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LinkError;
    use crate::registers::tables::*;
    use std::collections::VecDeque;

    /// Transport that records frames and replays canned replies
    #[derive(Default)]
    struct ScriptedTransport {
        sent: Vec<Vec<u8>>,
        replies: VecDeque<u8>,
        discarded: usize,
    }

    impl Transport for ScriptedTransport {
        fn write_all(&mut self, data: &[u8]) -> std::result::Result<(), ProtocolError> {
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> std::result::Result<(), ProtocolError> {
            if self.replies.len() < buf.len() {
                return Err(ProtocolError::Timeout { device: 0 });
            }
            for b in buf.iter_mut() {
                *b = self.replies.pop_front().unwrap();
            }
            Ok(())
        }

        fn discard_input(&mut self) -> std::result::Result<(), ProtocolError> {
            self.discarded += self.replies.len();
            self.replies.clear();
            Ok(())
        }
    }

    fn bus_with(replies: &[u8]) -> Bus<ScriptedTransport> {
        let mut t = ScriptedTransport::default();
        t.replies.extend(replies);
        Bus::new(t)
    }

    #[test]
    fn test_write_batch_frame() {
        let dev = SlaveDevice::new(1, BoardKind::DriveSteer);
        let mut bus = bus_with(&[0]);
        let mut batch = dev.start_writes();
        batch.write_int(REG_PING, 5).unwrap();
        batch.write_int(REG_DEBUG, 0x1234).unwrap();
        bus.write_batch(&batch).unwrap();

        let sent = &bus.transport_mut().sent[0];
        assert_eq!(sent, &vec![8, 0x12, 2, REG_PING, 5, REG_DEBUG, 0x34, 0x12]);
    }

    #[test]
    fn test_rejected_write() {
        let dev = SlaveDevice::new(2, BoardKind::DriveSteer);
        let mut bus = bus_with(&[2]);
        let err = dev.write_int(&mut bus, REG_PING, 1).unwrap_err();
        assert!(matches!(
            err,
            LinkError::Protocol(ProtocolError::Rejected { device: 2, code: 2 })
        ));
    }

    #[test]
    fn test_register_errors_before_traffic() {
        let dev = SlaveDevice::new(1, BoardKind::DriveSteer);
        let mut bus = bus_with(&[]);
        let mut batch = dev.start_writes();
        assert!(matches!(
            batch.write_int(REG_STATUS, 1),
            Err(LinkError::Register(crate::registers::RegisterError::ReadOnly { .. }))
        ));
        assert!(matches!(
            batch.write_float(REGDS_STEER_REQPOS, 500.0),
            Err(LinkError::Register(crate::registers::RegisterError::OutOfRange { .. }))
        ));
        assert!(matches!(
            batch.write_int(99, 1),
            Err(LinkError::Register(crate::registers::RegisterError::NoSuchRegister { reg: 99 }))
        ));
        assert!(batch.is_empty());
        bus.write_batch(&batch).unwrap();
        assert!(bus.transport_mut().sent.is_empty());
    }

    #[test]
    fn test_write_batch_overflow() {
        let dev = SlaveDevice::new(1, BoardKind::DriveSteer);
        let mut batch = dev.start_writes();
        // 3 bytes per 2-byte register write, 252 bytes of room
        for _ in 0..84 {
            batch.write_int(REG_DEBUG, 1).unwrap();
        }
        assert!(matches!(
            batch.write_int(REG_DEBUG, 1),
            Err(LinkError::Protocol(ProtocolError::FrameTooLong { .. }))
        ));
        assert_eq!(batch.len(), 84);
    }

    #[test]
    fn test_set_read_set_updates_mirror_on_ack() {
        let dev = SlaveDevice::new(1, BoardKind::DriveSteer);
        let mut bus = bus_with(&[2]);
        dev.set_read_set(&mut bus, 0, &[REG_STATUS, REG_TIMER]).unwrap();
        assert_eq!(bus.read_sets().get(0), Some(&[REG_STATUS, REG_TIMER][..]));
        assert_eq!(
            bus.transport_mut().sent[0],
            vec![6, 0x14, 0, REG_STATUS, REG_TIMER, READSET_TERMINATOR]
        );
    }

    #[test]
    fn test_set_read_set_undercount() {
        let dev = SlaveDevice::new(1, BoardKind::DriveSteer);
        let mut bus = bus_with(&[1]);
        let err = dev
            .set_read_set(&mut bus, 0, &[REG_STATUS, REG_TIMER])
            .unwrap_err();
        assert!(matches!(
            err,
            LinkError::Protocol(ProtocolError::ReadSetMismatch {
                requested: 2,
                accepted: 1,
                ..
            })
        ));
        assert_eq!(bus.read_sets().get(0), None);
    }

    #[test]
    fn test_read_regs_in_declared_order() {
        let mut dev = SlaveDevice::new(1, BoardKind::DriveSteer);
        // ack, then STATUS (1 byte) = 1, TIMER (2 bytes) = 0x0102
        let mut bus = bus_with(&[2, 1, 0x02, 0x01]);
        dev.set_read_set(&mut bus, 1, &[REG_STATUS, REG_TIMER]).unwrap();
        dev.read_regs(&mut bus, 1).unwrap();
        assert_eq!(dev.values(), &[1, 0x0102]);
        assert_eq!(dev.reg_int(0), Some(1));
        assert_eq!(dev.reg_float(1), Some(258.0));
        assert_eq!(dev.reg_int(2), None);
    }

    #[test]
    fn test_reg_float_uses_position_mapping() {
        let mut dev = SlaveDevice::new(1, BoardKind::DriveSteer);
        let steer = BoardKind::DriveSteer.table();
        let raw = steer.get(REGDS_STEER_ACTUALPOS).unwrap().map(45.0);
        let [lo, hi] = raw.to_le_bytes();
        let mut bus = bus_with(&[2, 7, 0, lo, hi]);
        dev.set_read_set(&mut bus, 0, &[REG_TIMER, REGDS_STEER_ACTUALPOS])
            .unwrap();
        dev.read_regs(&mut bus, 0).unwrap();
        let pos = dev.reg_float(1).unwrap();
        assert!((pos - 45.0).abs() < 0.01);
    }

    #[test]
    fn test_undeclared_read_set() {
        let mut dev = SlaveDevice::new(1, BoardKind::Lift);
        let mut bus = bus_with(&[]);
        assert!(matches!(
            dev.read_regs(&mut bus, 2),
            Err(LinkError::Protocol(ProtocolError::UnknownReadSet { slot: 2 }))
        ));
    }

    #[test]
    fn test_timeout_requires_clear() {
        let mut dev = SlaveDevice::new(3, BoardKind::DriveSteer);
        // ack for the read set, then only one of the three reply bytes
        let mut bus = bus_with(&[2, 9]);
        dev.set_read_set(&mut bus, 0, &[REG_STATUS, REG_TIMER]).unwrap();

        let err = dev.read_regs(&mut bus, 0).unwrap_err();
        assert!(err.is_timeout());
        assert!(bus.is_timed_out());

        // refused until cleared
        let err = dev.read_regs(&mut bus, 0).unwrap_err();
        assert!(matches!(err, LinkError::Protocol(ProtocolError::TimeoutPending)));

        bus.clear_timeout().unwrap();
        assert_eq!(bus.transport_mut().discarded, 1);
        bus.transport_mut().replies.extend([0, 5, 0]);
        dev.read_regs(&mut bus, 0).unwrap();
        assert_eq!(dev.values(), &[0, 5]);
    }
}
