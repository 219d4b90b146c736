// Register descriptors shared by host, master and slave
//
// A register is a 1- or 2-byte wire value that maps linearly onto an
// engineering-unit range. Tables are static arrays terminated by a sentinel
// descriptor; their length is discovered by scanning, never stored.

pub mod tables;

use tracing::trace;

/// Flag bit in `size_and_flags` marking a writable register
pub const RF_WRITABLE: u8 = 0x80;

/// Mask for the size field of `size_and_flags`
const SIZE_MASK: u8 = 0x3F;

/// Size field value of the table terminator
pub const SENTINEL_SIZE: u8 = 32;

/// Size values above this are never a real register
const MAX_REAL_SIZE: u8 = 30;

/// Wire error code: register id past the end of the table
pub const E_NOSUCHREG: u8 = 1;
/// Wire error code: write attempted on a read-only register
pub const E_READONLY: u8 = 2;

/// Register access errors, raised before any bus traffic
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegisterError {
    #[error("No such register: {reg}")]
    NoSuchRegister { reg: u8 },

    #[error("Register {reg} is read-only")]
    ReadOnly { reg: u8 },

    #[error("Value {value} out of range [{min}, {max}] for register {reg}")]
    OutOfRange { reg: u8, value: f32, min: f32, max: f32 },
}

impl RegisterError {
    /// Status byte sent on the wire for this error
    pub fn code(&self) -> u8 {
        match self {
            RegisterError::NoSuchRegister { .. } => E_NOSUCHREG,
            RegisterError::ReadOnly { .. } => E_READONLY,
            // never leaves the host
            RegisterError::OutOfRange { .. } => 0xFF,
        }
    }

    /// Rebuild an error from a wire status byte
    pub fn from_code(reg: u8, code: u8) -> Option<Self> {
        match code {
            E_NOSUCHREG => Some(RegisterError::NoSuchRegister { reg }),
            E_READONLY => Some(RegisterError::ReadOnly { reg }),
            _ => None,
        }
    }
}

/// Static description of one register
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Register {
    pub size_and_flags: u8,
    pub min: f32,
    pub max: f32,
}

impl Register {
    /// Unmapped register: the float domain equals the raw domain
    pub const fn int(size: u8, writable: bool) -> Self {
        let max = if size == 1 { 255.0 } else { 65535.0 };
        Self::float(size, writable, 0.0, max)
    }

    /// Mapped register covering `[min, max]`
    pub const fn float(size: u8, writable: bool, min: f32, max: f32) -> Self {
        let flags = if writable { RF_WRITABLE } else { 0 };
        Self {
            size_and_flags: (size & SIZE_MASK) | flags,
            min,
            max,
        }
    }

    /// Table terminator
    pub const fn sentinel() -> Self {
        Self {
            size_and_flags: SENTINEL_SIZE,
            min: 0.0,
            max: 0.0,
        }
    }

    /// Size on the wire in bytes
    pub fn size(&self) -> usize {
        (self.size_and_flags & SIZE_MASK) as usize
    }

    pub fn writable(&self) -> bool {
        self.size_and_flags & RF_WRITABLE != 0
    }

    pub fn is_sentinel(&self) -> bool {
        self.size_and_flags & SIZE_MASK > MAX_REAL_SIZE
    }

    /// Largest raw value, `2^(8*size) - 1`
    pub fn raw_max(&self) -> u16 {
        if self.size() == 1 { 0xFF } else { 0xFFFF }
    }

    /// Engineering units covered by one raw step
    pub fn step(&self) -> f32 {
        (self.max - self.min) / self.raw_max() as f32
    }

    pub fn in_range(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }

    /// Map an engineering value onto the raw domain. Out-of-range input
    /// saturates; check `in_range` first where that matters.
    pub fn map(&self, value: f32) -> u16 {
        let span = self.max - self.min;
        if span <= 0.0 {
            return 0;
        }
        let scaled = (value - self.min) / span * self.raw_max() as f32;
        scaled.round().clamp(0.0, self.raw_max() as f32) as u16
    }

    pub fn unmap(&self, raw: u16) -> f32 {
        let raw = raw.min(self.raw_max());
        self.min + raw as f32 * self.step()
    }
}

/// A sentinel-terminated register table with its scanned length
#[derive(Debug, Clone, Copy)]
pub struct RegisterTable {
    name: &'static str,
    regs: &'static [Register],
    len: usize,
}

impl RegisterTable {
    /// Scan `regs` up to the sentinel. A table without one is treated as
    /// ending at the slice end.
    pub fn scan(name: &'static str, regs: &'static [Register]) -> Self {
        let len = regs
            .iter()
            .position(Register::is_sentinel)
            .unwrap_or(regs.len());
        trace!("Register table {} has {} entries", name, len);
        Self { name, regs, len }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, reg: u8) -> Option<&Register> {
        let idx = reg as usize;
        if idx < self.len { self.regs.get(idx) } else { None }
    }

    /// Validate an access and return the descriptor. Every read and write
    /// goes through here before touching hardware or the bus.
    pub fn check_and_load(&self, reg: u8, write_requested: bool) -> Result<&Register, RegisterError> {
        let desc = self.get(reg).ok_or(RegisterError::NoSuchRegister { reg })?;
        if write_requested && !desc.writable() {
            return Err(RegisterError::ReadOnly { reg });
        }
        Ok(desc)
    }

    /// Map a value for a writable register, checking range first
    pub fn map_checked(&self, reg: u8, value: f32) -> Result<u16, RegisterError> {
        let desc = self.check_and_load(reg, true)?;
        if !desc.in_range(value) {
            return Err(RegisterError::OutOfRange {
                reg,
                value,
                min: desc.min,
                max: desc.max,
            });
        }
        Ok(desc.map(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SMALL: [Register; 3] = [
        Register::int(1, true),
        Register::float(2, false, -10.0, 10.0),
        Register::sentinel(),
    ];

    #[test]
    fn test_size_and_flags() {
        let r = Register::float(2, true, 0.0, 1.0);
        assert_eq!(r.size(), 2);
        assert!(r.writable());
        assert!(!r.is_sentinel());
        assert!(Register::sentinel().is_sentinel());
        assert!(!Register::int(1, false).writable());
    }

    #[test]
    fn test_scan_stops_at_sentinel() {
        let t = RegisterTable::scan("small", &SMALL);
        assert_eq!(t.len(), 2);
        assert!(t.get(2).is_none());
    }

    #[test]
    fn test_check_and_load() {
        let t = RegisterTable::scan("small", &SMALL);
        assert!(t.check_and_load(0, true).is_ok());
        assert_eq!(t.check_and_load(1, true), Err(RegisterError::ReadOnly { reg: 1 }));
        assert!(t.check_and_load(1, false).is_ok());
        assert_eq!(
            t.check_and_load(2, false),
            Err(RegisterError::NoSuchRegister { reg: 2 })
        );
        assert_eq!(RegisterError::NoSuchRegister { reg: 9 }.code(), E_NOSUCHREG);
        assert_eq!(RegisterError::ReadOnly { reg: 9 }.code(), E_READONLY);
    }

    #[test]
    fn test_map_endpoints() {
        let r = Register::float(1, true, -1.0, 1.0);
        assert_eq!(r.map(-1.0), 0);
        assert_eq!(r.map(1.0), 255);
        assert_eq!(r.unmap(0), -1.0);
        assert_eq!(r.unmap(255), 1.0);
        // Saturates instead of wrapping
        assert_eq!(r.map(5.0), 255);
        assert_eq!(r.map(-5.0), 0);
    }

    #[test]
    fn test_round_trip_within_one_step() {
        let regs = [
            Register::float(1, true, 0.0, 1.0),
            Register::float(2, true, -180.0, 180.0),
            Register::float(2, true, -3000.0, 3000.0),
            Register::int(2, true),
        ];
        for r in regs {
            let n = 997;
            for i in 0..=n {
                let v = r.min + (r.max - r.min) * i as f32 / n as f32;
                let back = r.unmap(r.map(v));
                assert!(
                    (back - v).abs() <= r.step(),
                    "{} -> {} exceeds step {}",
                    v,
                    back,
                    r.step()
                );
            }
        }
    }

    #[test]
    fn test_map_checked_rejects_out_of_range() {
        let t = RegisterTable::scan("small", &SMALL);
        assert_eq!(t.map_checked(0, 300.0).unwrap_err().code(), 0xFF);
        assert!(matches!(
            t.map_checked(0, -1.0),
            Err(RegisterError::OutOfRange { reg: 0, .. })
        ));
        assert_eq!(t.map_checked(0, 12.0), Ok(12));
    }
}
