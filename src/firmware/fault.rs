// Latched fault state
//
// One controller per control domain (each slave, and the master). It boots
// latched with a BOOT fault, latches the first fault raised after a reset and
// ignores everything else until the next reset. Listeners are told about
// every latch and reset synchronously, in registration order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info};

use crate::registers::tables::ST_EXCEPTION;

/// Fault kinds, numbered as on the wire
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Overcurrent = 1,
    Boot = 2,
    /// Another board faulted and the master relayed it
    Remote = 3,
    /// Reserved: high current with low control while stationary
    ShortNoControl = 4,
    Stall = 5,
    EncoderFault = 6,
    DriveFault = 7,
    /// Overcurrent with low control, likely shorted drive wires
    Short = 8,
}

impl FaultKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FaultKind::Overcurrent),
            2 => Some(FaultKind::Boot),
            3 => Some(FaultKind::Remote),
            4 => Some(FaultKind::ShortNoControl),
            5 => Some(FaultKind::Stall),
            6 => Some(FaultKind::EncoderFault),
            7 => Some(FaultKind::DriveFault),
            8 => Some(FaultKind::Short),
            _ => None,
        }
    }

    /// Bit for this kind in the disabled mask
    pub fn mask_bit(self) -> u16 {
        1 << self.code()
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Where a fault came from: a board address and a motor on that board
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultOrigin {
    pub device: u8,
    pub motor: u8,
}

impl FaultOrigin {
    pub fn new(device: u8, motor: u8) -> Self {
        Self { device, motor }
    }

    /// Pack into the origin byte: device in the low nibble, motor above it
    pub fn to_byte(self) -> u8 {
        (self.device & 0x0F) | (self.motor << 4)
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            device: b & 0x0F,
            motor: b >> 4,
        }
    }
}

/// Pack kind and origin into the exception data word
pub fn pack_exception_data(kind: FaultKind, origin: FaultOrigin) -> u16 {
    kind.code() as u16 | (origin.to_byte() as u16) << 8
}

/// Split an exception data word. Unknown kinds come back as `None`.
pub fn unpack_exception_data(word: u16) -> (Option<FaultKind>, FaultOrigin) {
    (
        FaultKind::from_code((word & 0xFF) as u8),
        FaultOrigin::from_byte((word >> 8) as u8),
    )
}

pub trait FaultListener {
    fn on_fault(&self, origin: FaultOrigin, kind: FaultKind);

    fn on_reset(&self) {}
}

pub struct FaultController {
    active: bool,
    kind: FaultKind,
    origin: FaultOrigin,
    disabled: u16,
    listeners: Vec<Rc<dyn FaultListener>>,
}

impl Default for FaultController {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FaultController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultController")
            .field("active", &self.active)
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("disabled", &self.disabled)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl FaultController {
    /// A fresh controller is latched with a BOOT fault
    pub fn new() -> Self {
        Self {
            active: true,
            kind: FaultKind::Boot,
            origin: FaultOrigin::default(),
            disabled: 0,
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Rc<dyn FaultListener>) {
        self.listeners.push(listener);
    }

    /// Latch a fault. Returns true if it latched; false when a fault is
    /// already active or the kind is disabled.
    pub fn raise(&mut self, origin: FaultOrigin, kind: FaultKind) -> bool {
        if self.active {
            debug!("Ignoring {} from {:?}: {} already latched", kind, origin, self.kind);
            return false;
        }
        if self.disabled & kind.mask_bit() != 0 {
            debug!("Ignoring disabled fault {} from {:?}", kind, origin);
            return false;
        }

        self.active = true;
        self.kind = kind;
        self.origin = origin;
        info!("Fault latched: {} from device {} motor {}", kind, origin.device, origin.motor);

        for l in &self.listeners {
            l.on_fault(origin, kind);
        }
        true
    }

    /// Notify listeners, then clear the latch
    pub fn reset(&mut self) {
        for l in &self.listeners {
            l.on_reset();
        }
        if self.active {
            info!("Fault {} cleared", self.kind);
        }
        self.active = false;
    }

    pub fn set_disabled_mask(&mut self, mask: u16) {
        self.disabled = mask;
    }

    pub fn disabled_mask(&self) -> u16 {
        self.disabled
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The latched fault, if any
    pub fn active_fault(&self) -> Option<(FaultKind, FaultOrigin)> {
        self.active.then_some((self.kind, self.origin))
    }

    /// Value of the status register
    pub fn status_bits(&self) -> u16 {
        if self.active { ST_EXCEPTION } else { 0 }
    }

    /// Value of the exception data register, zero when nothing is latched
    pub fn exception_data(&self) -> u16 {
        match self.active_fault() {
            Some((kind, origin)) => pack_exception_data(kind, origin),
            None => 0,
        }
    }
}
