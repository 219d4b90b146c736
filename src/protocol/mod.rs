// Register/read-set protocol between host, master and slaves
//
// Provides:
// - Frame layout and command codes
// - Byte transports (serial port with "Ready" handshake, simulated master)
// - The host bus: batched writes, read-set declaration and batch reads

pub mod bus;
pub mod frame;
pub mod sim;
pub mod transport;

pub use bus::{Bus, ReadSetMirror, SlaveDevice, WriteBatch};
pub use frame::{Command, FrameBuilder, FrameRef, MAX_FRAME_LEN, READSETS, READSETSIZE};
pub use sim::SimulatedRover;
pub use transport::{SerialTransport, Transport, SUPPORTED_BAUDS};

use crate::registers::RegisterError;

/// Transport and framing failures
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for response from device {device}")]
    Timeout { device: u8 },

    #[error("Transport is out of sync after a timeout; clear it before the next transaction")]
    TimeoutPending,

    #[error("No \"Ready\" line from the master after {attempts} lines")]
    Handshake { attempts: usize },

    #[error("Unsupported baud rate: {0}")]
    UnsupportedBaud(u32),

    #[error("Not connected")]
    NotConnected,

    #[error("Frame of {len} bytes exceeds the 255-byte limit")]
    FrameTooLong { len: usize },

    #[error("Adding frame data while not in a frame")]
    NotInFrame,

    #[error("Unknown command code {code}")]
    UnknownCommand { code: u8 },

    #[error("Malformed frame: {reason}")]
    Malformed { reason: String },

    #[error("Device {device} rejected register write: code {code}")]
    Rejected { device: u8, code: u8 },

    #[error("Device {device} accepted {accepted} of {requested} read-set registers")]
    ReadSetMismatch {
        device: u8,
        requested: usize,
        accepted: usize,
    },

    #[error("Read set of {len} registers exceeds the limit of {max}")]
    ReadSetTooLarge { len: usize, max: usize },

    #[error("Read set slot {slot} is out of range or undeclared")]
    UnknownReadSet { slot: u8 },
}

/// Anything a host-side register operation can fail with. Fault state is
/// not an error; it is read back through the status registers.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Register(#[from] RegisterError),
}

impl LinkError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LinkError::Protocol(ProtocolError::Timeout { .. } | ProtocolError::TimeoutPending)
        )
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
