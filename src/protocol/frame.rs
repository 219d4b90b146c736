// Frame layout shared by host, master and slave
//
// Packet format: [length, device_id << 4 | command, payload...]
// where length counts every byte including itself, so a frame is at most
// 255 bytes long.

use super::ProtocolError;

/// Largest frame the one-byte length field can describe
pub const MAX_FRAME_LEN: usize = 255;

/// Bytes before the payload (length + id/command)
pub const HEADER_LEN: usize = 2;

/// Number of read-set slots
pub const READSETS: usize = 3;

/// Maximum registers in one read set
pub const READSETSIZE: usize = 32;

/// Terminates the register list of a SETREADSET payload
pub const READSET_TERMINATOR: u8 = 0xFF;

/// Command codes (low nibble of byte 1)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Write = 2,
    Read = 3,
    SetReadSet = 4,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            2 => Ok(Command::Write),
            3 => Ok(Command::Read),
            4 => Ok(Command::SetReadSet),
            other => Err(ProtocolError::UnknownCommand { code: other }),
        }
    }
}

/// Pack the id/command byte
pub fn command_byte(device: u8, command: Command) -> u8 {
    ((device & 0x0F) << 4) | command as u8
}

/// Parsed view of a complete frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    pub device: u8,
    pub command: Command,
    pub payload: &'a [u8],
}

impl<'a> FrameRef<'a> {
    /// Parse a frame whose length byte has already been satisfied
    pub fn parse(frame: &'a [u8]) -> Result<Self, ProtocolError> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::Malformed {
                reason: format!("frame of {} bytes has no header", frame.len()),
            });
        }
        let declared = frame[0] as usize;
        if declared != frame.len() {
            return Err(ProtocolError::Malformed {
                reason: format!("length byte {} but {} bytes", declared, frame.len()),
            });
        }
        let command = Command::try_from(frame[1] & 0x0F)?;
        Ok(Self {
            device: frame[1] >> 4,
            command,
            payload: &frame[HEADER_LEN..],
        })
    }
}

/// Builds one outgoing frame in a fixed buffer
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            buf: [0; MAX_FRAME_LEN],
            len: 0,
        }
    }

    /// Begin a new frame, discarding anything unsent
    pub fn start(&mut self, device: u8, command: Command) {
        self.buf[1] = command_byte(device, command);
        self.len = HEADER_LEN;
    }

    fn assert_in_frame(&self) -> Result<(), ProtocolError> {
        if self.len < HEADER_LEN {
            return Err(ProtocolError::NotInFrame);
        }
        Ok(())
    }

    pub fn add_byte(&mut self, b: u8) -> Result<(), ProtocolError> {
        self.add(&[b])
    }

    pub fn add(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.assert_in_frame()?;
        let end = self.len + data.len();
        if end > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLong { len: end });
        }
        self.buf[self.len..end].copy_from_slice(data);
        self.len = end;
        Ok(())
    }

    /// Stamp the length byte and hand out the finished frame. The builder
    /// is left empty.
    pub fn finish(&mut self) -> Result<&[u8], ProtocolError> {
        self.assert_in_frame()?;
        let len = self.len;
        self.buf[0] = len as u8;
        self.len = 0;
        Ok(&self.buf[..len])
    }
}
