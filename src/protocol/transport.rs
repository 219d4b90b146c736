// Byte transports for the bus
//
// The session starts in text mode: after opening, the master resets and
// prints "Ready" on a line of its own, after which all traffic is binary.

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ProtocolError;

/// Baud rates the master firmware can be built for
pub const SUPPORTED_BAUDS: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// Line the master prints when it has booted
pub const READY_LINE: &str = "Ready";

/// Lines read while waiting for the handshake before giving up
const HANDSHAKE_ATTEMPTS: usize = 10;

/// Read timeout while waiting for the handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for binary transactions
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(1);

/// How long DTR is held low to reset the master
const DTR_PULSE: Duration = Duration::from_millis(10);

/// Longest handshake line we keep
const MAX_LINE: usize = 256;

/// A blocking byte stream to the master. One instance is shared by every
/// device on the bus and must only ever carry one transaction at a time.
pub trait Transport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError>;

    /// Fill `buf` completely or fail with `ProtocolError::Timeout`
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError>;

    /// Drop any bytes that arrived but were never read
    fn discard_input(&mut self) -> Result<(), ProtocolError>;
}

/// Serial link to the master
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open the port, reset the master and wait for its "Ready" line
    pub fn connect(port_name: &str, baudrate: u32) -> Result<Self, ProtocolError> {
        if !SUPPORTED_BAUDS.contains(&baudrate) {
            return Err(ProtocolError::UnsupportedBaud(baudrate));
        }

        info!("Opening serial port {} at {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(HANDSHAKE_TIMEOUT)
            .open()?;
        let mut transport = Self { port };

        transport.reset_master()?;
        transport.await_ready()?;
        transport.port.set_timeout(TRANSACTION_TIMEOUT)?;
        Ok(transport)
    }

    /// Pulse DTR low, which resets the master
    fn reset_master(&mut self) -> Result<(), ProtocolError> {
        self.port.write_data_terminal_ready(false)?;
        sleep(DTR_PULSE);
        self.port.write_data_terminal_ready(true)?;
        Ok(())
    }

    fn await_ready(&mut self) -> Result<(), ProtocolError> {
        for _ in 0..HANDSHAKE_ATTEMPTS {
            match self.read_line() {
                Ok(line) => {
                    debug!("Handshake line: {:?}", line);
                    if line == READY_LINE {
                        info!("Master ready");
                        return Ok(());
                    }
                }
                Err(ProtocolError::Timeout { .. }) => {
                    warn!("Timeout waiting for handshake line");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProtocolError::Handshake {
            attempts: HANDSHAKE_ATTEMPTS,
        })
    }

    /// Read one text line, dropping carriage returns
    fn read_line(&mut self) -> Result<String, ProtocolError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while line.len() < MAX_LINE {
            self.read_exact(&mut byte)?;
            match byte[0] {
                b'\n' => break,
                b'\r' => {}
                c => line.push(c),
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        // the master addresses frames by content only, so report device 0
        self.port.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                ProtocolError::Timeout { device: 0 }
            } else {
                ProtocolError::Io(e)
            }
        })
    }

    fn discard_input(&mut self) -> Result<(), ProtocolError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
