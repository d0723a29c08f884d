/*! Read the trace stream from a serial port.

Raw mode, 8N1, no flow control, at whatever rate the probe emits. On
Linux the serialport crate programs arbitrary rates through termios2 and
`BOTHER`; platforms without that get the nearest standard rate.
*/
use std::time::Duration;

use log::debug;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::source::{ByteSource, SourceRead};
use crate::{Error, Result};

/// Bounded reads, so cancellation is noticed on a quiet line.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial port ingest driver.
pub struct SerialSource {
    device: String,
    baud: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialSource {
    /// Create a driver for `device` at `baud`. Nothing is opened yet.
    #[must_use]
    pub fn new(device: &str, baud: u32) -> Self {
        Self {
            device: device.to_string(),
            baud,
            port: None,
        }
    }
}

impl ByteSource for SerialSource {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn open(&mut self) -> Result<()> {
        let port = serialport::new(self.device.as_str(), self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        debug!("Opened {} at {} baud", self.device, self.baud);
        self.port = Some(port);
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<SourceRead> {
        let Some(port) = self.port.as_mut() else {
            return Err(Error::Setup("serial source not open".into()));
        };
        match port.read(buf) {
            Ok(0) => Ok(SourceRead::Eof),
            Ok(n) => Ok(SourceRead::Data(n)),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(SourceRead::Idle)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn fatal_open(&self) -> bool {
        true
    }
}
