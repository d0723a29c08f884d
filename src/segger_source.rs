/*! Read the trace stream from a SEGGER style debug server.

A plain TCP client. The feeder loop owns reconnection; this driver just
connects, reads, and reports a closed connection as end of stream so it
gets reacquired.
*/
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;

use crate::source::{ByteSource, SourceRead};
use crate::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded reads, so cancellation is noticed while the link is quiet.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// SEGGER TCP ingest driver.
pub struct SeggerSource {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl SeggerSource {
    /// Create a driver for `host:port`. Nothing is connected yet.
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            stream: None,
        }
    }
}

impl ByteSource for SeggerSource {
    fn name(&self) -> &'static str {
        "segger"
    }

    fn open(&mut self) -> Result<()> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Setup(format!("cannot resolve {}", self.host))
            })?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        debug!("Connected to {}:{}", self.host, self.port);
        self.stream = Some(stream);
        Ok(())
    }

    fn read_block(&mut self, buf: &mut [u8]) -> Result<SourceRead> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::Setup("segger source not open".into()));
        };
        match stream.read(buf) {
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
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::EofAction;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn connects_reads_and_sees_eof() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let server = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            s.write_all(b"rtt data").unwrap();
            // Dropping the socket closes the connection.
        });

        let mut src = SeggerSource::new("127.0.0.1", port);
        src.open()?;
        let mut buf = [0u8; 64];
        let mut got: Vec<u8> = Vec::new();
        loop {
            match src.read_block(&mut buf)? {
                SourceRead::Data(n) => got.extend(&buf[..n]),
                SourceRead::Idle => {}
                SourceRead::Eof => break,
            }
        }
        assert_eq!(got, b"rtt data");
        // A dead connection is reacquired, not fatal.
        assert!(matches!(src.on_eof(), EofAction::Reopen));
        assert!(!src.fatal_open());
        server.join().unwrap();
        Ok(())
    }

    #[test]
    fn refused_connection_is_an_open_error() {
        // Port 1 is essentially never listening.
        let mut src = SeggerSource::new("127.0.0.1", 1);
        assert!(src.open().is_err());
    }
}
