#![warn(missing_docs)]
/*! Trace stream mux daemon library.

`tracemux` acquires a raw byte stream from an embedded debug/trace source
and fans it out to TCP clients. The source is one of a USB bulk endpoint,
a TCP connection to a remote debug server (SEGGER RTT style), a local
serial port, or a plain file. Optionally the stream is treated as ARM
TPIU formatted-mode frames and demultiplexed, with every logical channel
served on its own listening port.

# Architecture overview

One producer thread fills fixed-size blocks into a small ring, one
consumer thread drains it:

```text
 [ USB | TCP | serial | file source ]
             ↓
   [ ring of 10 × 4 KiB blocks ]
             ↓
      [ distributor thread ]
        ↓             ↓
 [ pass-through ]  [ TPIU demux → per-channel buffer ]
        ↓             ↓
     [ fan-out sinks, one TCP listener each ]
             ↓
        [ any number of clients ]
```

The crate also carries the ORBFLOW framing: tagged, checksummed messages
inside COBS frames, timestamped on receive. The daemon can serve its
demuxed channels in that form, and the `flowview` binary consumes it.

# Example

Run a daemon that tails a file and serves it raw on port 3443:

```no_run
use tracemux::daemon::{Config, Daemon, SourceKind};
let cfg = Config {
    source: SourceKind::File { path: "/tmp/trace.bin".into(), terminate: false },
    ..Config::default()
};
Daemon::new(cfg)?.run()?;
# Ok::<(), tracemux::Error>(())
```
*/

// Codecs.
pub mod cobs;
pub mod orbflow;
pub mod tpiu;

// Pipeline.
pub mod daemon;
pub mod distributor;
pub mod fanout;
pub mod reporter;
pub mod ring;

// Ingest drivers.
pub mod file_source;
pub mod segger_source;
pub mod serial_source;
pub mod source;

#[cfg(feature = "usb")]
pub mod usb_source;

/// Tracemux error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from a source, sink or file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port open or configuration failure.
    #[error("serial configuration failed: {0}")]
    SerialConfig(String),

    /// USB stack failure.
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// No device in the probe table could be opened.
    #[error("no supported trace device found")]
    NoDevice,

    /// Cannot open the requested input file.
    #[error("cannot open {path}: {err}")]
    FileOpen {
        /// Path as given on the command line.
        path: String,
        /// Underlying error.
        err: std::io::Error,
    },

    /// Malformed TPIU channel list.
    #[error("bad channel list: {0}")]
    ChannelList(String),

    /// Any other invalid option or startup failure.
    #[error("{0}")]
    Setup(String),
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::SerialConfig(e.to_string())
    }
}

impl Error {
    /// Process exit code for this error, matching the daemon's contract:
    /// -3 for serial configuration trouble, -4 for a bad input file, -1
    /// for everything else that stops startup.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::SerialConfig(_) => -3,
            Error::FileOpen { .. } => -4,
            _ => -1,
        }
    }
}

/// Tracemux result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
