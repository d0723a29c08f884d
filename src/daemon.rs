/*! Daemon assembly.

Owns the whole pipeline: builds the fan-out sinks, the ring and the
distributor at construction time (so bind and validation failures are
startup errors), then `run()` spawns the feeder, distributor and
reporter threads and joins them. Everything winds down through one
shared [`CancelToken`].
*/
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::distributor::{Distributor, Handler};
use crate::fanout::FanoutServer;
use crate::reporter::Reporter;
use crate::ring::BlockRing;
use crate::source::{ByteSource, run_feeder};
use crate::{Error, Result};

/// Default base listening port.
pub const DEFAULT_LISTEN_PORT: u16 = 3443;

/// Default port of a SEGGER debug server.
pub const DEFAULT_SEGGER_PORT: u16 = 2332;

/// Cooperative cancellation flag shared by all daemon threads. Cloned
/// handles observe the same flag.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Ask every holder to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has someone asked us to stop?
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep up to `d`, returning early when cancelled.
    pub fn sleep(&self, d: Duration) {
        let slice = Duration::from_millis(50);
        let mut left = d;
        while !self.is_canceled() && left > Duration::ZERO {
            let s = left.min(slice);
            thread::sleep(s);
            left -= s;
        }
    }
}

/// Where the bytes come from.
#[derive(Clone, Debug)]
pub enum SourceKind {
    /// USB bulk endpoint of a known debug probe.
    Usb,
    /// TCP connection to a SEGGER style debug server.
    Segger {
        /// Server host name or address.
        host: String,
        /// Server port.
        port: u16,
    },
    /// Local serial port.
    Serial {
        /// Device path.
        device: String,
        /// Baud rate.
        baud: u32,
    },
    /// Plain file, optionally tailed.
    File {
        /// File path.
        path: String,
        /// Stop at end of file instead of tailing it.
        terminate: bool,
    },
}

/// Daemon configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// The ingest driver to run.
    pub source: SourceKind,
    /// Base listen port. With TPIU, the i-th channel of `channels` is
    /// served on `listen_port + i`. Port 0 binds ephemeral ports.
    pub listen_port: u16,
    /// TPIU channels to serve, in port order. Empty disables TPIU and
    /// serves the raw stream on `listen_port`.
    pub channels: Vec<u8>,
    /// Also serve every flushed channel block as an ORBFLOW frame on
    /// this port. Needs TPIU.
    pub orbflow_port: Option<u16>,
    /// Statistics interval in milliseconds; 0 disables the reporter.
    pub interval_ms: u64,
    /// Link speed estimate in bits/s, for the utilisation report.
    pub data_speed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceKind::Usb,
            listen_port: DEFAULT_LISTEN_PORT,
            channels: Vec::new(),
            orbflow_port: None,
            interval_ms: 1000,
            data_speed: None,
        }
    }
}

/// The assembled daemon. Dropping it releases the sinks.
pub struct Daemon {
    cfg: Config,
    cancel: CancelToken,
    distributor: Distributor,
    interval_bytes: Arc<AtomicU64>,
    ring: Arc<BlockRing>,
    sinks: Vec<Arc<FanoutServer>>,
    listen_ports: Vec<u16>,
    orbflow_port: Option<u16>,
}

impl Daemon {
    /// Validate the configuration and bind all listening sockets.
    pub fn new(cfg: Config) -> Result<Self> {
        validate_channels(&cfg.channels)?;
        let interval_bytes = Arc::new(AtomicU64::new(0));
        let ring = Arc::new(BlockRing::new());
        let mut listen_ports = Vec::new();
        let mut sinks = Vec::new();
        let distributor;
        let orbflow_port;
        if cfg.channels.is_empty() {
            if cfg.orbflow_port.is_some() {
                return Err(Error::Setup(
                    "ORBFLOW output needs TPIU channels".into(),
                ));
            }
            let sink = Arc::new(FanoutServer::start(cfg.listen_port)?);
            listen_ports.push(sink.local_port());
            sinks.push(sink.clone());
            distributor = Distributor::passthrough(sink, interval_bytes.clone());
            orbflow_port = None;
        } else {
            let mut handlers = Vec::with_capacity(cfg.channels.len());
            for (i, &ch) in cfg.channels.iter().enumerate() {
                let port = if cfg.listen_port == 0 {
                    0
                } else {
                    cfg.listen_port + i as u16
                };
                let sink = Arc::new(FanoutServer::start(port)?);
                info!("Channel {ch} on port {}", sink.local_port());
                listen_ports.push(sink.local_port());
                sinks.push(sink.clone());
                handlers.push(Handler::new(ch, sink));
            }
            let of = match cfg.orbflow_port {
                Some(p) => {
                    let s = Arc::new(FanoutServer::start(p)?);
                    orbflow_port = Some(s.local_port());
                    sinks.push(s.clone());
                    Some(s)
                }
                None => {
                    orbflow_port = None;
                    None
                }
            };
            distributor = Distributor::tpiu(handlers, of, interval_bytes.clone());
        }
        Ok(Self {
            cfg,
            cancel: CancelToken::new(),
            distributor,
            interval_bytes,
            ring,
            sinks,
            listen_ports,
            orbflow_port,
        })
    }

    /// Token that stops the daemon; hand it to a signal handler.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Ports actually bound, one per channel (or one, without TPIU).
    #[must_use]
    pub fn listen_ports(&self) -> &[u16] {
        &self.listen_ports
    }

    /// Port of the ORBFLOW mux sink, when configured.
    #[must_use]
    pub fn orbflow_port(&self) -> Option<u16> {
        self.orbflow_port
    }

    /// Run the pipeline until the source finishes or the token cancels.
    pub fn run(self) -> Result<()> {
        let mut src = make_source(&self.cfg.source)?;
        // A permanent failure to acquire a fixed source is a startup
        // error; anything else just means the feeder starts retrying.
        let already_open = match src.open() {
            Ok(()) => true,
            Err(e) if src.fatal_open() => return Err(e),
            Err(e) => {
                warn!("{}: not available yet: {e}", src.name());
                false
            }
        };

        let feeder = {
            let ring = self.ring.clone();
            let cancel = self.cancel.clone();
            thread::Builder::new()
                .name(format!("feeder-{}", src.name()))
                .spawn(move || run_feeder(src, &ring, &cancel, already_open))?
        };
        let dist = {
            let ring = self.ring.clone();
            let cancel = self.cancel.clone();
            let mut distributor = self.distributor;
            thread::Builder::new()
                .name("distributor".to_string())
                .spawn(move || distributor.run(&ring, &cancel))?
        };
        let reporter = if self.cfg.interval_ms > 0 {
            let r = Reporter::new(
                self.cfg.interval_ms,
                self.interval_bytes.clone(),
                self.ring.clone(),
                self.sinks.clone(),
                self.cfg.data_speed,
            );
            let cancel = self.cancel.clone();
            Some(
                thread::Builder::new()
                    .name("reporter".to_string())
                    .spawn(move || r.run(&cancel))?,
            )
        } else {
            None
        };

        feeder.join().expect("feeder thread panicked");
        dist.join().expect("distributor thread panicked");
        self.cancel.cancel();
        if let Some(t) = reporter {
            t.join().expect("reporter thread panicked");
        }
        info!("Daemon finished");
        Ok(())
    }
}

fn validate_channels(channels: &[u8]) -> Result<()> {
    for (i, &c) in channels.iter().enumerate() {
        if !(1..=127).contains(&c) {
            return Err(Error::ChannelList(format!(
                "channel {c} out of range 1..127"
            )));
        }
        if channels[i + 1..].contains(&c) {
            return Err(Error::ChannelList(format!("channel {c} given twice")));
        }
    }
    Ok(())
}

fn make_source(kind: &SourceKind) -> Result<Box<dyn ByteSource>> {
    match kind {
        #[cfg(feature = "usb")]
        SourceKind::Usb => Ok(Box::new(crate::usb_source::UsbSource::new())),
        #[cfg(not(feature = "usb"))]
        SourceKind::Usb => Err(Error::Setup("USB support not compiled in".into())),
        SourceKind::Segger { host, port } => Ok(Box::new(
            crate::segger_source::SeggerSource::new(host, *port),
        )),
        SourceKind::Serial { device, baud } => Ok(Box::new(
            crate::serial_source::SerialSource::new(device, *baud),
        )),
        SourceKind::File { path, terminate } => Ok(Box::new(
            crate::file_source::FileSource::new(path, *terminate),
        )),
    }
}
