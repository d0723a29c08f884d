/*! Trace stream mux daemon.

Reads a raw trace stream from a debug probe (USB bulk), a SEGGER debug
server (TCP), a serial port or a file, optionally strips TPIU framing,
and serves the result to any number of TCP clients. Without TPIU the raw
stream is on the base port; with TPIU each configured channel gets the
next port up.

```no_run
$ tracemux -v 2                      # USB probe, raw stream on :3443
$ tracemux -s localhost -t 1,2       # SEGGER, channel 1 on :3443, 2 on :3444
$ tracemux -f capture.bin -e -m 0    # replay a capture, then exit
```
*/
use std::process::exit;

use clap::Parser;
use log::error;

use tracemux::Error;
use tracemux::daemon::{
    Config, DEFAULT_LISTEN_PORT, DEFAULT_SEGGER_PORT, Daemon, SourceKind,
};

/// Option and startup failures leave with this code.
const EXIT_BAD_OPTIONS: i32 = -1;

/// Effective data rate of an Orbtrace FPGA link: 12 MHz serial, 8b10b.
const ORBTRACE_DATA_SPEED: u64 = 9_600_000;

#[derive(clap::Parser, Debug)]
#[command(version, about = "Mux an embedded trace stream out to TCP clients")]
struct Opt {
    /// Serial link speed in bps; doubles as the throughput estimate
    /// for the monitor.
    #[arg(short = 'a', long = "serial-speed")]
    serial_speed: Option<u32>,

    /// With a file source, exit at end of file instead of tailing.
    #[arg(short = 'e', long = "eof")]
    eof_terminate: bool,

    /// Take input from a file.
    #[arg(
        short = 'f',
        long = "input-file",
        conflicts_with_all = ["serial_port", "server"]
    )]
    input_file: Option<String>,

    /// Base TCP port to serve on.
    #[arg(short = 'l', long = "listen-port", default_value_t = DEFAULT_LISTEN_PORT)]
    listen_port: u16,

    /// Interval report period in ms; 0 disables.
    #[arg(short = 'm', long = "monitor", default_value_t = 1000)]
    monitor: u64,

    /// Orbtrace trace pin width: 1, 2 or 4. Implies TPIU decoding.
    #[arg(short = 'o', long = "orbtrace")]
    orbtrace_width: Option<u32>,

    /// Take input from a serial device.
    #[arg(short = 'p', long = "serial-port", conflicts_with = "server")]
    serial_port: Option<String>,

    /// Take input from a SEGGER debug server, host[:port].
    #[arg(short = 's', long = "server")]
    server: Option<String>,

    /// Decode TPIU and serve these comma separated channels (1..127),
    /// one port each, starting at the base port.
    #[arg(short = 't', long = "tpiu")]
    tpiu_channels: Option<String>,

    /// Also serve every channel as ORBFLOW frames on this port.
    #[arg(long = "orbflow-port")]
    orbflow_port: Option<u16>,

    /// Verbosity, 0..3.
    #[arg(short = 'v', long = "verbose", default_value_t = 1)]
    verbose: usize,
}

fn build_config(opt: &Opt) -> tracemux::Result<Config> {
    let mut channels = Vec::new();
    if let Some(list) = &opt.tpiu_channels {
        for item in list.split(',') {
            let ch = item.trim().parse::<u8>().map_err(|_| {
                Error::ChannelList(format!("'{item}' is not a channel number"))
            })?;
            channels.push(ch);
        }
    }
    if let Some(w) = opt.orbtrace_width {
        if !matches!(w, 1 | 2 | 4) {
            return Err(Error::Setup(format!(
                "trace width {w} is not one of 1, 2, 4"
            )));
        }
        // Trace width implies TPIU; default to the first channel.
        if channels.is_empty() {
            channels.push(1);
        }
    }

    let source = if let Some(path) = &opt.input_file {
        SourceKind::File {
            path: path.clone(),
            terminate: opt.eof_terminate,
        }
    } else if let Some(device) = &opt.serial_port {
        let baud = opt.serial_speed.ok_or_else(|| {
            Error::SerialConfig("serial source needs a speed (-a)".into())
        })?;
        SourceKind::Serial {
            device: device.clone(),
            baud,
        }
    } else if let Some(server) = &opt.server {
        let (host, port) = match server.split_once(':') {
            Some((h, p)) => (
                h.to_string(),
                p.parse().map_err(|_| {
                    Error::Setup(format!("'{p}' is not a port number"))
                })?,
            ),
            None => (server.clone(), DEFAULT_SEGGER_PORT),
        };
        SourceKind::Segger { host, port }
    } else {
        SourceKind::Usb
    };

    let data_speed = if opt.orbtrace_width.is_some() {
        Some(ORBTRACE_DATA_SPEED)
    } else {
        opt.serial_speed.map(u64::from)
    };

    Ok(Config {
        source,
        listen_port: opt.listen_port,
        channels,
        orbflow_port: opt.orbflow_port,
        interval_ms: opt.monitor,
        data_speed,
    })
}

fn main() {
    let opt = match Opt::try_parse() {
        Ok(o) => o,
        Err(e) => {
            // Help and usage errors alike leave non-zero.
            let _ = e.print();
            exit(EXIT_BAD_OPTIONS);
        }
    };

    if let Err(e) = stderrlog::new()
        .module(module_path!())
        .module("tracemux")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()
    {
        eprintln!("Failed to set up logging: {e}");
        exit(EXIT_BAD_OPTIONS);
    }

    let cfg = match build_config(&opt) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            exit(e.exit_code());
        }
    };
    let daemon = match Daemon::new(cfg) {
        Ok(d) => d,
        Err(e) => {
            error!("{e}");
            exit(e.exit_code());
        }
    };

    let cancel = daemon.cancel_token();
    ctrlc::set_handler(move || {
        eprintln!("Shutting down…");
        cancel.cancel();
    })
    .expect("Error setting Ctrl-C handler");

    if let Err(e) = daemon.run() {
        error!("{e}");
        exit(e.exit_code());
    }
}
