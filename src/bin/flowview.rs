/*! Watch an ORBFLOW stream.

Connects to a server speaking ORBFLOW (for instance `tracemux
--orbflow-port`), decodes the stream, and prints one line per frame plus
running per-channel totals on exit. Reconnects on its own when the
server goes away.
*/
use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use tracemux::daemon::CancelToken;
use tracemux::orbflow::OrbflowDecoder;

const RECONNECT_DELAY: Duration = Duration::from_millis(500);

#[derive(clap::Parser, Debug)]
#[command(version, about = "Watch an ORBFLOW stream and summarise its frames")]
struct Opt {
    /// Server to read from, host:port.
    #[arg(default_value = "localhost:3443")]
    server: String,

    /// Dump frame payloads as hex.
    #[arg(short = 'x', long)]
    hex: bool,

    /// Verbosity, 0..3.
    #[arg(short = 'v', long, default_value_t = 2)]
    verbose: usize,
}

fn hexdump(b: &[u8]) -> String {
    b.iter()
        .map(|x| format!("{x:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("tracemux")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())?;
    }

    let mut totals = [0u64; 256];
    let mut decoder = OrbflowDecoder::new();
    let mut buf = [0u8; 4096];
    while !cancel.is_canceled() {
        let mut stream = match TcpStream::connect(&opt.server) {
            Ok(s) => s,
            Err(e) => {
                warn!("{}: {e}", opt.server);
                cancel.sleep(RECONNECT_DELAY);
                continue;
            }
        };
        stream.set_read_timeout(Some(Duration::from_millis(100)))?;
        info!("Connected to {}", opt.server);
        while !cancel.is_canceled() {
            match stream.read(&mut buf) {
                Ok(0) => {
                    warn!("Server closed the connection");
                    break;
                }
                Ok(n) => decoder.pump(&buf[..n], &mut |f| {
                    totals[f.tag as usize] += f.payload.len() as u64;
                    let status = if f.good { "ok" } else { "BAD" };
                    if opt.hex {
                        println!(
                            "{} ch {:3} {:4}B {} {}",
                            f.tstamp,
                            f.tag,
                            f.payload.len(),
                            status,
                            hexdump(f.payload)
                        );
                    } else {
                        println!(
                            "{} ch {:3} {:4}B {}",
                            f.tstamp,
                            f.tag,
                            f.payload.len(),
                            status
                        );
                    }
                }),
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("read failed: {e}");
                    break;
                }
            }
        }
        cancel.sleep(RECONNECT_DELAY);
    }

    for (tag, n) in totals.iter().enumerate() {
        if *n > 0 {
            info!("channel {tag}: {n} bytes");
        }
    }
    info!(
        "{} frames, {} bad checksums, {} short",
        decoder.frames(),
        decoder.bad_checksum(),
        decoder.short_frames()
    );
    Ok(())
}
