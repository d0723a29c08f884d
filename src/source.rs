/*! Ingest driver plumbing.

Every driver implements [`ByteSource`]; one shared feeder loop drives it:
acquire the source, read into a scratch block, hand the block to the
ring, and on trouble release the source, back off and reacquire. The
loop polls the cancel token at every boundary, so it winds down within
one iteration of being asked to stop.
*/
use std::time::Duration;

use log::{info, warn};

use crate::Result;
use crate::daemon::CancelToken;
use crate::ring::{BlockRing, TRANSFER_SIZE};

/// Back-off between acquisition attempts.
pub const REOPEN_DELAY: Duration = Duration::from_millis(500);

/// What a zero-byte read means for the driver reporting it.
pub enum EofAction {
    /// The stream is finished; stop the feeder.
    Stop,
    /// Wait a bit and read again (tail-follow).
    Retry(Duration),
    /// Release the source and reacquire it.
    Reopen,
}

/// Outcome of one read attempt.
pub enum SourceRead {
    /// This many bytes landed at the front of the buffer.
    Data(usize),
    /// Zero-byte read; interpreted per [`ByteSource::on_eof`].
    Eof,
    /// Nothing this time (bulk/read timeout); just keep going.
    Idle,
}

/// A byte stream producer the feeder loop can drive.
pub trait ByteSource: Send {
    /// Driver name for logs and the feeder thread.
    fn name(&self) -> &'static str;

    /// Acquire the underlying source. Called before the first read and
    /// again after every release.
    fn open(&mut self) -> Result<()>;

    /// One read into `buf`.
    fn read_block(&mut self, buf: &mut [u8]) -> Result<SourceRead>;

    /// Release the underlying source.
    fn close(&mut self) {}

    /// Policy for zero-byte reads.
    fn on_eof(&self) -> EofAction {
        EofAction::Reopen
    }

    /// True if a failure of the *first* open should abort startup
    /// instead of being retried (fixed files, misconfigured serial
    /// ports).
    fn fatal_open(&self) -> bool {
        false
    }
}

/// Drive `src` until cancellation or [`EofAction::Stop`], filling the
/// ring. With `already_open` the caller has done the first `open`
/// (startup wants to see that error synchronously).
///
/// Closes the ring on the way out, so the consumer drains and stops.
pub fn run_feeder(
    mut src: Box<dyn ByteSource>,
    ring: &BlockRing,
    cancel: &CancelToken,
    already_open: bool,
) {
    let mut buf = [0u8; TRANSFER_SIZE];
    let mut need_open = !already_open;
    'acquire: while !cancel.is_canceled() {
        if need_open {
            if let Err(e) = src.open() {
                warn!("{}: open failed: {e}", src.name());
                cancel.sleep(REOPEN_DELAY);
                continue;
            }
            info!("{}: source connected", src.name());
        }
        need_open = true;
        while !cancel.is_canceled() {
            match src.read_block(&mut buf) {
                Ok(SourceRead::Data(n)) => {
                    // A full ring drops the block; the ring counts it.
                    ring.produce(&buf[..n]);
                }
                Ok(SourceRead::Idle) => {}
                Ok(SourceRead::Eof) => match src.on_eof() {
                    EofAction::Stop => {
                        info!("{}: end of stream", src.name());
                        break 'acquire;
                    }
                    EofAction::Retry(d) => cancel.sleep(d),
                    EofAction::Reopen => {
                        warn!("{}: source went away, reacquiring", src.name());
                        src.close();
                        cancel.sleep(REOPEN_DELAY);
                        continue 'acquire;
                    }
                },
                Err(e) => {
                    warn!("{}: read failed: {e}", src.name());
                    src.close();
                    cancel.sleep(REOPEN_DELAY);
                    continue 'acquire;
                }
            }
        }
    }
    src.close();
    ring.close();
    info!("{}: feeder finished", src.name());
}
