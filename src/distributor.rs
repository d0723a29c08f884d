/*! Distribution core.

The consumer side of the pipeline: takes blocks out of the ring and
either passes them straight through to a single fan-out sink, or runs
them through the TPIU decoder and steers every decoded byte into the
buffer of the handler serving that stream. Handler buffers are flushed
to their sinks once the input block is fully consumed, or earlier if
one fills up.
*/
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{info, trace};

use crate::daemon::CancelToken;
use crate::fanout::FanoutServer;
use crate::orbflow;
use crate::ring::{BlockRing, Consume, DataBlock, TRANSFER_SIZE};
use crate::tpiu::{TpiuDecoder, TpiuEvent};

/// Consumer wait slice, so cancellation is noticed promptly.
const CONSUME_WAIT: Duration = Duration::from_millis(100);

/// Per-channel output state: the stream id it serves, an accumulation
/// buffer, and the sink its bytes go to.
pub struct Handler {
    channel: u8,
    block: DataBlock,
    sink: Arc<FanoutServer>,
}

impl Handler {
    /// Create a handler for `channel` feeding `sink`.
    #[must_use]
    pub fn new(channel: u8, sink: Arc<FanoutServer>) -> Self {
        Self {
            channel,
            block: DataBlock::new(),
            sink,
        }
    }
}

enum Mode {
    Passthrough(Arc<FanoutServer>),
    Tpiu {
        decoder: TpiuDecoder,
        handlers: Vec<Handler>,
        /// Index of the last handler that matched; streams usually run
        /// in long spans of the same channel.
        cache: usize,
        orbflow_sink: Option<Arc<FanoutServer>>,
    },
}

/// The distribution loop and its state.
pub struct Distributor {
    mode: Mode,
    interval_bytes: Arc<AtomicU64>,
    tpiu_errors: u64,
    no_handler_bytes: u64,
}

impl Distributor {
    /// Distributor that forwards every block unchanged to one sink.
    #[must_use]
    pub fn passthrough(sink: Arc<FanoutServer>, interval_bytes: Arc<AtomicU64>) -> Self {
        Self {
            mode: Mode::Passthrough(sink),
            interval_bytes,
            tpiu_errors: 0,
            no_handler_bytes: 0,
        }
    }

    /// Distributor that TPIU-decodes and demultiplexes into `handlers`.
    /// With `orbflow_sink`, every flushed channel block is additionally
    /// sent there as one ORBFLOW frame tagged with the channel id.
    #[must_use]
    pub fn tpiu(
        handlers: Vec<Handler>,
        orbflow_sink: Option<Arc<FanoutServer>>,
        interval_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            mode: Mode::Tpiu {
                decoder: TpiuDecoder::new(),
                handlers,
                cache: 0,
                orbflow_sink,
            },
            interval_bytes,
            tpiu_errors: 0,
            no_handler_bytes: 0,
        }
    }

    /// TPIU decode errors seen (counted, never fatal).
    #[must_use]
    pub fn tpiu_errors(&self) -> u64 {
        self.tpiu_errors
    }

    /// Decoded bytes dropped for lack of a configured handler.
    #[must_use]
    pub fn no_handler_bytes(&self) -> u64 {
        self.no_handler_bytes
    }

    /// Consume the ring until it closes or the token cancels. Data
    /// errors never stop this loop.
    pub fn run(&mut self, ring: &BlockRing, cancel: &CancelToken) {
        let mut block = DataBlock::new();
        loop {
            match ring.consume_into(&mut block, CONSUME_WAIT) {
                Consume::Taken => self.process(block.bytes()),
                Consume::Empty => {
                    if cancel.is_canceled() {
                        break;
                    }
                }
                Consume::Closed => break,
            }
        }
        self.flush_all();
        if matches!(self.mode, Mode::Tpiu { .. }) {
            info!(
                "Distributor done: {} TPIU errors, {} bytes without a handler",
                self.tpiu_errors, self.no_handler_bytes
            );
        }
    }

    fn process(&mut self, bytes: &[u8]) {
        self.interval_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        match &mut self.mode {
            Mode::Passthrough(sink) => sink.send(bytes),
            Mode::Tpiu {
                decoder,
                handlers,
                cache,
                orbflow_sink,
            } => {
                for &b in bytes {
                    match decoder.pump(b) {
                        TpiuEvent::RxedPacket => {
                            for &(stream, byte) in decoder.packet() {
                                steer(
                                    handlers,
                                    cache,
                                    orbflow_sink.as_deref(),
                                    &mut self.no_handler_bytes,
                                    stream,
                                    byte,
                                );
                            }
                        }
                        TpiuEvent::Error => self.tpiu_errors += 1,
                        _ => {}
                    }
                }
                for h in handlers.iter_mut() {
                    flush_handler(h, orbflow_sink.as_deref());
                }
            }
        }
    }

    fn flush_all(&mut self) {
        if let Mode::Tpiu {
            handlers,
            orbflow_sink,
            ..
        } = &mut self.mode
        {
            for h in handlers.iter_mut() {
                flush_handler(h, orbflow_sink.as_deref());
            }
        }
    }
}

/// Append one decoded byte to the handler serving `stream`, flushing
/// mid-block when its buffer is full. Streams nobody asked for are
/// dropped: this is a filter, not a validator.
fn steer(
    handlers: &mut [Handler],
    cache: &mut usize,
    orbflow: Option<&FanoutServer>,
    no_handler: &mut u64,
    stream: u8,
    byte: u8,
) {
    let i = if handlers.get(*cache).is_some_and(|h| h.channel == stream) {
        *cache
    } else if let Some(i) = handlers.iter().position(|h| h.channel == stream) {
        *cache = i;
        i
    } else {
        *no_handler += 1;
        trace!("No handler for stream {stream}");
        return;
    };
    let h = &mut handlers[i];
    if h.block.fill == TRANSFER_SIZE {
        flush_handler(h, orbflow);
    }
    h.block.buf[h.block.fill] = byte;
    h.block.fill += 1;
}

fn flush_handler(h: &mut Handler, orbflow: Option<&FanoutServer>) {
    if h.block.fill == 0 {
        return;
    }
    h.sink.send(h.block.bytes());
    if let Some(of) = orbflow {
        of.send(&orbflow::encode(h.channel, h.block.bytes()));
    }
    h.block.fill = 0;
}
