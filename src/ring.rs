/*! Transfer block ring.

A small single-producer single-consumer ring of fixed-size byte blocks
between the source thread and the distributor. The producer copies each
read into the write slot and signals a condition variable; the consumer
waits with a bounded timeout so it can keep polling the cancel flag.

The ring is not lossless: when the consumer falls behind, newly produced
blocks are dropped and counted rather than overwriting data in flight.
*/
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Capacity of one transfer block.
pub const TRANSFER_SIZE: usize = 4096;

/// Number of blocks in the ring.
pub const NUM_RAW_BLOCKS: usize = 10;

/// One transfer block: a fixed buffer plus its fill level.
pub struct DataBlock {
    /// Block storage; only the first `fill` bytes are meaningful.
    pub buf: [u8; TRANSFER_SIZE],
    /// Number of valid bytes in `buf`.
    pub fill: usize,
}

impl Default for DataBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl DataBlock {
    /// Create an empty block.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: [0; TRANSFER_SIZE],
            fill: 0,
        }
    }

    /// The valid bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.fill]
    }
}

struct RingState {
    blocks: Vec<DataBlock>,
    wp: usize,
    rp: usize,
    closed: bool,
    dropped: u64,
}

/// Outcome of a consume attempt.
pub enum Consume {
    /// A block was swapped into the caller's buffer.
    Taken,
    /// Nothing arrived within the timeout.
    Empty,
    /// The ring is closed and fully drained.
    Closed,
}

/// The ring itself. One slot is kept free to distinguish full from
/// empty, so `NUM_RAW_BLOCKS - 1` blocks can be in flight.
pub struct BlockRing {
    state: Mutex<RingState>,
    readable: Condvar,
}

impl Default for BlockRing {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockRing {
    /// Create an empty ring.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RingState {
                blocks: (0..NUM_RAW_BLOCKS).map(|_| DataBlock::new()).collect(),
                wp: 0,
                rp: 0,
                closed: false,
                dropped: 0,
            }),
            readable: Condvar::new(),
        }
    }

    /// Copy `data` into the write slot and advance. Returns false if the
    /// ring was full and the block was dropped (counted), or closed.
    pub fn produce(&self, data: &[u8]) -> bool {
        debug_assert!(data.len() <= TRANSFER_SIZE);
        let mut s = self.state.lock().expect("ring mutex poisoned");
        if s.closed {
            return false;
        }
        if (s.wp + 1) % NUM_RAW_BLOCKS == s.rp {
            s.dropped += 1;
            return false;
        }
        let wp = s.wp;
        let block = &mut s.blocks[wp];
        block.buf[..data.len()].copy_from_slice(data);
        block.fill = data.len();
        s.wp = (wp + 1) % NUM_RAW_BLOCKS;
        drop(s);
        self.readable.notify_one();
        true
    }

    /// Wait up to `timeout` for a block, swapping it into `out` on
    /// success. A closed ring still hands out whatever is left in it.
    pub fn consume_into(&self, out: &mut DataBlock, timeout: Duration) -> Consume {
        let mut s = self.state.lock().expect("ring mutex poisoned");
        while s.wp == s.rp {
            if s.closed {
                return Consume::Closed;
            }
            let (ns, res) = self
                .readable
                .wait_timeout(s, timeout)
                .expect("ring mutex poisoned");
            s = ns;
            if res.timed_out() && s.wp == s.rp {
                return if s.closed { Consume::Closed } else { Consume::Empty };
            }
        }
        let rp = s.rp;
        std::mem::swap(out, &mut s.blocks[rp]);
        s.rp = (rp + 1) % NUM_RAW_BLOCKS;
        Consume::Taken
    }

    /// Close the ring. The producer stops feeding it; the consumer
    /// drains what is left and then sees [`Consume::Closed`].
    pub fn close(&self) {
        let mut s = self.state.lock().expect("ring mutex poisoned");
        s.closed = true;
        drop(s);
        self.readable.notify_all();
    }

    /// Blocks dropped because the consumer had fallen behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.state.lock().expect("ring mutex poisoned").dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const SHORT: Duration = Duration::from_millis(10);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn fifo_order() {
        let ring = BlockRing::new();
        assert!(ring.produce(&[1, 2, 3]));
        assert!(ring.produce(&[4, 5]));
        let mut b = DataBlock::new();
        assert!(matches!(ring.consume_into(&mut b, SHORT), Consume::Taken));
        assert_eq!(b.bytes(), &[1, 2, 3]);
        assert!(matches!(ring.consume_into(&mut b, SHORT), Consume::Taken));
        assert_eq!(b.bytes(), &[4, 5]);
        assert!(matches!(ring.consume_into(&mut b, SHORT), Consume::Empty));
    }

    #[test]
    fn drops_newest_when_full() {
        let ring = BlockRing::new();
        for i in 0..NUM_RAW_BLOCKS - 1 {
            assert!(ring.produce(&[i as u8]), "slot {i}");
        }
        assert!(!ring.produce(&[0xff]));
        assert_eq!(ring.dropped(), 1);
        // The consumer still sees the older blocks, in order.
        let mut b = DataBlock::new();
        for i in 0..NUM_RAW_BLOCKS - 1 {
            assert!(matches!(ring.consume_into(&mut b, SHORT), Consume::Taken));
            assert_eq!(b.bytes(), &[i as u8]);
        }
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let ring = BlockRing::new();
        assert!(ring.produce(&[9]));
        ring.close();
        assert!(!ring.produce(&[10]));
        let mut b = DataBlock::new();
        assert!(matches!(ring.consume_into(&mut b, SHORT), Consume::Taken));
        assert_eq!(b.bytes(), &[9]);
        assert!(matches!(ring.consume_into(&mut b, SHORT), Consume::Closed));
    }

    #[test]
    fn cross_thread_handoff() {
        let ring = Arc::new(BlockRing::new());
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                for i in 0..100u32 {
                    // Spin until there is room; the consumer is live.
                    while !ring.produce(&i.to_le_bytes()) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                ring.close();
            })
        };
        let mut got = Vec::new();
        let mut b = DataBlock::new();
        loop {
            match ring.consume_into(&mut b, LONG) {
                Consume::Taken => {
                    got.push(u32::from_le_bytes(b.bytes().try_into().unwrap()))
                }
                Consume::Empty => {}
                Consume::Closed => break,
            }
        }
        producer.join().unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }
}
