/*! TPIU formatted-mode decoder.

ARM CoreSight's Trace Port Interface Unit interleaves bytes from multiple
logical streams into 16-byte frames. Even-numbered bytes steal their low
bit: set, the byte introduces a new 7-bit stream id; clear, it is a data
byte whose true low bit arrives later in the auxiliary byte at position
15. Odd-numbered bytes (except the auxiliary byte) are always data for
the current stream.

The decoder is fed one byte at a time and buffers a whole frame before
emitting `(stream, byte)` tuples, since the auxiliary byte cannot be
applied earlier.
*/
use log::{debug, trace};

/// Wire size of one formatted frame.
pub const TPIU_FRAME_LEN: usize = 16;

/// Stream id carried by idle markers; contributes no data.
pub const TPIU_ID_IDLE: u8 = 0x7f;

/// The full-sync pattern `FF FF FF 7F`, as seen through a byte-wise
/// shift register.
const SYNC_PATTERN: u32 = 0xffff_ff7f;

/// `leds` bit: the last decoded frame carried data.
pub const LED_DATA: u8 = 0x01;
/// `leds` bit: tuples were handed to the caller.
pub const LED_TX: u8 = 0x02;
/// `leds` bit: a frame was lost to a mid-frame resync. Sticky.
pub const LED_OVERFLOW: u8 = 0x04;
/// `leds` bit: toggles on every decoded frame.
pub const LED_HEARTBEAT: u8 = 0x80;

/// Outcome of feeding one byte to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpiuEvent {
    /// Hunting for the sync pattern.
    Unsynced,
    /// A prefix of the sync pattern has been seen.
    Syncing,
    /// Synced, collecting frame bytes.
    Rxing,
    /// A frame completed; fetch it with [`TpiuDecoder::packet`].
    RxedPacket,
    /// Sync was lost mid-frame; the partial frame was discarded and the
    /// decoder has already resynchronised.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unsynced,
    Rxing,
}

/// TPIU frame decoder.
pub struct TpiuDecoder {
    state: State,
    sync_reg: u32,
    frame: [u8; TPIU_FRAME_LEN],
    count: usize,
    /// Current stream id. Persists across frames; idle until the first
    /// id byte is seen.
    stream: u8,
    packet: Vec<(u8, u8)>,
    total_frames: u64,
    lost_frames: u64,
    leds: u8,
}

impl Default for TpiuDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TpiuDecoder {
    /// Create an unsynced decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Unsynced,
            sync_reg: 0,
            frame: [0; TPIU_FRAME_LEN],
            count: 0,
            stream: TPIU_ID_IDLE,
            packet: Vec::with_capacity(TPIU_FRAME_LEN),
            total_frames: 0,
            lost_frames: 0,
            leds: 0,
        }
    }

    /// Frames decoded so far.
    #[must_use]
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Partial frames discarded at a mid-frame sync.
    #[must_use]
    pub fn lost_frames(&self) -> u64 {
        self.lost_frames
    }

    /// Bytes collected towards the frame in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.count
    }

    /// Status byte with the [`LED_DATA`], [`LED_TX`], [`LED_OVERFLOW`]
    /// and [`LED_HEARTBEAT`] bits. Purely informational.
    #[must_use]
    pub fn leds(&self) -> u8 {
        self.leds
    }

    /// The tuples of the most recently completed frame, in wire order.
    /// Valid after a [`TpiuEvent::RxedPacket`] until the next one.
    #[must_use]
    pub fn packet(&self) -> &[(u8, u8)] {
        &self.packet
    }

    /// Feed one byte.
    pub fn pump(&mut self, b: u8) -> TpiuEvent {
        self.sync_reg = (self.sync_reg << 8) | u32::from(b);
        if self.sync_reg == SYNC_PATTERN {
            // The pattern's own first three bytes were collected as
            // frame content; a clean frame-aligned sync leaves exactly
            // those behind.
            let mid_frame = self.state == State::Rxing && self.count != 3;
            self.state = State::Rxing;
            self.count = 0;
            if mid_frame {
                debug!("TPIU sync inside a frame, dropping partial");
                self.lost_frames += 1;
                self.leds |= LED_OVERFLOW;
                return TpiuEvent::Error;
            }
            return TpiuEvent::Rxing;
        }
        match self.state {
            State::Unsynced => {
                let r = self.sync_reg;
                if r & 0x00ff_ffff == 0x00ff_ffff
                    || r & 0xffff == 0xffff
                    || r & 0xff == 0xff
                {
                    TpiuEvent::Syncing
                } else {
                    TpiuEvent::Unsynced
                }
            }
            State::Rxing => {
                self.frame[self.count] = b;
                self.count += 1;
                if self.count == TPIU_FRAME_LEN {
                    self.count = 0;
                    self.decode_frame();
                    TpiuEvent::RxedPacket
                } else {
                    TpiuEvent::Rxing
                }
            }
        }
    }

    fn decode_frame(&mut self) {
        self.packet.clear();
        let aux = self.frame[TPIU_FRAME_LEN - 1];
        let mut stream = self.stream;
        for k in 0..8 {
            let a = self.frame[2 * k];
            if a & 1 != 0 {
                stream = a >> 1;
                trace!("TPIU stream now {stream:#04x}");
            } else if stream != TPIU_ID_IDLE {
                // The stolen low bit comes back via the auxiliary byte.
                self.packet.push((stream, (a & 0xfe) | ((aux >> k) & 1)));
            }
            if k < 7 && stream != TPIU_ID_IDLE {
                self.packet.push((stream, self.frame[2 * k + 1]));
            }
        }
        self.stream = stream;
        self.total_frames += 1;
        self.leds ^= LED_HEARTBEAT;
        if self.packet.is_empty() {
            self.leds &= !(LED_DATA | LED_TX);
        } else {
            self.leds |= LED_DATA | LED_TX;
        }
    }
}
