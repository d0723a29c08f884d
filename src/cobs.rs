/*! COBS framing.

Consistent Overhead Byte Stuffing turns an arbitrary byte stream into a
sequence of frames delimited by a byte value that is guaranteed never to
appear inside a frame. If sync is lost, the decoder picks up again at the
next delimiter.

Based on *Consistent Overhead Byte Stuffing*, Cheshire & Baker, IEEE/ACM
Transactions on Networking, Vol. 7, No. 2, April 1999.
*/
use log::trace;

/// Frame delimiter. Encoded frame contents never contain this value.
pub const SYNC: u8 = 0;

/// Longest run of bytes between two overhead bytes.
const MAX_RUN: usize = 254;

/// Capacity of the decoder's reassembly buffer. A frame that decodes to
/// more than this is dropped and the stream resynchronised.
pub const MAX_FRAME_LEN: usize = 8192;

/// Is this byte an end-of-frame marker?
#[must_use]
pub fn is_eoframe(b: u8) -> bool {
    b == SYNC
}

/// Worst-case encoded length for `raw` decoded bytes: one leading run
/// length, one extra run length per 254 bytes, one terminating [`SYNC`].
#[must_use]
pub const fn max_encoded_len(raw: usize) -> usize {
    1 + raw + raw / MAX_RUN + 1
}

/// Encode one frame.
///
/// The decoded content of the returned frame is `front ∥ body ∥ back`,
/// and the frame is terminated by a single [`SYNC`]. Splitting the input
/// in three lets callers prepend a header and append a trailer without
/// assembling a contiguous buffer first.
#[must_use]
pub fn encode(front: &[u8], body: &[u8], back: &[u8]) -> Vec<u8> {
    let total = front.len() + body.len() + back.len();
    let mut out = Vec::with_capacity(max_encoded_len(total));
    // Position of the run length byte still to be filled in.
    let mut d = 0;
    out.push(SYNC);
    for &b in front.iter().chain(body).chain(back) {
        if out.len() - d == 0xff {
            // Run is full: close it without an implied SYNC.
            out[d] = (out.len() - d) as u8;
            d = out.len();
            out.push(SYNC);
        }
        if b == SYNC {
            out[d] = (out.len() - d) as u8;
            d = out.len();
        }
        // Data byte, or a SYNC standing in for the next run length.
        out.push(b);
    }
    out[d] = (out.len() - d) as u8;
    out.push(SYNC);
    out
}

#[derive(Clone, Copy)]
enum State {
    /// At a frame boundary, waiting for the first run length.
    Idle,
    /// Inside a frame. `run` counts down to the next run length byte.
    Rxing { run: u8, max_run: bool },
    /// Discarding a damaged or overlong frame until the next [`SYNC`].
    Flushing,
}

/// Stateful COBS decoder.
///
/// Feed it raw bytes with [`CobsDecoder::pump`]; every completed frame is
/// handed to the callback as a slice into the internal reassembly buffer,
/// valid only for the duration of the call. Framing does not have to line
/// up with `pump` boundaries.
pub struct CobsDecoder {
    state: State,
    frame: Vec<u8>,
    frames: u64,
    dropped: u64,
    resyncs: u64,
}

impl Default for CobsDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CobsDecoder {
    /// Create a decoder waiting at a frame boundary.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            frame: Vec::with_capacity(MAX_FRAME_LEN),
            frames: 0,
            dropped: 0,
            resyncs: 0,
        }
    }

    /// Completed frames delivered so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Frames dropped because they exceeded [`MAX_FRAME_LEN`].
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Damaged frames abandoned at an unexpected [`SYNC`].
    #[must_use]
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Pump a chunk of raw bytes through the decoder, invoking `emit`
    /// once per completed frame. Empty frames (successive [`SYNC`]
    /// bytes) are not emitted.
    pub fn pump(&mut self, input: &[u8], emit: &mut dyn FnMut(&[u8])) {
        for &b in input {
            self.pump_one(b, emit);
        }
    }

    fn pump_one(&mut self, b: u8, emit: &mut dyn FnMut(&[u8])) {
        match self.state {
            State::Idle => {
                if b != SYNC {
                    self.frame.clear();
                    self.state = State::Rxing {
                        run: b,
                        max_run: b == 0xff,
                    };
                }
            }
            State::Rxing { run, max_run } => {
                let run = run - 1;
                if run > 0 {
                    if b == SYNC {
                        // Delimiter inside a run: the frame is damaged,
                        // but the delimiter itself is the resync point.
                        trace!("COBS resync inside a run");
                        self.resyncs += 1;
                        self.frame.clear();
                        self.state = State::Idle;
                    } else if self.push(b) {
                        self.state = State::Rxing { run, max_run };
                    }
                } else if b == SYNC {
                    self.state = State::Idle;
                    if !self.frame.is_empty() {
                        self.frames += 1;
                        emit(&self.frame);
                        self.frame.clear();
                    }
                } else {
                    // `b` is the next run length. A run shorter than the
                    // maximum implies a SYNC in the decoded data.
                    if !max_run && !self.push(SYNC) {
                        return;
                    }
                    self.state = State::Rxing {
                        run: b,
                        max_run: b == 0xff,
                    };
                }
            }
            State::Flushing => {
                if b == SYNC {
                    self.state = State::Idle;
                }
            }
        }
    }

    /// Append to the reassembly buffer, discarding the frame if it is
    /// overlong. Returns false if the frame was dropped.
    fn push(&mut self, b: u8) -> bool {
        if self.frame.len() >= MAX_FRAME_LEN {
            self.dropped += 1;
            self.frame.clear();
            self.state = State::Flushing;
            false
        } else {
            self.frame.push(b);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(dec: &mut CobsDecoder, input: &[u8]) -> Vec<Vec<u8>> {
        let mut got = Vec::new();
        dec.pump(input, &mut |f| got.push(f.to_vec()));
        got
    }

    #[test]
    fn wire_exact() {
        assert_eq!(
            encode(&[], &[0x11, 0x22, 0x33, 0x44], &[]),
            vec![0x05, 0x11, 0x22, 0x33, 0x44, 0x00]
        );
        assert_eq!(encode(&[], &[0x00], &[]), vec![0x01, 0x01, 0x00]);
    }

    #[test]
    fn front_body_back() {
        let enc = encode(&[0x03], b"hello", &[0x99]);
        let mut dec = CobsDecoder::new();
        let got = collect(&mut dec, &enc);
        assert_eq!(got, vec![b"\x03hello\x99".to_vec()]);
        assert_eq!(dec.frames(), 1);
    }

    #[test]
    fn no_sync_inside_frame() {
        let mut body = vec![0u8; 600];
        for (i, b) in body.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        let enc = encode(&[7], &body, &[0, 0, 1]);
        assert!(!enc[..enc.len() - 1].contains(&SYNC));
        assert!(is_eoframe(*enc.last().unwrap()));
        assert!(enc.len() <= max_encoded_len(body.len() + 4));
    }

    #[test]
    fn long_runs_round_trip() {
        for n in [253, 254, 255, 508, 509] {
            let body: Vec<u8> = (0..n).map(|i| (i % 255) as u8 + 1).collect();
            let enc = encode(&[], &body, &[]);
            let mut dec = CobsDecoder::new();
            let got = collect(&mut dec, &enc);
            assert_eq!(got, vec![body], "length {n}");
        }
    }

    #[test]
    fn frame_split_across_reads() {
        // A 500 byte payload split at an arbitrary read boundary decodes
        // to exactly one frame.
        let body: Vec<u8> = (0..500u32).map(|i| (i % 250) as u8 + 1).collect();
        let enc = encode(&[], &body, &[]);
        let mut dec = CobsDecoder::new();
        let mut got = collect(&mut dec, &enc[..256]);
        assert!(got.is_empty());
        got.extend(collect(&mut dec, &enc[256..]));
        assert_eq!(got, vec![body]);
        assert_eq!(dec.frames(), 1);
    }

    #[test]
    fn successive_syncs_are_idempotent() {
        let mut dec = CobsDecoder::new();
        assert!(collect(&mut dec, &[0, 0, 0, 0]).is_empty());
        let got = collect(&mut dec, &encode(&[], &[1, 2], &[]));
        assert_eq!(got, vec![vec![1, 2]]);
    }

    #[test]
    fn resync_after_damage() {
        // Run length 5 promises four data bytes but a SYNC arrives early.
        let mut dec = CobsDecoder::new();
        assert!(collect(&mut dec, &[0x05, 0x41, 0x00]).is_empty());
        assert_eq!(dec.resyncs(), 1);
        // The decoder is back at a frame boundary.
        let got = collect(&mut dec, &encode(&[], &[9, 8, 7], &[]));
        assert_eq!(got, vec![vec![9, 8, 7]]);
    }

    #[test]
    fn overlong_frame_dropped() {
        let body = vec![0x42u8; MAX_FRAME_LEN + 10];
        let enc = encode(&[], &body, &[]);
        let mut dec = CobsDecoder::new();
        assert!(collect(&mut dec, &enc).is_empty());
        assert_eq!(dec.dropped(), 1);
        assert_eq!(dec.frames(), 0);
        // Stream recovers at the frame boundary.
        let got = collect(&mut dec, &encode(&[], &[1], &[]));
        assert_eq!(got, vec![vec![1]]);
    }

    #[test]
    fn eoframe_is_sync_only() {
        for b in 0..=255u8 {
            assert_eq!(is_eoframe(b), b == SYNC);
        }
    }
}
