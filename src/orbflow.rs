/*! ORBFLOW framing.

A thin message layer on top of [COBS](crate::cobs): each frame decodes to
`tag ∥ payload ∥ checksum`, where the checksum byte is chosen so that the
wrapping 8-bit sum over the whole decoded content is zero. Frames are
stamped with the receive time; the wire carries no clock.
*/
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;

use crate::cobs::{self, CobsDecoder};

/// One received ORBFLOW frame.
///
/// `payload` borrows the decoder's reassembly buffer and is only valid
/// for the duration of the receive callback.
#[derive(Debug)]
pub struct OrbflowFrame<'a> {
    /// Channel tag.
    pub tag: u8,
    /// Receive timestamp, nanoseconds since the Unix epoch. One clock
    /// read per pumped input block, shared by every frame in it.
    pub tstamp: u64,
    /// Frame content between tag and checksum.
    pub payload: &'a [u8],
    /// Checksum byte as received.
    pub checksum: u8,
    /// True if the decoded content sums to zero.
    pub good: bool,
}

/// Encode one frame for channel `channel`.
///
/// The returned bytes are a complete COBS frame, terminator included.
#[must_use]
pub fn encode(channel: u8, payload: &[u8]) -> Vec<u8> {
    let sum = payload
        .iter()
        .fold(channel, |acc, &b| acc.wrapping_add(b));
    let checksum = 0u8.wrapping_sub(sum);
    cobs::encode(&[channel], payload, &[checksum])
}

/// Stateful ORBFLOW receiver.
pub struct OrbflowDecoder {
    cobs: CobsDecoder,
    frames: u64,
    bad_checksum: u64,
    short_frames: u64,
}

impl Default for OrbflowDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OrbflowDecoder {
    fn drop(&mut self) {
        info!(
            "ORBFLOW decoder: {} frames, {} bad checksums, {} short frames",
            self.frames, self.bad_checksum, self.short_frames
        );
    }
}

impl OrbflowDecoder {
    /// Create a decoder waiting at a frame boundary.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cobs: CobsDecoder::new(),
            frames: 0,
            bad_checksum: 0,
            short_frames: 0,
        }
    }

    /// Frames delivered with a good checksum.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Frames delivered with a checksum mismatch.
    #[must_use]
    pub fn bad_checksum(&self) -> u64 {
        self.bad_checksum
    }

    /// COBS frames too short to carry tag and checksum; dropped.
    #[must_use]
    pub fn short_frames(&self) -> u64 {
        self.short_frames
    }

    /// The COBS layer underneath, for its counters.
    #[must_use]
    pub fn cobs(&self) -> &CobsDecoder {
        &self.cobs
    }

    /// Pump one received block through the decoder, invoking `emit` for
    /// every complete frame. The timestamp is read once per call: all
    /// frames completed by this block share the block's arrival time.
    pub fn pump(&mut self, input: &[u8], emit: &mut dyn FnMut(&OrbflowFrame)) {
        let tstamp = wallclock_ns();
        let Self {
            cobs,
            frames,
            bad_checksum,
            short_frames,
        } = self;
        cobs.pump(input, &mut |decoded| {
            if decoded.len() < 2 {
                *short_frames += 1;
                return;
            }
            let sum = decoded.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            let good = sum == 0;
            if good {
                *frames += 1;
            } else {
                *bad_checksum += 1;
            }
            emit(&OrbflowFrame {
                tag: decoded[0],
                tstamp,
                payload: &decoded[1..decoded.len() - 1],
                checksum: decoded[decoded.len() - 1],
                good,
            });
        });
    }
}

fn wallclock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Got {
        tag: u8,
        tstamp: u64,
        payload: Vec<u8>,
        good: bool,
    }

    fn collect(dec: &mut OrbflowDecoder, input: &[u8]) -> Vec<Got> {
        let mut got = Vec::new();
        dec.pump(input, &mut |f| {
            got.push(Got {
                tag: f.tag,
                tstamp: f.tstamp,
                payload: f.payload.to_vec(),
                good: f.good,
            });
        });
        got
    }

    #[test]
    fn round_trip() {
        let mut dec = OrbflowDecoder::new();
        let got = collect(&mut dec, &encode(3, b"hi"));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].tag, 3);
        assert_eq!(got[0].payload, b"hi");
        assert!(got[0].good);
        assert!(got[0].tstamp > 0);
        assert_eq!(dec.frames(), 1);
    }

    #[test]
    fn checksum_on_the_wire() {
        // sum(3, 'h', 'i') == 212, so the balancing byte is 44.
        let enc = encode(3, b"hi");
        let mut cobs = crate::cobs::CobsDecoder::new();
        let mut decoded = Vec::new();
        cobs.pump(&enc, &mut |f| decoded = f.to_vec());
        assert_eq!(decoded, vec![3, b'h', b'i', 44]);
    }

    #[test]
    fn flipped_byte_is_bad() {
        let enc = encode(3, b"hi");
        let mut cobs = crate::cobs::CobsDecoder::new();
        let mut decoded = Vec::new();
        cobs.pump(&enc, &mut |f| decoded = f.to_vec());
        // Flip the last decoded byte and re-encode.
        let n = decoded.len();
        decoded[n - 1] ^= 0xa5;
        let reenc = crate::cobs::encode(&decoded, &[], &[]);

        let mut dec = OrbflowDecoder::new();
        let got = collect(&mut dec, &reenc);
        assert_eq!(got.len(), 1);
        assert!(!got[0].good);
        assert_eq!(dec.bad_checksum(), 1);
        assert_eq!(dec.frames(), 0);
    }

    #[test]
    fn every_single_byte_flip_is_caught() {
        let enc = encode(7, b"payload");
        let mut cobs = crate::cobs::CobsDecoder::new();
        let mut decoded = Vec::new();
        cobs.pump(&enc, &mut |f| decoded = f.to_vec());
        for i in 0..decoded.len() {
            for bit in 0..8 {
                let mut corrupt = decoded.clone();
                corrupt[i] ^= 1 << bit;
                let mut dec = OrbflowDecoder::new();
                let got = collect(&mut dec, &crate::cobs::encode(&corrupt, &[], &[]));
                assert_eq!(got.len(), 1);
                assert!(!got[0].good, "flip byte {i} bit {bit} not caught");
            }
        }
    }

    #[test]
    fn short_frame_dropped() {
        // A one byte COBS frame cannot carry tag plus checksum.
        let mut dec = OrbflowDecoder::new();
        let got = collect(&mut dec, &crate::cobs::encode(&[0x55], &[], &[]));
        assert!(got.is_empty());
        assert_eq!(dec.short_frames(), 1);
    }

    #[test]
    fn empty_payload() {
        let mut dec = OrbflowDecoder::new();
        let got = collect(&mut dec, &encode(9, &[]));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].tag, 9);
        assert!(got[0].payload.is_empty());
        assert!(got[0].good);
    }

    #[test]
    fn one_timestamp_per_block() {
        let mut input = encode(1, b"a");
        input.extend(encode(2, b"b"));
        let mut dec = OrbflowDecoder::new();
        let got = collect(&mut dec, &input);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].tstamp, got[1].tstamp);
    }
}
