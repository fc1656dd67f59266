// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reassembly of notification fragments into frames.
//!
//! Notifications carry no framing of their own: a frame may be split across
//! several of them, several frames may share one, and junk left over from a
//! corrupted frame may precede the next sync pattern.

use tracing::{debug, warn};

use super::frame::{Frame, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, LENGTH_FIELD_SIZE, SYNC};
use crate::error::ProtocolError;

const PREFIX_SIZE: usize = 2 + LENGTH_FIELD_SIZE;

/// Accumulates inbound bytes and cuts complete frames out of them.
pub struct FrameReassembler {
    buffer: Vec<u8>,
    max_payload: usize,
    protocol_errors: u64,
    discarded_bytes: u64,
    last_error: Option<ProtocolError>,
}

impl FrameReassembler {
    /// Create a reassembler accepting payloads up to [`DEFAULT_MAX_PAYLOAD`].
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        // The length field is a u16 covering header and payload.
        let max_payload = max_payload.min(u16::MAX as usize - HEADER_SIZE);
        Self {
            buffer: Vec::with_capacity(PREFIX_SIZE + HEADER_SIZE + max_payload),
            max_payload,
            protocol_errors: 0,
            discarded_bytes: 0,
            last_error: None,
        }
    }

    /// Append `data` and return the frames it completes.
    ///
    /// Frames are cut lazily as the returned iterator is consumed. Bytes that
    /// do not yet form a complete frame stay buffered for the next call.
    pub fn feed(&mut self, data: &[u8]) -> Feed<'_> {
        self.buffer.extend_from_slice(data);
        Feed { reassembler: self }
    }

    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.buffer.windows(SYNC.len()).position(|w| w == SYNC) {
                Some(0) => {}
                Some(pos) => self.discard(pos),
                None => {
                    // A trailing 0xFF may be the first half of the next sync.
                    let keep = usize::from(self.buffer.last() == Some(&SYNC[0]));
                    self.discard(self.buffer.len() - keep);
                    return None;
                }
            }

            if self.buffer.len() < PREFIX_SIZE {
                return None;
            }

            let length = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
            let max = HEADER_SIZE + self.max_payload;
            if !(HEADER_SIZE..=max).contains(&length) {
                let err = ProtocolError::LengthOutOfRange {
                    declared: length,
                    min: HEADER_SIZE,
                    max,
                };
                warn!("Dropping sync point: {}", err);
                self.protocol_errors += 1;
                self.last_error = Some(err);
                // Skip only the 0xFF so a sync hidden inside the bogus
                // header is still found.
                self.discard(1);
                continue;
            }

            let total = PREFIX_SIZE + length;
            if self.buffer.len() < total {
                return None;
            }

            if !self.ends_on_boundary(total) && self.has_inner_sync(total) {
                let err = ProtocolError::MisalignedFrame { declared: length };
                warn!("Dropping sync point: {}", err);
                self.protocol_errors += 1;
                self.last_error = Some(err);
                self.discard(1);
                continue;
            }

            let frame = Frame::from_body(&self.buffer[PREFIX_SIZE..total]);
            self.buffer.drain(..total);
            debug!("Frame reassembled: {}", frame);
            return Some(frame);
        }
    }

    /// Whether the bytes buffered after a candidate ending at `end` could
    /// start the next frame. Nothing buffered yet counts as a boundary.
    fn ends_on_boundary(&self, end: usize) -> bool {
        let rest = &self.buffer[end..];
        let n = rest.len().min(SYNC.len());
        rest[..n] == SYNC[..n]
    }

    /// Whether a sync with a plausible length starts inside the candidate
    /// spanning `..end`, i.e. the candidate is a truncated frame that ran
    /// into the next one.
    fn has_inner_sync(&self, end: usize) -> bool {
        let max = HEADER_SIZE + self.max_payload;
        (1..end).any(|pos| {
            self.buffer[pos..].starts_with(&SYNC)
                && self
                    .declared_length(pos)
                    .is_some_and(|length| (HEADER_SIZE..=max).contains(&length))
        })
    }

    /// Length field of the sync point at `pos`, if both bytes are buffered.
    fn declared_length(&self, pos: usize) -> Option<usize> {
        let field = self.buffer.get(pos + SYNC.len()..pos + PREFIX_SIZE)?;
        Some(u16::from_le_bytes([field[0], field[1]]) as usize)
    }

    fn discard(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        debug!(
            "Discarding {} unsynchronised bytes: {}",
            count,
            hex::encode(&self.buffer[..count])
        );
        self.buffer.drain(..count);
        self.discarded_bytes += count as u64;
    }

    /// Drop everything buffered.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Sync points dropped because of an impossible length or a frame that
    /// overran into the next one.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors
    }

    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    pub fn last_error(&self) -> Option<&ProtocolError> {
        self.last_error.as_ref()
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames completed by one [`FrameReassembler::feed`] call.
pub struct Feed<'a> {
    reassembler: &'a mut FrameReassembler,
}

impl Iterator for Feed<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.reassembler.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISTANCE_REPLY: [u8; 13] = [
        0xFF, 0x55, 0x09, 0x00, 0x02, 0x08, 0x07, 0x02, 0x00, 0x00, 0x00, 0xC8, 0x41,
    ];

    fn frame_a() -> Frame {
        Frame::new(0x02, 0x08, 0x07, vec![0x02, 0x00, 0x00, 0x00, 0xC8, 0x41])
    }

    fn frame_b() -> Frame {
        Frame::new(0x01, 0x03, 0x00, vec![0x2A])
    }

    #[test]
    fn test_single_frame() {
        let mut reassembler = FrameReassembler::new();
        let frames: Vec<_> = reassembler.feed(&DISTANCE_REPLY).collect();

        assert_eq!(frames, vec![frame_a()]);
        assert_eq!(reassembler.buffer_size(), 0);
    }

    #[test]
    fn test_split_after_sync() {
        let mut reassembler = FrameReassembler::new();

        assert_eq!(reassembler.feed(&DISTANCE_REPLY[..2]).count(), 0);
        assert_eq!(reassembler.buffer_size(), 2);

        let frames: Vec<_> = reassembler.feed(&DISTANCE_REPLY[2..]).collect();
        assert_eq!(frames, vec![frame_a()]);
    }

    #[test]
    fn test_every_split_point() {
        for split in 0..=DISTANCE_REPLY.len() {
            let mut reassembler = FrameReassembler::new();
            let mut frames: Vec<_> = reassembler.feed(&DISTANCE_REPLY[..split]).collect();
            frames.extend(reassembler.feed(&DISTANCE_REPLY[split..]));

            assert_eq!(frames, vec![frame_a()], "split at {}", split);
            assert_eq!(reassembler.buffer_size(), 0);
        }
    }

    #[test]
    fn test_byte_by_byte() {
        let mut reassembler = FrameReassembler::new();
        let mut frames = Vec::new();
        for byte in DISTANCE_REPLY {
            frames.extend(reassembler.feed(&[byte]));
        }
        assert_eq!(frames, vec![frame_a()]);
    }

    #[test]
    fn test_concatenated_frames() {
        let mut stream = DISTANCE_REPLY.to_vec();
        stream.extend(frame_b().encode().unwrap());

        let mut reassembler = FrameReassembler::new();
        let frames: Vec<_> = reassembler.feed(&stream).collect();
        assert_eq!(frames, vec![frame_a(), frame_b()]);
    }

    #[test]
    fn test_garbage_between_frames_any_split() {
        let mut stream = vec![0x13, 0x37, 0x55, 0xFF];
        stream.extend_from_slice(&DISTANCE_REPLY);
        stream.extend_from_slice(&[0x00, 0xFF, 0x00, 0x55, 0xAB]);
        stream.extend(frame_b().encode().unwrap());

        for first in 0..stream.len() {
            for second in first..stream.len() {
                let mut reassembler = FrameReassembler::new();
                let mut frames: Vec<_> = reassembler.feed(&stream[..first]).collect();
                frames.extend(reassembler.feed(&stream[first..second]));
                frames.extend(reassembler.feed(&stream[second..]));

                assert_eq!(
                    frames,
                    vec![frame_a(), frame_b()],
                    "splits at {} and {}",
                    first,
                    second
                );
            }
        }
    }

    #[test]
    fn test_leading_junk_discarded() {
        let mut stream = vec![0x41, 0xC8, 0x00];
        stream.extend_from_slice(&DISTANCE_REPLY);

        let mut reassembler = FrameReassembler::new();
        let frames: Vec<_> = reassembler.feed(&stream).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(reassembler.discarded_bytes(), 3);
        assert_eq!(reassembler.protocol_errors(), 0);
    }

    #[test]
    fn test_junk_without_sync_keeps_trailing_ff() {
        let mut reassembler = FrameReassembler::new();
        assert_eq!(reassembler.feed(&[0x01, 0x02, 0x03, 0xFF]).count(), 0);
        assert_eq!(reassembler.buffer_size(), 1);

        let frames: Vec<_> = reassembler.feed(&DISTANCE_REPLY[1..]).collect();
        assert_eq!(frames, vec![frame_a()]);
    }

    #[test]
    fn test_length_out_of_range_resyncs() {
        // Length 0x4000 can never complete; the reassembler must not wait
        // for it and must still find the real frame behind it.
        let mut stream = vec![0xFF, 0x55, 0x00, 0x40, 0x01];
        stream.extend_from_slice(&DISTANCE_REPLY);

        let mut reassembler = FrameReassembler::new();
        let frames: Vec<_> = reassembler.feed(&stream).collect();

        assert_eq!(frames, vec![frame_a()]);
        assert_eq!(reassembler.protocol_errors(), 1);
        assert!(matches!(
            reassembler.last_error(),
            Some(ProtocolError::LengthOutOfRange { declared: 0x4000, .. })
        ));
    }

    #[test]
    fn test_length_below_header_rejected() {
        let mut stream = vec![0xFF, 0x55, 0x02, 0x00];
        stream.extend_from_slice(&DISTANCE_REPLY);

        let mut reassembler = FrameReassembler::new();
        let frames: Vec<_> = reassembler.feed(&stream).collect();
        assert_eq!(frames, vec![frame_a()]);
        assert_eq!(reassembler.protocol_errors(), 1);
    }

    #[test]
    fn test_truncated_frame_does_not_swallow_next() {
        // A reply cut off after six bytes, then the full reply.
        let mut stream = DISTANCE_REPLY[..6].to_vec();
        stream.extend_from_slice(&DISTANCE_REPLY);

        let mut reassembler = FrameReassembler::new();
        let frames: Vec<_> = reassembler.feed(&stream).collect();
        assert_eq!(frames, vec![frame_a()]);
        assert_eq!(reassembler.buffer_size(), 0);
        assert_eq!(reassembler.protocol_errors(), 1);
        assert_eq!(
            reassembler.last_error(),
            Some(&ProtocolError::MisalignedFrame { declared: 9 })
        );

        // Same stream, truncated part and full reply in separate notifications.
        let mut reassembler = FrameReassembler::new();
        assert_eq!(reassembler.feed(&DISTANCE_REPLY[..6]).count(), 0);
        let frames: Vec<_> = reassembler.feed(&DISTANCE_REPLY).collect();
        assert_eq!(frames, vec![frame_a()]);
    }

    #[test]
    fn test_sync_bytes_inside_payload() {
        // FF 55 in a payload is only suspicious when the frame is not
        // followed by another sync.
        let inner = Frame::new(0x04, 0x00, 0x00, vec![0xFF, 0x55, 0x01, 0x00]);
        let mut stream = inner.encode().unwrap();
        stream.extend_from_slice(&DISTANCE_REPLY);

        let mut reassembler = FrameReassembler::new();
        let frames: Vec<_> = reassembler.feed(&stream).collect();
        assert_eq!(frames, vec![inner, frame_a()]);
        assert_eq!(reassembler.protocol_errors(), 0);
    }

    #[test]
    fn test_huge_ceiling_is_clamped() {
        let mut reassembler = FrameReassembler::with_max_payload(usize::MAX);
        let frames: Vec<_> = reassembler.feed(&DISTANCE_REPLY).collect();
        assert_eq!(frames, vec![frame_a()]);

        // The largest length the field can carry is accepted and waited on.
        let mut stream = vec![0xFF, 0x55, 0xFF, 0xFF];
        stream.extend_from_slice(&DISTANCE_REPLY);
        assert_eq!(reassembler.feed(&stream).count(), 0);
        assert_eq!(reassembler.buffer_size(), stream.len());
        assert_eq!(reassembler.protocol_errors(), 0);
    }

    #[test]
    fn test_custom_ceiling() {
        let big = Frame::new(0x04, 0x00, 0x00, vec![b'x'; 40]);
        let bytes = big.encode_with_limit(64).unwrap();

        let mut reassembler = FrameReassembler::with_max_payload(32);
        assert_eq!(reassembler.feed(&bytes).count(), 0);
        assert_eq!(reassembler.protocol_errors(), 1);

        let mut reassembler = FrameReassembler::with_max_payload(64);
        assert_eq!(reassembler.feed(&bytes).collect::<Vec<_>>(), vec![big]);
    }

    #[test]
    fn test_reset() {
        let mut reassembler = FrameReassembler::new();
        assert_eq!(reassembler.feed(&DISTANCE_REPLY[..6]).count(), 0);
        reassembler.reset();
        assert_eq!(reassembler.buffer_size(), 0);

        // The tail of the old frame is junk now.
        assert_eq!(reassembler.feed(&DISTANCE_REPLY[6..]).count(), 0);
        assert_eq!(reassembler.feed(&DISTANCE_REPLY).count(), 1);
    }
}
