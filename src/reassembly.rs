// ble-bridge Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Ring-buffered reassembly of the length-prefixed vendor packet stream.
//!
//! Notification chunks arrive in arbitrary sizes: a single vendor packet may
//! span several notifies, and a single notify may carry several concatenated
//! packets. The [`PacketReassembler`] buffers the raw bytes in a fixed ring
//! and parses out whole frames, resynchronizing one byte at a time when the
//! read cursor is not on a valid header. Advancing exactly one byte
//! maximizes the chance of landing on a true header without risking loss of
//! a legitimate frame still in flight.

use std::time::{Duration, Instant};

/// First byte of every vendor packet header.
pub const PACKET_PREFIX: u8 = 0xA7;
/// Transport tag for packets that traveled over Bluetooth.
pub const TRANSPORT_BLE: u8 = 0xB3;
/// Transport tag for packets that traveled over USB.
pub const TRANSPORT_USB: u8 = 0xE6;
/// Fixed header size preceding the payload.
pub const HEADER_LEN: usize = 8;
/// Upper bound on a whole frame (header + payload).
pub const MAX_PACKET_LEN: usize = 512;
/// Capacity of the reassembly ring.
pub const RING_CAPACITY: usize = 64 * 1024;

/// Payload tail emitted by the reader firmware when it aborts an operation.
const ABORT_SIGNATURE: [u8; 8] = [0x40, 0x03, 0xBF, 0xFC, 0xBF, 0xFC, 0xBF, 0xFC];

/// Payloads at or below this length are command responses, which cannot be
/// fragmented; an embedded header inside one means the frame is corrupt.
const COMMAND_RESPONSE_MAX_PAYLOAD: usize = 12;

/// Per-drain bounds keeping the event loop responsive under inventory-rate
/// traffic.
const MAX_FRAMES_PER_DRAIN: usize = 50;
const DRAIN_TIME_BUDGET: Duration = Duration::from_millis(10);

/// Fixed-capacity circular byte buffer with independent read/write cursors.
///
/// Cursors are absolute and monotonic; the index into the backing storage
/// is the cursor modulo capacity. The write cursor never overtakes the
/// read cursor: a chunk that does not fit is rejected whole, because a
/// partial write would desynchronize framing.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    read: u64,
    write: u64,
}

impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        RingBuffer {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes available to read.
    pub fn available(&self) -> usize {
        (self.write - self.read) as usize
    }

    /// Free space for writing.
    pub fn space(&self) -> usize {
        self.capacity() - self.available()
    }

    fn index(&self, cursor: u64) -> usize {
        (cursor % self.capacity() as u64) as usize
    }

    /// Append `chunk`, or return `false` without touching either cursor if
    /// it does not fit.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        if chunk.len() > self.space() {
            return false;
        }
        for &byte in chunk {
            let idx = self.index(self.write);
            self.buf[idx] = byte;
            self.write += 1;
        }
        true
    }

    /// Byte at `offset` past the read cursor. Caller must ensure
    /// `offset < available()`.
    fn peek(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.available());
        self.buf[self.index(self.read + offset as u64)]
    }

    /// Copy `len` bytes starting at the read cursor into a contiguous
    /// vector without consuming them.
    fn copy_out(&self, len: usize) -> Vec<u8> {
        debug_assert!(len <= self.available());
        let mut out = Vec::with_capacity(len);
        for offset in 0..len {
            out.push(self.peek(offset));
        }
        out
    }

    fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.read += n as u64;
    }

    fn rewind(&mut self, n: usize) {
        debug_assert!(self.read >= n as u64);
        self.read -= n as u64;
    }
}

/// One batch of parsing work.
#[derive(Debug, Default)]
pub struct Drain {
    /// Whole frames, in stream order.
    pub frames: Vec<Vec<u8>>,
    /// Frames in this batch whose payload tail carried the firmware abort
    /// signature. Those frames are still present in `frames`.
    pub firmware_aborts: u32,
    /// `false` when the batch stopped at a per-drain bound with parseable
    /// bytes left; the caller should yield and drain again.
    pub exhausted: bool,
}

/// Stateful parser turning a notify byte stream into whole vendor frames.
#[derive(Debug)]
pub struct PacketReassembler {
    ring: RingBuffer,
    frames_emitted: u64,
    chunks_dropped: u64,
    resyncs: u64,
    window_start: Instant,
    window_frames: u32,
    packets_per_second: u32,
}

impl Default for PacketReassembler {
    fn default() -> Self {
        Self::with_capacity(RING_CAPACITY)
    }
}

impl PacketReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        PacketReassembler {
            ring: RingBuffer::with_capacity(capacity),
            frames_emitted: 0,
            chunks_dropped: 0,
            resyncs: 0,
            window_start: Instant::now(),
            window_frames: 0,
            packets_per_second: 0,
        }
    }

    /// Admit one raw notify chunk. Returns `false` when the chunk was
    /// dropped whole because the ring could not hold it.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> bool {
        if self.ring.push(chunk) {
            true
        } else {
            self.chunks_dropped += 1;
            false
        }
    }

    /// Parse out as many whole frames as the per-drain bounds allow.
    pub fn drain(&mut self) -> Drain {
        let started = Instant::now();
        let mut out = Drain {
            exhausted: true,
            ..Drain::default()
        };

        loop {
            if out.frames.len() >= MAX_FRAMES_PER_DRAIN
                || started.elapsed() >= DRAIN_TIME_BUDGET
            {
                // Leave the rest for the next drain so the event loop
                // stays responsive.
                out.exhausted = self.ring.available() < 3;
                break;
            }

            if self.ring.available() < 3 {
                break;
            }

            let b0 = self.ring.peek(0);
            let b1 = self.ring.peek(1);
            if b0 != PACKET_PREFIX || (b1 != TRANSPORT_BLE && b1 != TRANSPORT_USB) {
                self.resync();
                continue;
            }

            let payload_len = self.ring.peek(2) as usize;
            let total = HEADER_LEN + payload_len;
            if total > MAX_PACKET_LEN {
                // False header; a real length byte can never produce an
                // oversize frame.
                self.resync();
                continue;
            }

            if self.ring.available() < total {
                break;
            }

            let frame = self.ring.copy_out(total);
            self.ring.advance(total);

            if payload_len <= COMMAND_RESPONSE_MAX_PAYLOAD {
                if let Some(embedded) = find_embedded_header(&frame) {
                    // The command response swallowed the start of the next
                    // packet. Discard everything before the embedded header
                    // and resume parsing from it.
                    log::warn!(
                        "corrupt command response: embedded header at offset {} of {}-byte frame",
                        embedded,
                        total
                    );
                    self.ring.rewind(total - embedded);
                    continue;
                }
            }

            if payload_len >= ABORT_SIGNATURE.len()
                && frame[total - ABORT_SIGNATURE.len()..] == ABORT_SIGNATURE
            {
                out.firmware_aborts += 1;
            }

            self.frames_emitted += 1;
            self.window_frames += 1;
            out.frames.push(frame);
        }

        if self.window_start.elapsed() >= Duration::from_secs(1) {
            self.packets_per_second = self.window_frames;
            self.window_frames = 0;
            self.window_start = Instant::now();
        }

        out
    }

    fn resync(&mut self) {
        log::trace!(
            "reassembly out of sync at byte {:#04x}, advancing one byte",
            self.ring.peek(0)
        );
        self.ring.advance(1);
        self.resyncs += 1;
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Frame rate over the most recently completed one-second window.
    pub fn packets_per_second(&self) -> u32 {
        self.packets_per_second
    }

    pub fn buffered(&self) -> usize {
        self.ring.available()
    }
}

/// Scan a short command-response frame for an `A7 B3 ?? C2` header embedded
/// in its payload, past the real header and clear of the trailing status
/// bytes. Returns the offset of the embedded header.
fn find_embedded_header(frame: &[u8]) -> Option<usize> {
    let total = frame.len();
    if total < HEADER_LEN + 4 {
        return None;
    }
    for offset in HEADER_LEN..=(total - 4) {
        if frame[offset] == PACKET_PREFIX
            && frame[offset + 1] == TRANSPORT_BLE
            && frame[offset + 3] == 0xC2
        {
            return Some(offset);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![PACKET_PREFIX, tag, payload.len() as u8, 0, 0, 0, 0, 0];
        f.extend_from_slice(payload);
        f
    }

    #[test]
    fn two_concatenated_frames_in_one_chunk() {
        let mut reasm = PacketReassembler::new();
        let chunk = [
            0xA7, 0xB3, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, // 10 bytes
            0xA7, 0xB3, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, // 9 bytes
        ];
        assert!(reasm.push_chunk(&chunk));
        let out = reasm.drain();
        assert!(out.exhausted);
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.frames[0].len(), 10);
        assert_eq!(out.frames[1].len(), 9);
        assert_eq!(out.frames[0], chunk[..10].to_vec());
        assert_eq!(out.frames[1], chunk[10..].to_vec());
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut reasm = PacketReassembler::new();
        let whole = frame(TRANSPORT_BLE, &[0xAA, 0xBB, 0xCC, 0xDD]);
        for piece in whole.chunks(3) {
            assert!(reasm.push_chunk(piece));
        }
        // Only the final chunk completes the frame.
        let out = reasm.drain();
        assert_eq!(out.frames, vec![whole]);
    }

    #[test]
    fn incomplete_frame_waits_for_more_bytes() {
        let mut reasm = PacketReassembler::new();
        let whole = frame(TRANSPORT_USB, &[1, 2, 3]);
        assert!(reasm.push_chunk(&whole[..5]));
        assert!(reasm.drain().frames.is_empty());
        assert!(reasm.push_chunk(&whole[5..]));
        assert_eq!(reasm.drain().frames, vec![whole]);
    }

    #[test]
    fn resynchronizes_past_garbage_one_byte_at_a_time() {
        let mut reasm = PacketReassembler::new();
        let whole = frame(TRANSPORT_BLE, &[0x42]);
        let mut chunk = vec![0x00, 0xA7, 0x00, 0xFF]; // garbage incl. a lone prefix byte
        chunk.extend_from_slice(&whole);
        assert!(reasm.push_chunk(&chunk));
        let out = reasm.drain();
        assert_eq!(out.frames, vec![whole]);
        assert_eq!(reasm.resyncs(), 4);
    }

    #[test]
    fn prefix_with_bad_tag_is_a_false_header() {
        let mut reasm = PacketReassembler::new();
        let whole = frame(TRANSPORT_BLE, &[7]);
        let mut chunk = vec![PACKET_PREFIX, 0x00];
        chunk.extend_from_slice(&whole);
        assert!(reasm.push_chunk(&chunk));
        let out = reasm.drain();
        assert_eq!(out.frames, vec![whole]);
    }

    #[test]
    fn overflow_chunk_is_dropped_whole() {
        let mut reasm = PacketReassembler::with_capacity(16);
        let first = frame(TRANSPORT_BLE, &[1, 2]); // 10 bytes
        assert!(reasm.push_chunk(&first));
        let big = [0u8; 8];
        assert!(!reasm.push_chunk(&big)); // 10 + 8 > 16
        assert_eq!(reasm.chunks_dropped(), 1);
        // The buffered frame is intact; the cursors did not move.
        let out = reasm.drain();
        assert_eq!(out.frames, vec![first]);
    }

    #[test]
    fn ring_wraps_across_capacity_boundary() {
        let mut reasm = PacketReassembler::with_capacity(32);
        let a = frame(TRANSPORT_BLE, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]); // 20 bytes
        assert!(reasm.push_chunk(&a));
        assert_eq!(reasm.drain().frames, vec![a]);
        // Read/write cursors now sit at 20; the next frame wraps.
        let b = frame(TRANSPORT_USB, &[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04]); // 16 bytes
        assert!(reasm.push_chunk(&b));
        assert_eq!(reasm.drain().frames, vec![b]);
    }

    #[test]
    fn embedded_header_rewinds_into_next_frame() {
        let mut reasm = PacketReassembler::new();
        // A short "command response" whose payload contains the start of
        // the next packet: the framer must discard the corrupt prefix and
        // re-parse from the embedded header.
        let inner = [
            0xA7, 0xB3, 0x02, 0xC2, 0x00, 0x00, 0x00, 0x00, 0x11, 0x22,
        ];
        let mut corrupt = vec![PACKET_PREFIX, TRANSPORT_BLE, 0x0A, 0, 0, 0, 0, 0];
        corrupt.extend_from_slice(&inner); // payload_len 10 <= 12, total 18
        assert!(reasm.push_chunk(&corrupt));
        let out = reasm.drain();
        assert_eq!(out.frames, vec![inner.to_vec()]);
    }

    #[test]
    fn long_frames_skip_embedded_header_scan() {
        let mut reasm = PacketReassembler::new();
        // payload_len 13 > 12: an A7 B3 ?? C2 pattern in the payload is
        // legitimate data for inventory-class packets.
        let payload = [
            0xA7, 0xB3, 0x00, 0xC2, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
        ];
        let whole = frame(TRANSPORT_BLE, &payload);
        assert!(reasm.push_chunk(&whole));
        assert_eq!(reasm.drain().frames, vec![whole]);
    }

    #[test]
    fn firmware_abort_signature_is_flagged_and_frame_still_emitted() {
        let mut reasm = PacketReassembler::new();
        let mut payload = vec![0x01, 0x02];
        payload.extend_from_slice(&[0x40, 0x03, 0xBF, 0xFC, 0xBF, 0xFC, 0xBF, 0xFC]);
        let whole = frame(TRANSPORT_BLE, &payload);
        assert!(reasm.push_chunk(&whole));
        let out = reasm.drain();
        assert_eq!(out.firmware_aborts, 1);
        assert_eq!(out.frames, vec![whole]);
    }

    #[test]
    fn drain_is_bounded_per_invocation() {
        let mut reasm = PacketReassembler::new();
        let one = frame(TRANSPORT_BLE, &[0x55]);
        for _ in 0..60 {
            assert!(reasm.push_chunk(&one));
        }
        let first = reasm.drain();
        assert_eq!(first.frames.len(), 50);
        assert!(!first.exhausted);
        let second = reasm.drain();
        assert_eq!(second.frames.len(), 10);
        assert!(second.exhausted);
        assert_eq!(reasm.frames_emitted(), 60);
    }

    #[test]
    fn emitted_bytes_equal_input_past_the_first_header() {
        // Frame-integrity property: concatenating emissions reproduces the
        // input byte subsequence from the first valid header on.
        let mut reasm = PacketReassembler::new();
        let a = frame(TRANSPORT_BLE, &[1, 2, 3]);
        let b = frame(TRANSPORT_USB, &[4]);
        let c = frame(TRANSPORT_BLE, &[]);
        let mut stream = vec![0xEE, 0x00]; // leading noise
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);
        stream.extend_from_slice(&c);
        for piece in stream.chunks(5) {
            assert!(reasm.push_chunk(piece));
        }
        let out = reasm.drain();
        let emitted: Vec<u8> = out.frames.concat();
        assert_eq!(emitted, stream[2..].to_vec());
    }
}
