//! Frame decoding and encoding
//!
//! Stream transports (serial, TCP) carry frames of the form:
//!
//! ```text
//! 0x94 0xC3 <len_hi> <len_lo> <payload: len bytes>
//! ```
//!
//! interleaved with whatever the device prints to its console. The
//! [`FrameDecoder`] scans a rolling buffer for the magic marker, emits
//! complete payloads in arrival order, and turns the bytes in between into
//! diagnostic text lines. Datagram transports (BLE) hand over one complete
//! payload per buffer, which passes straight through.
//!
//! # Recovery
//!
//! - A declared length of 0 or above [`MAX_FRAME_PAYLOAD`] is a false
//!   marker: the decoder skips the two marker bytes and keeps scanning.
//! - A frame whose bytes stop arriving is abandoned after the frame
//!   timeout, again by skipping its marker.
//! - Console text arriving while no message has been decoded for the
//!   stale-link window yields [`DecodeEvent::RecoveryNeeded`] once per
//!   window.
//!
//! The decoder does no I/O and takes the current time as an argument, so
//! every path is testable without a clock.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{Framing, ProtocolConfig, FRAME_MAGIC, MAX_FRAME_PAYLOAD};
use crate::error::{MeshlinkError, Result};

const MAGIC_HI: u8 = (FRAME_MAGIC >> 8) as u8;
const MAGIC_LO: u8 = (FRAME_MAGIC & 0xFF) as u8;

/// Marker (2) + length (2)
const HEADER_LEN: usize = 4;

/// Console text without a newline is flushed once it reaches this size
const MAX_TEXT_LINE: usize = 256;

/// Minimum share of printable bytes for a run to be treated as text
const PRINTABLE_RATIO: f32 = 0.8;

const ESC: u8 = 0x1B;

/// Output of the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// One complete payload
    Frame(Bytes),
    /// One printable line of device console output, ANSI sequences removed
    Diagnostic(String),
    /// The link looks stale; the device should be woken and re-handshaked
    RecoveryNeeded,
}

/// Incremental frame decoder for one transport connection
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    buffer: BytesMut,
    text: Vec<u8>,
    frame_timeout: Duration,
    stale_after: Duration,
    /// Set while a started frame waits for its remaining bytes
    pending_since: Option<Instant>,
    last_decoded: Instant,
}

impl FrameDecoder {
    /// Create a decoder with explicit timeouts
    pub fn new(framing: Framing, frame_timeout: Duration, stale_after: Duration) -> Self {
        Self {
            framing,
            buffer: BytesMut::with_capacity(MAX_FRAME_PAYLOAD * 2),
            text: Vec::new(),
            frame_timeout,
            stale_after,
            pending_since: None,
            last_decoded: Instant::now(),
        }
    }

    /// Create a decoder using the protocol timing table
    pub fn from_config(framing: Framing, config: &ProtocolConfig) -> Self {
        Self::new(framing, config.frame_timeout, config.stale_link_after)
    }

    /// Framing this decoder was built for
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Bytes buffered but not yet emitted
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Consume one inbound chunk
    pub fn push(&mut self, chunk: &[u8], now: Instant) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        match self.framing {
            Framing::Datagram => {
                if !chunk.is_empty() {
                    events.push(DecodeEvent::Frame(Bytes::copy_from_slice(chunk)));
                }
            }
            Framing::Stream => {
                self.buffer.extend_from_slice(chunk);
                self.drain(now, &mut events);
            }
        }
        events
    }

    /// Abandon a stalled partial frame once the frame timeout has passed
    pub fn poll_timeout(&mut self, now: Instant) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        if self.framing == Framing::Stream {
            self.drain(now, &mut events);
        }
        events
    }

    /// When [`poll_timeout`](Self::poll_timeout) next has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending_since.map(|since| since + self.frame_timeout)
    }

    /// Record that a payload decoded into a valid message
    pub fn mark_decoded(&mut self, now: Instant) {
        self.last_decoded = now;
    }

    /// Drop all buffered state
    pub fn reset(&mut self, now: Instant) {
        self.buffer.clear();
        self.text.clear();
        self.pending_since = None;
        self.last_decoded = now;
    }

    fn drain(&mut self, now: Instant, events: &mut Vec<DecodeEvent>) {
        loop {
            self.scan(now, events);
            match self.pending_since {
                Some(since) if now.saturating_duration_since(since) >= self.frame_timeout => {
                    warn!(
                        buffered = self.buffer.len(),
                        "Incomplete frame timed out, skipping marker"
                    );
                    self.buffer.advance(2);
                    self.pending_since = None;
                }
                _ => break,
            }
        }
    }

    fn scan(&mut self, now: Instant, events: &mut Vec<DecodeEvent>) {
        loop {
            let Some(pos) = find_magic(&self.buffer) else {
                // A trailing first marker byte may pair with the next chunk
                let keep = usize::from(self.buffer.last() == Some(&MAGIC_HI));
                let noise = self.buffer.split_to(self.buffer.len() - keep);
                self.capture_text(&noise, now, events);
                self.pending_since = None;
                return;
            };

            if pos > 0 {
                let noise = self.buffer.split_to(pos);
                self.capture_text(&noise, now, events);
                self.pending_since = None;
            }

            if self.buffer.len() < HEADER_LEN {
                self.pending_since.get_or_insert(now);
                return;
            }

            let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
            if length == 0 || length > MAX_FRAME_PAYLOAD {
                warn!(length, "Frame length out of range, skipping marker");
                self.buffer.advance(2);
                self.pending_since = None;
                continue;
            }

            if self.buffer.len() < HEADER_LEN + length {
                trace!(
                    have = self.buffer.len(),
                    need = HEADER_LEN + length,
                    "Waiting for complete frame"
                );
                self.pending_since.get_or_insert(now);
                return;
            }

            let mut frame = self.buffer.split_to(HEADER_LEN + length);
            frame.advance(HEADER_LEN);
            self.pending_since = None;
            trace!(size = length, "Decoded frame");
            events.push(DecodeEvent::Frame(frame.freeze()));
        }
    }

    fn capture_text(&mut self, bytes: &[u8], now: Instant, events: &mut Vec<DecodeEvent>) {
        if bytes.is_empty() {
            return;
        }
        self.text.extend_from_slice(bytes);

        if now.saturating_duration_since(self.last_decoded) > self.stale_after {
            debug!("Console output on a silent link, requesting recovery");
            events.push(DecodeEvent::RecoveryNeeded);
            self.last_decoded = now;
        }

        while let Some(newline) = self.text.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.text.drain(..=newline).collect();
            emit_line(&line, events);
        }
        if self.text.len() >= MAX_TEXT_LINE {
            let line = std::mem::take(&mut self.text);
            emit_line(&line, events);
        }
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(2)
        .position(|pair| pair[0] == MAGIC_HI && pair[1] == MAGIC_LO)
}

fn is_printable(byte: u8) -> bool {
    matches!(byte, 0x20..=0x7E | b'\t' | b'\n' | b'\r' | ESC)
}

fn emit_line(line: &[u8], events: &mut Vec<DecodeEvent>) {
    if line.is_empty() {
        return;
    }
    let printable = line.iter().filter(|b| is_printable(**b)).count();
    if (printable as f32) < (line.len() as f32) * PRINTABLE_RATIO {
        trace!(len = line.len(), "Discarding binary noise");
        return;
    }
    let cleaned = strip_ansi(line);
    let text = String::from_utf8_lossy(&cleaned);
    let text = text.trim();
    if !text.is_empty() {
        events.push(DecodeEvent::Diagnostic(text.to_string()));
    }
}

/// Remove `ESC [ ... <final>` control sequences and lone escapes
fn strip_ansi(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        if line[i] == ESC {
            i += 1;
            if line.get(i) == Some(&b'[') {
                i += 1;
                while i < line.len() && !(0x40..=0x7E).contains(&line[i]) {
                    i += 1;
                }
                i += 1;
            }
            continue;
        }
        out.push(line[i]);
        i += 1;
    }
    out
}

/// Wrap a payload in a stream frame header
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.is_empty() || payload.len() > MAX_FRAME_PAYLOAD {
        return Err(MeshlinkError::InvalidFrameLength {
            length: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u16(FRAME_MAGIC);
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Encode a payload for the given framing
pub fn encode_for(framing: Framing, payload: &[u8]) -> Result<Bytes> {
    match framing {
        Framing::Stream => encode_frame(payload),
        Framing::Datagram => Ok(Bytes::copy_from_slice(payload)),
    }
}

/// Wakeup burst: repeated second marker byte
pub fn wakeup_sequence(len: usize) -> Bytes {
    Bytes::from(vec![MAGIC_LO; len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_decoder() -> FrameDecoder {
        FrameDecoder::new(
            Framing::Stream,
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
    }

    fn frames(events: &[DecodeEvent]) -> Vec<Bytes> {
        events
            .iter()
            .filter_map(|e| match e {
                DecodeEvent::Frame(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_encode_frame() {
        let framed = encode_frame(b"hello").unwrap();
        assert_eq!(&framed[..4], &[0x94, 0xC3, 0x00, 0x05]);
        assert_eq!(&framed[4..], b"hello");
    }

    #[test]
    fn test_encode_rejects_bad_lengths() {
        assert!(encode_frame(&[]).is_err());
        assert!(encode_frame(&[0u8; 513]).is_err());
        assert!(encode_frame(&[0u8; 512]).is_ok());
    }

    #[test]
    fn test_complete_frame() {
        let mut decoder = stream_decoder();
        let events = decoder.push(&encode_frame(b"test").unwrap(), Instant::now());
        assert_eq!(frames(&events), vec![Bytes::from_static(b"test")]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_across_chunks() {
        let mut decoder = stream_decoder();
        let framed = encode_frame(b"split payload").unwrap();
        let now = Instant::now();

        assert!(decoder.push(&framed[..3], now).is_empty());
        assert!(decoder.push(&framed[3..7], now).is_empty());
        assert!(decoder.next_deadline().is_some());

        let events = decoder.push(&framed[7..], now);
        assert_eq!(frames(&events), vec![Bytes::from_static(b"split payload")]);
        assert!(decoder.next_deadline().is_none());
    }

    #[test]
    fn test_marker_split_after_first_byte() {
        let mut decoder = stream_decoder();
        let framed = encode_frame(b"x").unwrap();
        let now = Instant::now();

        assert!(decoder.push(&framed[..1], now).is_empty());
        let events = decoder.push(&framed[1..], now);
        assert_eq!(frames(&events), vec![Bytes::from_static(b"x")]);
    }

    #[test]
    fn test_zero_length_skipped_in_same_call() {
        let mut decoder = stream_decoder();
        let mut bytes = vec![0x94, 0xC3, 0x00, 0x00];
        bytes.extend_from_slice(&encode_frame(b"ok").unwrap());

        let events = decoder.push(&bytes, Instant::now());
        assert_eq!(frames(&events), vec![Bytes::from_static(b"ok")]);
    }

    #[test]
    fn test_oversized_length_skipped_in_same_call() {
        let mut decoder = stream_decoder();
        let mut bytes = vec![0x94, 0xC3, 0x02, 0x01];
        bytes.extend_from_slice(&encode_frame(b"ok").unwrap());

        let events = decoder.push(&bytes, Instant::now());
        assert_eq!(frames(&events), vec![Bytes::from_static(b"ok")]);
        assert!(decoder.next_deadline().is_none());
    }

    #[test]
    fn test_false_start_recovers_after_timeout() {
        let mut decoder = stream_decoder();
        let start = Instant::now();

        // Declares 100 bytes but only 2 arrive
        assert!(decoder.push(&[0x94, 0xC3, 0x00, 0x64, 1, 2], start).is_empty());

        let early = decoder.poll_timeout(start + Duration::from_secs(4));
        assert!(early.is_empty());
        assert_eq!(decoder.buffered(), 6);

        decoder.poll_timeout(start + Duration::from_secs(5));
        assert_eq!(decoder.buffered(), 0);

        let events = decoder.push(
            &encode_frame(b"next").unwrap(),
            start + Duration::from_secs(6),
        );
        assert_eq!(frames(&events), vec![Bytes::from_static(b"next")]);
    }

    #[test]
    fn test_frame_inside_stalled_frame_recovered() {
        let mut decoder = stream_decoder();
        let start = Instant::now();

        let mut bytes = vec![0x94, 0xC3, 0x01, 0x00];
        bytes.extend_from_slice(&encode_frame(b"inner").unwrap());
        assert!(frames(&decoder.push(&bytes, start)).is_empty());

        let events = decoder.poll_timeout(start + Duration::from_secs(5));
        assert_eq!(frames(&events), vec![Bytes::from_static(b"inner")]);
    }

    #[test]
    fn test_console_text_becomes_diagnostics() {
        let mut decoder = stream_decoder();
        let mut bytes = b"INFO  | booting\r\n\x1b[32mDEBUG | radio ok\x1b[0m\n".to_vec();
        bytes.extend_from_slice(&encode_frame(b"p").unwrap());

        let events = decoder.push(&bytes, Instant::now());
        assert_eq!(
            events,
            vec![
                DecodeEvent::Diagnostic("INFO  | booting".to_string()),
                DecodeEvent::Diagnostic("DEBUG | radio ok".to_string()),
                DecodeEvent::Frame(Bytes::from_static(b"p")),
            ]
        );
    }

    #[test]
    fn test_binary_noise_discarded() {
        let mut decoder = stream_decoder();
        let noise = [0x01, 0x02, 0x03, 0xF0, 0xFE, b'a', b'\n'];
        let events = decoder.push(&noise, Instant::now());
        assert!(events.is_empty());
    }

    #[test]
    fn test_recovery_requested_once_per_window() {
        let mut decoder = stream_decoder();
        let start = Instant::now();

        let quiet = decoder.push(b"still here\n", start + Duration::from_secs(30));
        assert!(!quiet.contains(&DecodeEvent::RecoveryNeeded));

        let stale = decoder.push(b"still here\n", start + Duration::from_secs(61));
        assert!(stale.contains(&DecodeEvent::RecoveryNeeded));

        let again = decoder.push(b"still here\n", start + Duration::from_secs(62));
        assert!(!again.contains(&DecodeEvent::RecoveryNeeded));
    }

    #[test]
    fn test_decoded_messages_keep_link_fresh() {
        let mut decoder = stream_decoder();
        let start = Instant::now();

        decoder.mark_decoded(start + Duration::from_secs(50));
        let events = decoder.push(b"log line\n", start + Duration::from_secs(100));
        assert!(!events.contains(&DecodeEvent::RecoveryNeeded));
    }

    #[test]
    fn test_datagram_passthrough() {
        let mut decoder = FrameDecoder::new(
            Framing::Datagram,
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        // No header expected: the bytes are the payload
        let events = decoder.push(&[0x94, 0xC3, 0x00], Instant::now());
        assert_eq!(events, vec![DecodeEvent::Frame(Bytes::from_static(&[0x94, 0xC3, 0x00]))]);
        assert!(decoder.push(&[], Instant::now()).is_empty());
    }

    #[test]
    fn test_wakeup_sequence() {
        let wake = wakeup_sequence(64);
        assert_eq!(wake.len(), 64);
        assert!(wake.iter().all(|b| *b == 0xC3));
    }
}
