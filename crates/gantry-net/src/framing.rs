use std::mem;

use serde::Deserialize;
use thiserror::Error;

use crate::buffer::ByteBuf;

/// Bytes of frame header on the wire: u32 total length (header included) then
/// u32 command tag, both big-endian.
pub const HEADER_SIZE: usize = 8;

/// Tag value meaning "object payload, no command".
pub const TAG_NONE: u32 = 0;

/// How a listener turns bytes into messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    /// Length-prefixed frames, reassembled across reads.
    #[default]
    Packet,
    /// Every read is delivered as-is.
    Stream,
    /// One message per datagram.
    Datagram,
}

/// One reassembled application packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub tag: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length {len} outside [{HEADER_SIZE}, {max}]")]
    BadLength { len: usize, max: usize },
}

enum DecodeState {
    WaitHeader,
    WaitBody { tag: u32, remaining: usize, body: Vec<u8> },
}

/// Per-connection packet reassembly.
///
/// Consumes header and body bytes as they arrive, so the read buffer never
/// retains more than one partial frame — and a partial frame never exceeds
/// `max_packet_len` because the length is validated before any body byte is
/// accepted.
pub struct PacketDecoder {
    state: DecodeState,
    max_packet_len: usize,
}

impl PacketDecoder {
    pub fn new(max_packet_len: usize) -> Self {
        Self { state: DecodeState::WaitHeader, max_packet_len }
    }

    /// Decode every complete frame currently pending in `buf`.
    ///
    /// `sink` fires once per frame, in wire order. A length outside
    /// `[HEADER_SIZE, max_packet_len]` aborts decoding; the caller must fail
    /// the connection — the stream has no recoverable framing left.
    pub fn drain(
        &mut self,
        buf: &mut ByteBuf,
        mut sink: impl FnMut(Frame),
    ) -> Result<(), FrameError> {
        loop {
            match &mut self.state {
                DecodeState::WaitHeader => {
                    if buf.pending() < HEADER_SIZE {
                        return Ok(());
                    }
                    let head = buf.peek(HEADER_SIZE);
                    let len = u32::from_be_bytes(head[..4].try_into().unwrap()) as usize;
                    let tag = u32::from_be_bytes(head[4..8].try_into().unwrap());
                    if len < HEADER_SIZE || len > self.max_packet_len {
                        return Err(FrameError::BadLength { len, max: self.max_packet_len });
                    }
                    buf.consume(HEADER_SIZE);

                    let body_len = len - HEADER_SIZE;
                    if body_len == 0 {
                        sink(Frame { tag, payload: Vec::new() });
                    } else {
                        self.state = DecodeState::WaitBody {
                            tag,
                            remaining: body_len,
                            body: Vec::with_capacity(body_len),
                        };
                    }
                }
                DecodeState::WaitBody { tag, remaining, body } => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    let chunk = buf.take(*remaining);
                    *remaining -= chunk.len();
                    body.extend_from_slice(&chunk);

                    if *remaining > 0 {
                        return Ok(());
                    }
                    let frame = Frame { tag: *tag, payload: mem::take(body) };
                    self.state = DecodeState::WaitHeader;
                    sink(frame);
                }
            }
        }
    }

    /// True while a frame is partially reassembled.
    pub fn mid_frame(&self) -> bool {
        matches!(self.state, DecodeState::WaitBody { .. })
    }
}

/// Append one framed packet to an outbound buffer.
pub fn encode_packet(wbuf: &mut ByteBuf, tag: u32, payload: &[u8]) {
    let total = (HEADER_SIZE + payload.len()) as u32;
    wbuf.append(&total.to_be_bytes());
    wbuf.append(&tag.to_be_bytes());
    wbuf.append(payload);
}

/// Encode into a standalone vec; the blocking control-channel clients use
/// this where no [`ByteBuf`] exists.
pub fn encode_packet_vec(tag: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = ByteBuf::with_capacity(HEADER_SIZE + payload.len());
    encode_packet(&mut buf, tag, payload);
    buf.take(buf.pending())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(dec: &mut PacketDecoder, buf: &mut ByteBuf) -> Result<Vec<Frame>, FrameError> {
        let mut out = Vec::new();
        dec.drain(buf, |f| out.push(f))?;
        Ok(out)
    }

    #[test]
    fn roundtrip_single_frame() {
        let mut buf = ByteBuf::default();
        encode_packet(&mut buf, 1, b"Hi!");
        assert_eq!(buf.as_slice(), &[0, 0, 0, 11, 0, 0, 0, 1, b'H', b'i', b'!']);

        let mut dec = PacketDecoder::new(1024);
        let frames = collect(&mut dec, &mut buf).unwrap();
        assert_eq!(frames, vec![Frame { tag: 1, payload: b"Hi!".to_vec() }]);
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_length_payload_is_valid() {
        let mut buf = ByteBuf::default();
        encode_packet(&mut buf, 7, b"");
        let mut dec = PacketDecoder::new(64);
        let frames = collect(&mut dec, &mut buf).unwrap();
        assert_eq!(frames, vec![Frame { tag: 7, payload: Vec::new() }]);
    }

    #[test]
    fn one_byte_per_segment_decodes_identically() {
        let mut wire = ByteBuf::default();
        encode_packet(&mut wire, 3, b"split across many segments");
        let wire = wire.take(wire.pending());

        let mut dec = PacketDecoder::new(1024);
        let mut buf = ByteBuf::default();
        let mut frames = Vec::new();
        for b in &wire {
            buf.append(&[*b]);
            dec.drain(&mut buf, |f| frames.push(f)).unwrap();
        }
        assert_eq!(frames, vec![Frame { tag: 3, payload: b"split across many segments".to_vec() }]);
    }

    #[test]
    fn coalesced_frames_fire_in_order() {
        let mut buf = ByteBuf::default();
        encode_packet(&mut buf, 2, b"AB");
        encode_packet(&mut buf, 2, b"CD");

        let mut dec = PacketDecoder::new(1024);
        let frames = collect(&mut dec, &mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, b"AB");
        assert_eq!(frames[1].payload, b"CD");
    }

    #[test]
    fn length_bounds_are_inclusive_max_exclusive_above() {
        let max = 64;
        let mut dec = PacketDecoder::new(max);

        // Exactly max: accepted.
        let mut buf = ByteBuf::default();
        encode_packet(&mut buf, 1, &vec![0u8; max - HEADER_SIZE]);
        assert_eq!(collect(&mut dec, &mut buf).unwrap().len(), 1);

        // One over: rejected before any body byte is consumed.
        let mut buf = ByteBuf::default();
        buf.append(&((max as u32) + 1).to_be_bytes());
        buf.append(&1u32.to_be_bytes());
        assert_eq!(
            collect(&mut dec, &mut buf),
            Err(FrameError::BadLength { len: max + 1, max })
        );
    }

    #[test]
    fn undersized_length_is_rejected() {
        let mut dec = PacketDecoder::new(1024);
        let mut buf = ByteBuf::default();
        buf.append(&7u32.to_be_bytes());
        buf.append(&0u32.to_be_bytes());
        assert!(collect(&mut dec, &mut buf).is_err());
    }

    #[test]
    fn partial_header_waits_without_consuming() {
        let mut dec = PacketDecoder::new(1024);
        let mut buf = ByteBuf::default();
        buf.append(&[0, 0, 0]);
        assert!(collect(&mut dec, &mut buf).unwrap().is_empty());
        assert_eq!(buf.pending(), 3);
        assert!(!dec.mid_frame());
    }
}
