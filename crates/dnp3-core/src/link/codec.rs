use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_DNP};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, ProtocolError};
use crate::link::frame::{
    Frame, FrameHeader, LinkFunction, BLOCK_SIZE, CONTROL_DIR, CONTROL_DFC, CONTROL_FCB,
    CONTROL_FCV, CONTROL_PRM, HEADER_SIZE, MAX_FRAME_DATA, MIN_LENGTH_BYTE, START_BYTES,
};
use crate::trace::{TraceBuffer, TraceDirection};

const CRC_DNP: Crc<u16> = Crc::<u16>::new(&CRC_16_DNP);

/// Streaming link-frame codec. Decode failures consume the offending bytes
/// and resynchronize on the next start octet; the connection stays open.
pub struct FrameCodec {
    /// Expected DIR bit of inbound frames (peer role). `None` disables the
    /// direction check.
    expect_peer_master: Option<bool>,
    trace: Option<Arc<TraceBuffer>>,
}

impl FrameCodec {
    /// Codec for a station whose own role is `local_is_master`; inbound
    /// frames must carry the opposite DIR bit.
    pub fn new(local_is_master: bool) -> Self {
        Self {
            expect_peer_master: Some(!local_is_master),
            trace: None,
        }
    }

    /// Codec that accepts either DIR bit. Used by capture tooling and tests.
    pub fn permissive() -> Self {
        Self {
            expect_peer_master: None,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Arc<TraceBuffer>) -> Self {
        self.trace = Some(trace);
        self
    }

    fn total_frame_size(length_byte: u8) -> usize {
        let body_len = length_byte as usize - 5;
        let blocks = body_len.div_ceil(BLOCK_SIZE);
        HEADER_SIZE + body_len + 2 * blocks
    }

    /// Drop bytes up to the next candidate start octet.
    fn resync(src: &mut BytesMut) {
        match src.iter().skip(1).position(|&b| b == START_BYTES[0]) {
            Some(offset) => src.advance(offset + 1),
            None => src.advance(src.len()),
        }
    }
}

/// Serialize one frame: 8-byte header, header CRC, then CRC'd 16-byte blocks.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), Error> {
    if frame.data.len() > MAX_FRAME_DATA {
        return Err(ProtocolError::SegmentBufferOverflow.into());
    }
    let blocks = frame.data.len().div_ceil(BLOCK_SIZE);
    dst.reserve(HEADER_SIZE + frame.data.len() + 2 * blocks);

    dst.put_slice(&START_BYTES);
    dst.put_u8((5 + frame.data.len()) as u8);
    dst.put_u8(frame.header.control());
    dst.put_u16_le(frame.header.destination);
    dst.put_u16_le(frame.header.source);
    let header_start = dst.len() - 8;
    let header_crc = CRC_DNP.checksum(&dst[header_start..]);
    dst.put_u16_le(header_crc);

    for chunk in frame.data.chunks(BLOCK_SIZE) {
        dst.put_slice(chunk);
        dst.put_u16_le(CRC_DNP.checksum(chunk));
    }
    Ok(())
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        if src[0..2] != START_BYTES {
            let start = u16::from_le_bytes([src[0], src[1]]);
            Self::resync(src);
            return Err(ProtocolError::InvalidStartField(start).into());
        }

        let length = src[2];
        if length < MIN_LENGTH_BYTE {
            src.advance(HEADER_SIZE);
            return Err(ProtocolError::InvalidFrameLength(length).into());
        }

        // The header CRC protects the length byte; validate it before
        // committing to the body size it implies.
        let header_crc = u16::from_le_bytes([src[8], src[9]]);
        if CRC_DNP.checksum(&src[0..8]) != header_crc {
            src.advance(HEADER_SIZE);
            return Err(ProtocolError::BadCrc.into());
        }

        let control = src[3];
        let total = Self::total_frame_size(length);
        let Some(function) = LinkFunction::from_control(control) else {
            src.advance(total.min(src.len()));
            return Err(ProtocolError::UnexpectedFrameData(control).into());
        };

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let from_master = control & CONTROL_DIR != 0;
        if let Some(expected) = self.expect_peer_master {
            if from_master != expected {
                src.advance(total);
                return Err(ProtocolError::InvertedDirBit.into());
            }
        }

        let body_len = length as usize - 5;
        if function.carries_user_data() {
            if body_len == 0 {
                src.advance(total);
                return Err(ProtocolError::MissingFrameData.into());
            }
        } else if body_len != 0 {
            src.advance(total);
            return Err(ProtocolError::UnexpectedFrameData(control).into());
        }

        // Each 16-byte block carries its own CRC.
        let mut data = BytesMut::with_capacity(body_len);
        let mut cursor = HEADER_SIZE;
        let mut remaining = body_len;
        while remaining > 0 {
            let chunk = remaining.min(BLOCK_SIZE);
            let block = &src[cursor..cursor + chunk];
            let crc = u16::from_le_bytes([src[cursor + chunk], src[cursor + chunk + 1]]);
            if CRC_DNP.checksum(block) != crc {
                src.advance(total);
                return Err(ProtocolError::BadCrc.into());
            }
            data.extend_from_slice(block);
            cursor += chunk + 2;
            remaining -= chunk;
        }

        if let Some(trace) = &self.trace {
            trace.record(TraceDirection::Rx, &src[..total]);
        }

        let destination = u16::from_le_bytes([src[4], src[5]]);
        let source = u16::from_le_bytes([src[6], src[7]]);
        let prm = control & CONTROL_PRM != 0;
        src.advance(total);

        Ok(Some(Frame {
            header: FrameHeader {
                function,
                destination,
                source,
                from_master,
                frame_count_bit: prm && control & CONTROL_FCB != 0,
                frame_count_valid: prm && control & CONTROL_FCV != 0,
                data_flow_control: !prm && control & CONTROL_DFC != 0,
            },
            data: data.freeze(),
        }))
    }
}

/// Encode a frame into a fresh buffer. Helper for the send paths that write
/// straight to a connection instead of through `Framed`.
pub fn frame_bytes(frame: &Frame) -> Result<Bytes, Error> {
    let mut buf = BytesMut::new();
    encode_frame(frame, &mut buf)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut codec = FrameCodec::permissive();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn user_data_round_trip() {
        for len in [1usize, 15, 16, 17, 100, 250] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let frame =
                Frame::unconfirmed_user_data(1, 1024, true, Bytes::from(payload.clone()));
            let decoded = round_trip(frame.clone());
            assert_eq!(decoded, frame, "len={len}");
        }
    }

    #[test]
    fn control_frame_round_trip() {
        let frame = Frame::link_status(2, 1, false);
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn reset_link_states_wire_form() {
        // S1: 05 64 05 C0 01 00 02 00 + CRC
        let mut buf = BytesMut::new();
        encode_frame(&Frame::reset_link_states(1, 2, true), &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0x05, 0x64, 0x05, 0xC0, 0x01, 0x00, 0x02, 0x00]);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn flipped_body_bit_fails_crc() {
        let payload: Vec<u8> = (0..40).collect();
        let frame = Frame::unconfirmed_user_data(1, 2, true, Bytes::from(payload));
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        // Flip one bit in the second data block.
        buf[HEADER_SIZE + BLOCK_SIZE + 2 + 3] ^= 0x01;
        let mut codec = FrameCodec::permissive();
        match codec.decode(&mut buf) {
            Err(Error::Protocol(ProtocolError::BadCrc)) => {}
            other => panic!("expected BadCrc, got {other:?}"),
        }
        assert!(buf.is_empty(), "bad frame must be consumed");
    }

    #[test]
    fn flipped_header_crc_fails() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::ack(1, 2, false), &mut buf).unwrap();
        buf[8] ^= 0xFF;
        let mut codec = FrameCodec::permissive();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::BadCrc))
        ));
    }

    #[test]
    fn short_length_byte_rejected() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::ack(1, 2, false), &mut buf).unwrap();
        buf[2] = 4;
        // Re-seal the header CRC so only the length rule trips.
        let crc = CRC_DNP.checksum(&buf[0..8]);
        buf[8..10].copy_from_slice(&crc.to_le_bytes());
        let mut codec = FrameCodec::permissive();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::InvalidFrameLength(4)))
        ));
    }

    #[test]
    fn bad_start_field_resyncs_to_next_frame() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0xAA, 0xBB, 0xCC]);
        encode_frame(&Frame::ack(1, 2, false), &mut buf).unwrap();
        let mut codec = FrameCodec::permissive();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::InvalidStartField(_)))
        ));
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.function, LinkFunction::Ack);
    }

    #[test]
    fn direction_bit_enforced() {
        let mut buf = BytesMut::new();
        // Frame claims to come from a master...
        encode_frame(
            &Frame::unconfirmed_user_data(1, 2, true, Bytes::from_static(b"hi")),
            &mut buf,
        )
        .unwrap();
        // ...but so does the local station.
        let mut codec = FrameCodec::new(true);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::InvertedDirBit))
        ));
    }

    #[test]
    fn control_frame_with_data_rejected() {
        let frame = Frame {
            header: Frame::ack(1, 2, false).header,
            data: Bytes::from_static(b"zz"),
        };
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        let mut codec = FrameCodec::permissive();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::UnexpectedFrameData(_)))
        ));
    }

    #[test]
    fn partial_frame_waits_for_more_input() {
        let mut full = BytesMut::new();
        encode_frame(
            &Frame::unconfirmed_user_data(1, 2, true, Bytes::from_static(b"abcdef")),
            &mut full,
        )
        .unwrap();
        let mut codec = FrameCodec::permissive();
        let mut partial = BytesMut::from(&full[..12]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[12..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn trace_records_decoded_frames() {
        let trace = Arc::new(TraceBuffer::new(8));
        trace.enable();
        let mut codec = FrameCodec::permissive().with_trace(trace.clone());
        let mut buf = BytesMut::new();
        encode_frame(&Frame::ack(1, 2, false), &mut buf).unwrap();
        let wire = buf.to_vec();
        codec.decode(&mut buf).unwrap().unwrap();
        let records = trace.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, wire);
    }
}
