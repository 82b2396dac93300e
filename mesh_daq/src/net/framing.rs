// "MI" stream framing: [b'M', b'I'][len u8][payload; len]
use bytes::{Buf, BufMut, Bytes, BytesMut};
use mesh_protocol::{FRAME_MARKER, MAX_PAYLOAD_LEN};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// One frame lifted off the stream, still undecoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub length: u8,
    pub payload: Bytes,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MiCodec;

impl Decoder for MiCodec {
    type Item = RawFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, io::Error> {
        loop {
            if src.len() < FRAME_MARKER.len() {
                return Ok(None);
            }
            if src[..2] != FRAME_MARKER {
                warn!(header = ?&src[..2], "invalid frame marker, skipping");
                src.advance(2);
                continue;
            }
            let Some(&len) = src.get(2) else {
                return Ok(None);
            };
            let total = 3 + len as usize;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            src.advance(3);
            let payload = src.split_to(len as usize).freeze();
            return Ok(Some(RawFrame { length: len, payload }));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, io::Error> {
        let frame = self.decode(src)?;
        if frame.is_none() && !src.is_empty() {
            debug!(pending = src.len(), "peer closed mid-frame");
            src.clear();
        }
        Ok(frame)
    }
}

impl Encoder<Bytes> for MiCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        let len = u8::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("payload of {} bytes exceeds {MAX_PAYLOAD_LEN}", payload.len())))?;
        dst.reserve(3 + payload.len());
        dst.put_slice(&FRAME_MARKER);
        dst.put_u8(len);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_for_a_complete_frame() {
        let mut codec = MiCodec;
        let mut buf = BytesMut::from(&b"MI\x03ab"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"c");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.length, 3);
        assert_eq!(&frame.payload[..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn bad_marker_skips_two_bytes_then_resyncs() {
        let mut codec = MiCodec;
        let mut buf = BytesMut::from(&b"XXMI\x01z"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"z");
    }

    #[test]
    fn zero_length_frame() {
        let mut codec = MiCodec;
        let mut buf = BytesMut::from(&b"MI\x00"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn partial_frame_at_eof_is_discarded() {
        let mut codec = MiCodec;
        let mut buf = BytesMut::from(&b"MI\x09abc"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_prefixes_marker_and_length() {
        let mut codec = MiCodec;
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"hi"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"MI\x02hi");
        assert!(codec.encode(Bytes::from(vec![0u8; 256]), &mut dst).is_err());
    }
}
