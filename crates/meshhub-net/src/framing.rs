//! Message framing for the mesh transport.
//!
//! Wire format:
//! - 4 bytes: length (big-endian), counting only the JSON body
//! - N bytes: UTF-8 JSON body (a serialized `Envelope`)
//!
//! Unlike a binary protocol there is no leading type byte — the envelope's
//! own `type` field carries that information, so framing only has to find
//! message boundaries and leave (de)serialization to `meshhub_core::envelope`.

use bytes::{Buf, BufMut, BytesMut};
use meshhub_core::Envelope;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum frame size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {1})")]
    TooLarge(usize, usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

/// Length-prefixed JSON codec for `Envelope` frames.
pub struct EnvelopeCodec {
    max_frame_size: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(FrameError::TooLarge(length, self.max_frame_size));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(length);
        let envelope: Envelope = serde_json::from_slice(&body)?;
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > self.max_frame_size {
            return Err(FrameError::TooLarge(body.len(), self.max_frame_size));
        }
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshhub_core::MsgType;

    #[test]
    fn envelope_round_trips_through_codec() {
        let mut codec = EnvelopeCodec::new();
        let env = Envelope::new(MsgType::Ping, "hub", "esp32-01");

        let mut buf = BytesMut::new();
        codec.encode(env.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.source, env.source);
        assert_eq!(decoded.target, env.target);
        assert_eq!(decoded.msg_type, env.msg_type);
    }

    #[test]
    fn partial_frame_returns_none_until_complete() {
        let mut codec = EnvelopeCodec::new();
        let env = Envelope::new(MsgType::Ping, "hub", "esp32-01");
        let mut full = BytesMut::new();
        codec.encode(env, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = EnvelopeCodec::with_max_frame_size(8);
        let env = Envelope::new(MsgType::Ping, "hub", "esp32-01");
        let mut buf = BytesMut::new();
        assert!(codec.encode(env, &mut buf).is_err());
    }
}
