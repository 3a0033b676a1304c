//! Length-prefixed frame codec.
//!
//! Each frame on the wire is `u32 length || header || body`, where
//! `length` counts the header and body bytes only. A frame whose length
//! exceeds the configured maximum is a fatal protocol error; unlike a
//! line protocol there is no resynchronization point to skip to.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Message, WireError};

/// Default cap on a single frame's payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2048;

/// Frames [`Message`]s with a `u32` length prefix.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut prefix = &src[..4];
        let len = prefix.get_u32() as usize;
        if len > self.max_frame_size {
            return Err(WireError::FrameTooLarge(len, self.max_frame_size));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(len).freeze();
        let msg = Message::decode(&mut frame.clone())?;
        Ok(Some(msg))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = item.encode_to_vec();
        if body.len() > self.max_frame_size {
            return Err(WireError::FrameTooLarge(body.len(), self.max_frame_size));
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
    use crate::{Addr, Body, MsgChat};

    fn chat(text: &str) -> Message {
        Message::new(
            Addr::client(1, 0, "a").unwrap(),
            Addr::client(1, 0, "b").unwrap(),
            Body::Chat(MsgChat {
                kind: 1,
                text: text.into(),
                extra: String::new(),
            }),
        )
    }

    #[test]
    fn decode_complete_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(chat("hi"), &mut buf).unwrap();

        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, chat("hi"));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_then_complete() {
        let mut codec = FrameCodec::default();
        let mut full = BytesMut::new();
        codec.encode(chat("split me"), &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[5..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, chat("split me"));
    }

    #[test]
    fn decode_two_frames_in_one_read() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(chat("one"), &mut buf).unwrap();
        codec.encode(chat("two"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), chat("one"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), chat("two"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut codec = FrameCodec::new(32);
        let mut buf = BytesMut::new();
        buf.put_u32(1000);
        buf.put_slice(&[0u8; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WireError::FrameTooLarge(1000, 32))
        ));
    }

    #[test]
    fn encode_rejects_oversized_message() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(chat("this will not fit in sixteen bytes"), &mut buf),
            Err(WireError::FrameTooLarge(..))
        ));
    }
}
