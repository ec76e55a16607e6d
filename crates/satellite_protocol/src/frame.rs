//! Length-prefixed framing.
//!
//! ```text
//! +------------+-------------+---------------------+
//! | size: u32  | msg_type: u8| payload: size bytes |
//! | big-endian |             | protobuf            |
//! +------------+-------------+---------------------+
//! ```
//!
//! `size` counts the payload only, not the type byte.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{SatMessage, SatMsgType};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes preceding the payload.
pub const HEADER_SIZE: usize = 5;

/// Largest payload the decoder accepts.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encodes one message as a complete frame.
pub fn encode_frame(message: &SatMessage) -> Bytes {
    let payload = message.encode_payload();
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(message.msg_type().to_code());
    buf.put_slice(&payload);
    buf.freeze()
}

/// Decodes a single complete frame.
pub fn decode_frame(frame: &[u8]) -> ProtocolResult<SatMessage> {
    let mut decoder = FrameDecoder::new();
    decoder.extend(frame);
    match decoder.next_message()? {
        Some(message) if decoder.buffered() == 0 => Ok(message),
        Some(_) => Err(ProtocolError::decode("frame", "trailing bytes after frame")),
        None => Err(ProtocolError::decode("frame", "incomplete frame")),
    }
}

/// Incremental decoder for a byte stream of frames.
///
/// Bytes are appended as they arrive; complete frames are taken off the
/// front. A frame split across reads stays buffered until its remainder
/// arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Creates a decoder with the default frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a decoder rejecting payloads above `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Takes the next complete frame off the buffer, if one is available.
    ///
    /// An unknown type tag or oversized frame is an error; the stream is
    /// unusable afterwards.
    pub fn next_message(&mut self) -> ProtocolResult<Option<SatMessage>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let size = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }

        let msg_type = SatMsgType::from_code(self.buffer[4])?;

        if self.buffer.len() < HEADER_SIZE + size {
            return Ok(None);
        }

        self.buffer.advance(HEADER_SIZE);
        let payload = self.buffer.split_to(size);
        SatMessage::decode(msg_type, &payload).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{SatAuthReq, SatPingReq, SatPingResp};

    fn auth_req() -> SatMessage {
        SatMessage::AuthReq(SatAuthReq {
            id: "client".into(),
            token: "token".into(),
            headers: vec![],
        })
    }

    #[test]
    fn header_layout() {
        let frame = encode_frame(&SatMessage::PingResp(SatPingResp {
            lsn: Some(vec![1, 2]),
        }));
        // field 1, wire type 2, len 2, bytes
        assert_eq!(&frame[..], &[0, 0, 0, 4, 4, 0x0a, 2, 1, 2]);
    }

    #[test]
    fn empty_payload_frame() {
        let frame = encode_frame(&SatMessage::PingReq(SatPingReq {}));
        assert_eq!(&frame[..], &[0, 0, 0, 0, 3]);
        assert_eq!(decode_frame(&frame).unwrap(), SatMessage::PingReq(SatPingReq {}));
    }

    #[test]
    fn stream_split_across_reads() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(&auth_req()));
        stream.extend_from_slice(&encode_frame(&SatMessage::PingReq(SatPingReq {})));

        let mut decoder = FrameDecoder::new();
        let (head, tail) = stream.split_at(7);

        decoder.extend(head);
        assert_eq!(decoder.next_message().unwrap(), None);

        decoder.extend(tail);
        assert_eq!(decoder.next_message().unwrap(), Some(auth_req()));
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(SatMessage::PingReq(SatPingReq {}))
        );
        assert_eq!(decoder.next_message().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn unknown_type_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0, 0, 0, 0, 99]);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::UnexpectedMessageType(99))
        ));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut decoder = FrameDecoder::with_max_frame_size(8);
        decoder.extend(&[0, 0, 1, 0, 3]);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::FrameTooLarge { size: 256, limit: 8 })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut frame = encode_frame(&SatMessage::PingReq(SatPingReq {})).to_vec();
        frame.push(0);
        assert!(decode_frame(&frame).is_err());
    }
}
