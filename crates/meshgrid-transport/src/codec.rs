//! Framing for the JSON object stream.
//!
//! There is no length prefix: a frame is exactly one top-level JSON value,
//! and the decoder leaves any bytes after it in the buffer for the next
//! call. Values that are not objects and syntactically broken input are
//! surfaced as an `Err` frame so the caller can answer with a 400 and keep
//! the connection open.

use bytes::{Buf, BytesMut};
use mesh_core::{Message, RequestError};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::TransportError;

/// A TCP stream framed with [`JsonCodec`].
pub type JsonFramed = Framed<TcpStream, JsonCodec>;

/// Wrap `stream` with a codec bounded at `max_frame_bytes`.
pub fn framed(stream: TcpStream, max_frame_bytes: usize) -> JsonFramed {
    Framed::new(stream, JsonCodec::new(max_frame_bytes))
}

/// One decoded unit from the stream.
pub type Frame = Result<Message, RequestError>;

#[derive(Debug, Clone)]
pub struct JsonCodec {
    max_frame_bytes: usize,
}

impl JsonCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn too_large(&self, size: usize) -> TransportError {
        TransportError::FrameTooLarge {
            size,
            max: self.max_frame_bytes,
        }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl Decoder for JsonCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        let leading = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
        buf.advance(leading);
        if buf.is_empty() {
            return Ok(None);
        }

        let (next, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&buf[..]).into_iter::<Value>();
            let next = stream.next();
            (next, stream.byte_offset())
        };
        match next {
            None => Ok(None),
            Some(Ok(value)) => {
                if consumed > self.max_frame_bytes {
                    return Err(self.too_large(consumed));
                }
                buf.advance(consumed);
                Ok(Some(Message::from_value(value)))
            }
            Some(Err(e)) if e.is_eof() => {
                if buf.len() > self.max_frame_bytes {
                    return Err(self.too_large(buf.len()));
                }
                Ok(None)
            }
            Some(Err(e)) => {
                // The end of a broken value cannot be located; resync by
                // discarding everything buffered so far.
                buf.clear();
                Ok(Some(Err(RequestError::bad_request(format!(
                    "Malformed JSON request: {e}"
                )))))
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // A truncated trailing value is dropped with the connection.
                buf.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for JsonCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Message, buf: &mut BytesMut) -> Result<(), TransportError> {
        let bytes =
            serde_json::to_vec(&item).map_err(|e| TransportError::Malformed(e.to_string()))?;
        if bytes.len() > self.max_frame_bytes {
            return Err(self.too_large(bytes.len()));
        }
        buf.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::Action;

    fn decode_all(codec: &mut JsonCodec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn splits_back_to_back_objects() {
        let mut codec = JsonCodec::default();
        let mut buf = BytesMut::from(
            &br#"{"action":"run","service":"echo"} {"status":200}{"action":"testConnection"}"#[..],
        );
        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].as_ref().unwrap().action().unwrap(), Action::Run);
        assert!(frames[1].as_ref().unwrap().is_success());
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_object() {
        let mut codec = JsonCodec::default();
        let mut buf = BytesMut::from(&br#"{"action":"askFor"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 17);

        buf.extend_from_slice(br#"Service","service":"echo"}"#);
        let frame = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(frame.string_field("service").unwrap(), "echo");
    }

    #[test]
    fn nested_braces_in_strings() {
        let mut codec = JsonCodec::default();
        let mut buf = BytesMut::from(&br#"{"message":"}{ \"x\" {","action":"process"}"#[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(frame.string_field("message").unwrap(), "}{ \"x\" {");
    }

    #[test]
    fn non_object_is_a_protocol_error() {
        let mut codec = JsonCodec::default();
        let mut buf = BytesMut::from(&b"[1,2] {\"status\":200}"[..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.unwrap_err().status, 400);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(second.unwrap().is_success());
    }

    #[test]
    fn broken_json_is_a_protocol_error() {
        let mut codec = JsonCodec::default();
        let mut buf = BytesMut::from(&b"{\"action\": ]"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.unwrap_err().status, 400);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_partial_frame_rejected() {
        let mut codec = JsonCodec::new(16);
        let mut buf = BytesMut::from(&br#"{"message":"aaaaaaaaaaaaaaaaaaaa"#[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::FrameTooLarge { max: 16, .. })
        ));
    }

    #[test]
    fn encoder_enforces_limit() {
        let mut codec = JsonCodec::new(32);
        let mut buf = BytesMut::new();
        codec.encode(Message::ok(), &mut buf).unwrap();
        assert_eq!(&buf[..], br#"{"type":"response","status":200}"#);

        let big = Message::ok().with("responseText", "x".repeat(64));
        assert!(codec.encode(big, &mut buf).is_err());
    }

    #[test]
    fn eof_drops_truncated_tail() {
        let mut codec = JsonCodec::default();
        let mut buf = BytesMut::from(&b"{\"status\":20"[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }
}
