// ABOUTME: Connect protocol framing for server-streaming RPC
// ABOUTME: Envelope encoding, incremental decoding, and end-of-stream error mapping

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::error::{Result, TransportError};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_STREAM_JSON: &str = "application/connect+json";
pub const PROTOCOL_VERSION_HEADER: &str = "connect-protocol-version";
pub const PROTOCOL_VERSION: &str = "1";

const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_END_STREAM: u8 = 0x02;
const HEADER_LEN: usize = 5;

/// One decoded frame of a server stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Bytes),
    /// Trailer frame; carries the stream's terminal status
    End(Bytes),
}

pub fn encode_envelope(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Accumulates body chunks and yields complete frames
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buf: BytesMut,
}

impl EnvelopeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if the buffer holds one
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let flags = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        if flags & FLAG_COMPRESSED != 0 {
            return Err(TransportError::protocol("compressed stream frames are not supported"));
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        if flags & FLAG_END_STREAM != 0 {
            Ok(Some(Frame::End(payload)))
        } else {
            Ok(Some(Frame::Message(payload)))
        }
    }

    /// Bytes buffered but not yet forming a whole frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Interpret an end-of-stream payload; `Ok` when the stream finished cleanly
pub fn end_stream_status(payload: &[u8]) -> Result<()> {
    if payload.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(());
    }
    let value: Value = serde_json::from_slice(payload)?;
    match value.get("error") {
        Some(error) if !error.is_null() => Err(error_from_value(error)),
        _ => Ok(()),
    }
}

/// Build a transport error from a Connect `{code, message}` object
pub fn error_from_value(error: &Value) -> TransportError {
    let code = error.get("code").and_then(Value::as_str).unwrap_or("unknown");
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or(code);
    TransportError::status(code_to_status(code), message)
}

/// HTTP status equivalent of a Connect error code
pub fn code_to_status(code: &str) -> u16 {
    match code {
        "canceled" => 499,
        "invalid_argument" | "out_of_range" => 400,
        "unauthenticated" => 401,
        "permission_denied" => 403,
        "not_found" => 404,
        "already_exists" | "aborted" => 409,
        "failed_precondition" => 412,
        "resource_exhausted" => 429,
        "unimplemented" => 501,
        "unavailable" => 503,
        "deadline_exceeded" => 504,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn end_frame(payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![FLAG_END_STREAM];
        raw.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        raw.extend_from_slice(payload);
        raw
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut raw = encode_envelope(br#"{"a":1}"#).to_vec();
        raw.extend(end_frame(b"{}"));

        let mut decoder = EnvelopeDecoder::new();
        decoder.extend(&raw[..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.extend(&raw[3..9]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.extend(&raw[9..]);
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(Frame::Message(Bytes::from_static(br#"{"a":1}"#)))
        );
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(Frame::End(Bytes::from_static(b"{}")))
        );
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_compressed_frame_is_rejected() {
        let mut decoder = EnvelopeDecoder::new();
        decoder.extend(&[FLAG_COMPRESSED, 0, 0, 0, 0]);
        assert!(matches!(decoder.next_frame(), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_end_stream_error_maps_code() {
        let err = end_stream_status(br#"{"error":{"code":"not_found","message":"process with pid 42 not found"}}"#)
            .unwrap_err();
        assert_eq!(err, TransportError::status(404, "process with pid 42 not found"));
    }

    #[test]
    fn test_clean_end_stream() {
        assert!(end_stream_status(b"").is_ok());
        assert!(end_stream_status(b"{}").is_ok());
        assert!(end_stream_status(br#"{"metadata":{}}"#).is_ok());
    }

    #[rstest]
    #[case("not_found", 404)]
    #[case("invalid_argument", 400)]
    #[case("unauthenticated", 401)]
    #[case("permission_denied", 403)]
    #[case("already_exists", 409)]
    #[case("failed_precondition", 412)]
    #[case("resource_exhausted", 429)]
    #[case("canceled", 499)]
    #[case("unimplemented", 501)]
    #[case("unavailable", 503)]
    #[case("deadline_exceeded", 504)]
    #[case("internal", 500)]
    #[case("something_new", 500)]
    fn test_code_to_status(#[case] code: &str, #[case] status: u16) {
        assert_eq!(code_to_status(code), status);
    }
}
