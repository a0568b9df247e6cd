use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::error::{MuxrpcError, Result};
use crate::protocol::frames::{CallId, Frame, FrameType, OpenHeader};
use crate::protocol::status::Status;

/// Default maximum frame size (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes covered by the length prefix before the body: call id + frame type.
const FRAME_PREAMBLE_LEN: usize = 8 + 1;

/// Codec for muxrpc frames.
///
/// Implements [`Decoder`] and [`Encoder`] so it can drive a
/// `FramedRead`/`FramedWrite` pair over any byte stream.
///
/// # Wire Format
///
/// ```text
/// [u32 BE length] [u64 BE call id] [u8 frame type] [body]
/// ```
///
/// `length` counts everything after itself. OPEN and STATUS bodies are JSON,
/// DATA bodies are the raw message, WINDOW_UPDATE carries a `u32` BE credit
/// and HALF_CLOSE / CANCEL are empty.
///
/// # Example
///
/// ```
/// use bytes::{Bytes, BytesMut};
/// use muxrpc_common::transport::FrameCodec;
/// use muxrpc_common::Frame;
/// use tokio_util::codec::{Decoder, Encoder};
///
/// let mut codec = FrameCodec::new();
/// let mut buf = BytesMut::new();
/// codec
///     .encode(Frame::Data { call_id: 7, payload: Bytes::from_static(b"hi") }, &mut buf)
///     .unwrap();
///
/// let frame = codec.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(frame.call_id(), 7);
/// ```
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn encode_body(frame: &Frame) -> Result<Bytes> {
        let body = match frame {
            Frame::Open { header, .. } => Bytes::from(serde_json::to_vec(header)?),
            Frame::Data { payload, .. } => payload.clone(),
            Frame::HalfClose { .. } | Frame::Cancel { .. } => Bytes::new(),
            Frame::Status { status, .. } => Bytes::from(serde_json::to_vec(status)?),
            Frame::WindowUpdate { credit, .. } => Bytes::copy_from_slice(&credit.to_be_bytes()),
        };
        Ok(body)
    }

    fn decode_body(call_id: CallId, frame_type: FrameType, body: Bytes) -> Result<Frame> {
        let frame = match frame_type {
            FrameType::Open => {
                let header: OpenHeader = serde_json::from_slice(&body).map_err(|e| {
                    MuxrpcError::Protocol(format!("malformed OPEN header for call {call_id}: {e}"))
                })?;
                Frame::Open { call_id, header }
            }
            FrameType::Data => Frame::Data {
                call_id,
                payload: body,
            },
            FrameType::HalfClose => {
                expect_empty(call_id, "HALF_CLOSE", &body)?;
                Frame::HalfClose { call_id }
            }
            FrameType::Status => {
                let status: Status = serde_json::from_slice(&body).map_err(|e| {
                    MuxrpcError::Protocol(format!("malformed STATUS for call {call_id}: {e}"))
                })?;
                Frame::Status { call_id, status }
            }
            FrameType::Cancel => {
                expect_empty(call_id, "CANCEL", &body)?;
                Frame::Cancel { call_id }
            }
            FrameType::WindowUpdate => {
                if body.len() != 4 {
                    return Err(MuxrpcError::Protocol(format!(
                        "WINDOW_UPDATE for call {call_id} has {} byte body",
                        body.len()
                    )));
                }
                let mut body = body;
                Frame::WindowUpdate {
                    call_id,
                    credit: body.get_u32(),
                }
            }
        };
        Ok(frame)
    }
}

fn expect_empty(call_id: CallId, name: &str, body: &Bytes) -> Result<()> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(MuxrpcError::Protocol(format!(
            "{name} for call {call_id} carries a {} byte body",
            body.len()
        )))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxrpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len < FRAME_PREAMBLE_LEN {
            return Err(MuxrpcError::Protocol(format!(
                "frame length {len} is shorter than the frame header"
            )));
        }
        if len > self.max_frame_size {
            return Err(MuxrpcError::Protocol(format!(
                "frame too large: {} bytes (max: {} bytes)",
                len, self.max_frame_size
            )));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let call_id = src.get_u64();
        let frame_type = FrameType::try_from(src.get_u8())?;
        let body = src.split_to(len - FRAME_PREAMBLE_LEN).freeze();

        Self::decode_body(call_id, frame_type, body).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxrpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let body = Self::encode_body(&frame)?;
        let len = FRAME_PREAMBLE_LEN + body.len();
        if len > self.max_frame_size {
            return Err(MuxrpcError::InvalidArgument(format!(
                "frame too large: {} bytes (max: {} bytes)",
                len, self.max_frame_size
            )));
        }

        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        dst.put_u64(frame.call_id());
        dst.put_u8(frame.frame_type() as u8);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CallKind, Metadata};

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_data_frame_layout() {
        let buf = encode(Frame::Data {
            call_id: 0x0102,
            payload: Bytes::from_static(b"abc"),
        });
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 1, 2, 2, b'a', b'b', b'c']
        );
    }

    #[test]
    fn test_open_frame_decodes_header() {
        let mut metadata = Metadata::new();
        metadata.append("k", "v");
        let header = OpenHeader::new("svc.Get", CallKind::ServerStream)
            .with_metadata(metadata)
            .with_timeout_ms(1500);
        let mut buf = encode(Frame::Open {
            call_id: 3,
            header: header.clone(),
        });

        let frame = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Open { call_id: 3, header });
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let full = encode(Frame::WindowUpdate {
            call_id: 1,
            credit: 16,
        });
        let mut codec = FrameCodec::new();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 1..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::WindowUpdate {
                call_id: 1,
                credit: 16
            }
        );
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = encode(Frame::HalfClose { call_id: 5 });
        buf.extend_from_slice(&encode(Frame::Cancel { call_id: 6 }));

        let mut codec = FrameCodec::new();
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::HalfClose { call_id: 5 })
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Cancel { call_id: 6 })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unknown_frame_type_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(9);
        buf.put_u64(1);
        buf.put_u8(99);
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, MuxrpcError::Protocol(_)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        let err = FrameCodec::with_max_frame_size(512)
            .decode(&mut buf)
            .unwrap_err();
        assert!(err.to_string().contains("frame too large"));

        let mut out = BytesMut::new();
        let err = FrameCodec::with_max_frame_size(16)
            .encode(
                Frame::Data {
                    call_id: 1,
                    payload: Bytes::from(vec![0u8; 64]),
                },
                &mut out,
            )
            .unwrap_err();
        assert!(matches!(err, MuxrpcError::InvalidArgument(_)));
    }

    #[test]
    fn test_short_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(&[0, 0, 0]);
        assert!(FrameCodec::new().decode(&mut buf).is_err());
    }

    #[test]
    fn test_malformed_status_body() {
        let mut buf = BytesMut::new();
        buf.put_u32(9 + 4);
        buf.put_u64(2);
        buf.put_u8(FrameType::Status as u8);
        buf.put_slice(b"nope");
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, MuxrpcError::Protocol(_)));
    }

    #[test]
    fn test_cancel_with_body_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(9 + 1);
        buf.put_u64(2);
        buf.put_u8(FrameType::Cancel as u8);
        buf.put_u8(0);
        assert!(FrameCodec::new().decode(&mut buf).is_err());
    }
}
