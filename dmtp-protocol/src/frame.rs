//! Deadline frame wire format
//!
//! Two frames extend the transport:
//!
//! ```text
//! DEADLINE_CONTROL     { type (i) = 0x3d, stream_id (i), deadline_ms (i) }
//! STREAM_DATA_DROPPED  { type (i) = 0x3e, stream_id (i), offset (i), length (i) }
//! ```
//!
//! All fields are QUIC varints. Both frames are ack-eliciting and must be
//! delivered reliably by the host.

use crate::stream::StreamId;
use crate::varint::{self, VarIntError, MAX_VARINT};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Frame type of DEADLINE_CONTROL
pub const FRAME_TYPE_DEADLINE_CONTROL: u64 = 0x3d;

/// Frame type of STREAM_DATA_DROPPED
pub const FRAME_TYPE_STREAM_DATA_DROPPED: u64 = 0x3e;

/// Transport error codes surfaced by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum TransportErrorCode {
    /// Generic failure inside the endpoint
    InternalError = 0x01,
    /// Transport parameter is malformed
    TransportParameterError = 0x08,
    /// Stream data exceeded or changed the final size
    FinalSizeError = 0x06,
    /// A frame could not be decoded
    FrameEncodingError = 0x07,
}

impl TransportErrorCode {
    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
            TransportErrorCode::TransportParameterError => write!(f, "TRANSPORT_PARAMETER_ERROR"),
            TransportErrorCode::FinalSizeError => write!(f, "FINAL_SIZE_ERROR"),
            TransportErrorCode::FrameEncodingError => write!(f, "FRAME_ENCODING_ERROR"),
        }
    }
}

/// Frame errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed {frame} frame: {source}")]
    Malformed {
        frame: &'static str,
        #[source]
        source: VarIntError,
    },

    #[error("Unknown frame type: {0:#x}")]
    UnknownType(u64),

    #[error("Dropped range overflows: offset {offset} + length {length}")]
    RangeOverflow { offset: u64, length: u64 },

    #[error("Cannot encode frame: {0}")]
    Encode(#[from] VarIntError),
}

impl FrameError {
    /// Transport error code the connection closes with
    pub fn error_code(&self) -> TransportErrorCode {
        match self {
            FrameError::Encode(_) => TransportErrorCode::InternalError,
            _ => TransportErrorCode::FrameEncodingError,
        }
    }
}

/// Announces or updates a stream's deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineControlFrame {
    /// Stream the deadline applies to
    pub stream_id: StreamId,
    /// Deadline in milliseconds from receipt
    pub deadline_ms: u64,
}

impl DeadlineControlFrame {
    /// Create a frame from a duration (millisecond precision on the wire)
    pub fn new(stream_id: StreamId, deadline: Duration) -> Self {
        DeadlineControlFrame {
            stream_id,
            deadline_ms: u64::try_from(deadline.as_millis()).unwrap_or(MAX_VARINT),
        }
    }

    /// Deadline as a duration
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    fn encoded_len(&self) -> Result<usize, VarIntError> {
        Ok(varint::encoded_len(FRAME_TYPE_DEADLINE_CONTROL)?
            + varint::encoded_len(self.stream_id.as_u64())?
            + varint::encoded_len(self.deadline_ms)?)
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<(), VarIntError> {
        varint::encode(buf, self.stream_id.as_u64())?;
        varint::encode(buf, self.deadline_ms)
    }

    fn decode_body<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        let malformed = |source| FrameError::Malformed {
            frame: "DEADLINE_CONTROL",
            source,
        };
        let stream_id = varint::decode(buf).map_err(malformed)?;
        let deadline_ms = varint::decode(buf).map_err(malformed)?;
        Ok(DeadlineControlFrame {
            stream_id: StreamId::new(stream_id),
            deadline_ms,
        })
    }
}

/// Declares that `[offset, offset + length)` will never be sent or resent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataDroppedFrame {
    /// Stream the bytes belong to
    pub stream_id: StreamId,
    /// First dropped byte
    pub offset: u64,
    /// Number of dropped bytes
    pub length: u64,
}

impl StreamDataDroppedFrame {
    /// End of the dropped range (exclusive)
    ///
    /// Decoded frames never exceed `MAX_VARINT`; locally built ones saturate.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    fn encoded_len(&self) -> Result<usize, VarIntError> {
        Ok(varint::encoded_len(FRAME_TYPE_STREAM_DATA_DROPPED)?
            + varint::encoded_len(self.stream_id.as_u64())?
            + varint::encoded_len(self.offset)?
            + varint::encoded_len(self.length)?)
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<(), VarIntError> {
        varint::encode(buf, self.stream_id.as_u64())?;
        varint::encode(buf, self.offset)?;
        varint::encode(buf, self.length)
    }

    fn decode_body<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        let malformed = |source| FrameError::Malformed {
            frame: "STREAM_DATA_DROPPED",
            source,
        };
        let stream_id = varint::decode(buf).map_err(malformed)?;
        let offset = varint::decode(buf).map_err(malformed)?;
        let length = varint::decode(buf).map_err(malformed)?;

        if offset.checked_add(length).map_or(true, |end| end > MAX_VARINT) {
            return Err(FrameError::RangeOverflow { offset, length });
        }

        Ok(StreamDataDroppedFrame {
            stream_id: StreamId::new(stream_id),
            offset,
            length,
        })
    }
}

/// A deadline extension frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineFrame {
    DeadlineControl(DeadlineControlFrame),
    StreamDataDropped(StreamDataDroppedFrame),
}

impl DeadlineFrame {
    /// Wire frame type
    pub fn frame_type(&self) -> u64 {
        match self {
            DeadlineFrame::DeadlineControl(_) => FRAME_TYPE_DEADLINE_CONTROL,
            DeadlineFrame::StreamDataDropped(_) => FRAME_TYPE_STREAM_DATA_DROPPED,
        }
    }

    /// Stream the frame refers to
    pub fn stream_id(&self) -> StreamId {
        match self {
            DeadlineFrame::DeadlineControl(f) => f.stream_id,
            DeadlineFrame::StreamDataDropped(f) => f.stream_id,
        }
    }

    /// Encoded size including the frame type
    pub fn encoded_len(&self) -> Result<usize, FrameError> {
        let len = match self {
            DeadlineFrame::DeadlineControl(f) => f.encoded_len()?,
            DeadlineFrame::StreamDataDropped(f) => f.encoded_len()?,
        };
        Ok(len)
    }

    /// Append the frame to `buf`
    ///
    /// Nothing is written if any field is out of varint range.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), FrameError> {
        self.encoded_len()?;
        varint::encode(buf, self.frame_type())?;
        match self {
            DeadlineFrame::DeadlineControl(f) => f.encode_body(buf)?,
            DeadlineFrame::StreamDataDropped(f) => f.encode_body(buf)?,
        }
        Ok(())
    }

    /// Serialize the frame into a fresh buffer
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len()?);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, FrameError> {
        let frame_type = varint::decode(buf).map_err(|source| FrameError::Malformed {
            frame: "frame type",
            source,
        })?;

        match frame_type {
            FRAME_TYPE_DEADLINE_CONTROL => {
                DeadlineControlFrame::decode_body(buf).map(DeadlineFrame::DeadlineControl)
            }
            FRAME_TYPE_STREAM_DATA_DROPPED => {
                StreamDataDroppedFrame::decode_body(buf).map(DeadlineFrame::StreamDataDropped)
            }
            other => Err(FrameError::UnknownType(other)),
        }
    }

    /// Decode every frame in `bytes`
    pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<DeadlineFrame>, FrameError> {
        let mut frames = Vec::new();
        while bytes.has_remaining() {
            frames.push(DeadlineFrame::decode(&mut bytes)?);
        }
        Ok(frames)
    }
}

impl From<DeadlineControlFrame> for DeadlineFrame {
    fn from(frame: DeadlineControlFrame) -> Self {
        DeadlineFrame::DeadlineControl(frame)
    }
}

impl From<StreamDataDroppedFrame> for DeadlineFrame {
    fn from(frame: StreamDataDroppedFrame) -> Self {
        DeadlineFrame::StreamDataDropped(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_control_wire_layout() {
        let frame = DeadlineFrame::from(DeadlineControlFrame::new(
            StreamId::new(4),
            Duration::from_millis(100),
        ));
        let bytes = frame.to_bytes().unwrap();

        // type, stream 4, 100 as a two-byte varint
        assert_eq!(&bytes[..], &[0x3d, 0x04, 0x40, 0x64]);
        assert_eq!(frame.encoded_len().unwrap(), 4);
    }

    #[test]
    fn test_stream_data_dropped_decode() {
        let wire = [0x3e, 0x08, 0x41, 0x00, 0x40, 0xc8];
        let frame = DeadlineFrame::decode(&mut &wire[..]).unwrap();

        assert_eq!(
            frame,
            DeadlineFrame::StreamDataDropped(StreamDataDroppedFrame {
                stream_id: StreamId::new(8),
                offset: 256,
                length: 200,
            })
        );
    }

    #[test]
    fn test_truncated_frame_is_malformed() {
        let wire = [0x3e, 0x08, 0x41];
        let err = DeadlineFrame::decode(&mut &wire[..]).unwrap_err();

        assert!(matches!(
            err,
            FrameError::Malformed {
                frame: "STREAM_DATA_DROPPED",
                ..
            }
        ));
        assert_eq!(err.error_code(), TransportErrorCode::FrameEncodingError);
    }

    #[test]
    fn test_unknown_frame_type() {
        let wire = [0x21, 0x00];
        assert_eq!(
            DeadlineFrame::decode(&mut &wire[..]),
            Err(FrameError::UnknownType(0x21))
        );
    }

    #[test]
    fn test_overflowing_range_rejected() {
        let mut buf = BytesMut::new();
        varint::encode(&mut buf, FRAME_TYPE_STREAM_DATA_DROPPED).unwrap();
        varint::encode(&mut buf, 0).unwrap();
        varint::encode(&mut buf, MAX_VARINT).unwrap();
        varint::encode(&mut buf, 1).unwrap();

        assert!(matches!(
            DeadlineFrame::decode_all(&buf),
            Err(FrameError::RangeOverflow { .. })
        ));
    }

    #[test]
    fn test_local_range_end_saturates() {
        let frame = StreamDataDroppedFrame {
            stream_id: StreamId::new(0),
            offset: u64::MAX - 1,
            length: 10,
        };
        assert_eq!(frame.end(), u64::MAX);
    }

    #[test]
    fn test_decode_all_sequence() {
        let mut buf = BytesMut::new();
        let control = DeadlineFrame::from(DeadlineControlFrame::new(
            StreamId::new(4),
            Duration::from_millis(50),
        ));
        let dropped = DeadlineFrame::from(StreamDataDroppedFrame {
            stream_id: StreamId::new(4),
            offset: 0,
            length: 1000,
        });
        control.encode(&mut buf).unwrap();
        dropped.encode(&mut buf).unwrap();

        let frames = DeadlineFrame::decode_all(&buf).unwrap();
        assert_eq!(frames, vec![control, dropped]);
    }

    #[test]
    fn test_encode_out_of_range_writes_nothing() {
        let frame = DeadlineFrame::from(StreamDataDroppedFrame {
            stream_id: StreamId::new(1),
            offset: MAX_VARINT + 1,
            length: 0,
        });
        let mut buf = BytesMut::new();
        assert!(frame.encode(&mut buf).is_err());
        assert!(buf.is_empty());
    }
}
