//! Protocol violations close the connection with the right code

mod common;

use bytes::Bytes;
use common::{ms, negotiated};
use dmtp::recv::ReassemblyError;
use dmtp::{Connection, ConnectionError, ConnectionState, StreamId};
use dmtp_protocol::{DeadlineConfig, DeadlineParameters, TransportErrorCode};

#[test]
fn test_truncated_frame() {
    let mut conn = negotiated(DeadlineConfig::default());
    // DEADLINE_CONTROL type with a missing deadline field
    let result = conn.handle_frames(&[0x3d, 0x04], ms(0));
    assert!(matches!(result, Err(ConnectionError::Frame(_))));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.close_error(), Some(TransportErrorCode::FrameEncodingError));
}

#[test]
fn test_unknown_frame_type() {
    let mut conn = negotiated(DeadlineConfig::default());
    assert!(conn.handle_frames(&[0x21], ms(0)).is_err());
    assert_eq!(conn.close_error(), Some(TransportErrorCode::FrameEncodingError));
}

#[test]
fn test_closed_connection_is_inert() {
    let mut conn = negotiated(DeadlineConfig::default());
    conn.add_data(StreamId::new(0), Bytes::from_static(b"queued"), false, ms(0))
        .unwrap();
    let _ = conn.handle_frames(&[0x3e], ms(0));

    assert!(conn.poll_transmit(1200, ms(1)).is_none());
    assert!(matches!(
        conn.handle_frames(&[], ms(1)),
        Err(ConnectionError::Closed)
    ));
}

#[test]
fn test_final_size_change() {
    let mut conn = negotiated(DeadlineConfig::default());
    let stream = StreamId::new(0);
    conn.on_stream_frame(stream, 0, Bytes::from(vec![0u8; 10]), true)
        .unwrap();
    let result = conn.on_stream_frame(stream, 10, Bytes::from(vec![0u8; 5]), false);

    assert!(matches!(result, Err(ConnectionError::FinalSize { .. })));
    assert_eq!(conn.close_error(), Some(TransportErrorCode::FinalSizeError));
}

#[test]
fn test_stream_offset_overflow() {
    let mut conn = negotiated(DeadlineConfig::default());
    let result = conn.on_stream_frame(StreamId::new(0), u64::MAX - 4, Bytes::from(vec![0u8; 16]), false);

    assert!(matches!(
        result,
        Err(ConnectionError::FinalSize {
            source: ReassemblyError::OffsetOverflow { length: 16, .. },
            ..
        })
    ));
    assert_eq!(conn.close_error(), Some(TransportErrorCode::FinalSizeError));
    assert_eq!(conn.stats().bytes_received, 0);
}

#[test]
fn test_parameter_with_value_rejected() {
    let mut conn = Connection::new(DeadlineConfig::default(), DeadlineParameters::enabled());
    // Deadline parameter id 0x7a5d carrying a one-byte value
    let result = conn.on_transport_parameter_bytes(&[0x80, 0x00, 0x7a, 0x5d, 0x01, 0x00], ms(0));

    assert!(matches!(result, Err(ConnectionError::Params(_))));
    assert_eq!(conn.close_error(), Some(TransportErrorCode::TransportParameterError));
}

#[test]
fn test_parameters_applied_once() {
    let mut conn = negotiated(DeadlineConfig::default());
    assert!(matches!(
        conn.on_transport_parameters(&DeadlineParameters::enabled(), ms(1)),
        Err(ConnectionError::InvalidState)
    ));
}
