//! Shared helpers for the integration tests

#![allow(dead_code)]

use dmtp::{Connection, StreamEvent, Transmit};
use dmtp_protocol::{DeadlineConfig, DeadlineParameters, Timestamp};
use std::sync::Once;

static TRACING: Once = Once::new();

/// Route engine logs to the test harness, filtered by `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn ms(v: u64) -> Timestamp {
    Timestamp::from_millis(v)
}

/// Connection with the deadline extension negotiated at t=0
pub fn negotiated(config: DeadlineConfig) -> Connection {
    init_tracing();
    let mut conn = Connection::new(config, DeadlineParameters::enabled());
    conn.on_transport_parameters(&DeadlineParameters::enabled(), ms(0))
        .unwrap();
    conn
}

/// Hand a packet to the receiving side, control frames first
pub fn deliver(receiver: &mut Connection, transmit: &Transmit, now: Timestamp) {
    let control = transmit.encode_control().unwrap();
    if !control.is_empty() {
        receiver.handle_frames(&control, now).unwrap();
    }
    if let Some(frame) = &transmit.stream {
        receiver
            .on_stream_frame(frame.stream_id, frame.offset, frame.data.clone(), frame.fin)
            .unwrap();
    }
}

pub fn drain_events(conn: &mut Connection) -> Vec<StreamEvent> {
    std::iter::from_fn(|| conn.poll_event()).collect()
}
