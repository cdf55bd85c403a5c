//! Transport parameter negotiation
//!
//! The deadline extension is advertised with a single boolean transport
//! parameter and only activates when both endpoints send it.

use crate::varint::{self, VarIntError};
use bytes::{Buf, BufMut};
use thiserror::Error;

/// Transport parameter id of `enable_deadline_aware_streams`
pub const PARAM_ENABLE_DEADLINE_AWARE_STREAMS: u64 = 0x7a5d;

/// Transport parameter errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamsError {
    #[error("Malformed transport parameter: {0}")]
    Malformed(#[from] VarIntError),

    #[error("enable_deadline_aware_streams must be empty, got {0} bytes")]
    UnexpectedValue(u64),
}

/// Deadline-related transport parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeadlineParameters {
    /// Endpoint supports deadline-aware streams
    pub enable_deadline_aware_streams: bool,
}

impl DeadlineParameters {
    /// Parameters advertising support
    pub fn enabled() -> Self {
        DeadlineParameters {
            enable_deadline_aware_streams: true,
        }
    }

    /// Negotiate with the peer's parameters (both must advertise)
    pub fn negotiate(&self, peer: &DeadlineParameters) -> DeadlineParameters {
        DeadlineParameters {
            enable_deadline_aware_streams: self.enable_deadline_aware_streams
                && peer.enable_deadline_aware_streams,
        }
    }

    /// Append the parameter entry to `buf` (nothing when disabled)
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), ParamsError> {
        if self.enable_deadline_aware_streams {
            varint::encode(buf, PARAM_ENABLE_DEADLINE_AWARE_STREAMS)?;
            varint::encode(buf, 0)?;
        }
        Ok(())
    }

    /// Scan a transport parameter block for the deadline parameter
    ///
    /// Unknown parameters are skipped, as QUIC requires.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, ParamsError> {
        let mut params = DeadlineParameters::default();

        while buf.has_remaining() {
            let id = varint::decode(buf)?;
            let len = varint::decode(buf)?;
            if (buf.remaining() as u64) < len {
                return Err(ParamsError::Malformed(VarIntError::Truncated {
                    needed: usize::try_from(len).unwrap_or(usize::MAX),
                    available: buf.remaining(),
                }));
            }

            if id == PARAM_ENABLE_DEADLINE_AWARE_STREAMS {
                if len != 0 {
                    return Err(ParamsError::UnexpectedValue(len));
                }
                params.enable_deadline_aware_streams = true;
            } else {
                buf.advance(len as usize);
            }
        }

        Ok(params)
    }
}
