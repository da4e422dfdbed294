use std::io;

use thiserror::Error;

/// Failure taxonomy for the UVC function.
///
/// `MalformedEvent` and `ProtocolViolation` are recoverable per event:
/// the offending event is dropped or answered with a stall and the
/// session loop continues. `DeviceIo` is recoverable for per-event
/// operations but fatal for open/subscribe. `BackpressureTimeout` is
/// informational; the frame pump keeps waiting.
#[derive(Debug, Error)]
pub enum UvcError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("device i/o failed ({op}): {source}")]
    DeviceIo {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("no free buffer after {0} poll cycles")]
    BackpressureTimeout(u32),
}

impl UvcError {
    pub fn io(op: &'static str, err: impl Into<io::Error>) -> UvcError {
        UvcError::DeviceIo { op, source: err.into() }
    }
}

pub type Result<T> = std::result::Result<T, UvcError>;
