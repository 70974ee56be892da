use std::time::Duration;

use i2c_bridge_protocol::MAX_PAYLOAD;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device replied ERROR (NACK, bus fault or rejected command)")]
    Device,

    #[error("unexpected reply from device: {0:?}")]
    UnexpectedReply(String),

    #[error("expected {expected} data bytes, device returned {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("no reply within {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    #[error("reply line too long")]
    LineTooLong,

    #[error("payload must be 1..={max} bytes, got {0}", max = MAX_PAYLOAD)]
    PayloadLength(usize),

    #[error("I2C address 0x{0:02x} outside 0x01..=0x7f")]
    Address(u8),
}
