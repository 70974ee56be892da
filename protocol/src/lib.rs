#![cfg_attr(not(feature = "std"), no_std)]
#![allow(async_fn_in_trait)]

#[cfg(feature = "std")]
extern crate std;

pub mod command;
pub mod hex;
pub mod i2c;
pub mod line;
pub mod serial;
pub mod shell;
pub mod stream;
pub mod timing;

pub use command::{ParseError, Reply, Request};
pub use i2c::{BusDriver, Direction, DmaOutcome, I2cEngine, I2cError, I2cMaster, Phase};
pub use line::LineBuffer;
pub use serial::{LinkError, PacketRx, PacketTx, PendingWork, SerialPort, Work};
pub use shell::Shell;
pub use stream::ByteStream;
pub use timing::{BusSpeed, Timing, TimingError};

/// USB full-speed bulk packet size for both data endpoints
pub const PACKET_SIZE: usize = 64;

/// Capacity of each direction's byte stream
pub const STREAM_CAPACITY: usize = 512;

/// Longest command line kept; the longest valid `WRITE_WRITE` is 278 characters
pub const LINE_CAPACITY: usize = 320;

/// Maximum payload of a single command phase
pub const MAX_PAYLOAD: usize = 64;

/// Longest single DMA chunk (NBYTES is an 8-bit field)
pub const MAX_CHUNK: usize = 255;

/// How long one chunk may take before the engine gives up on it
pub const TRANSFER_TIMEOUT_MS: u32 = 1000;

/// Longest reply line: `DATA ` + 128 hex digits + CRLF
pub const REPLY_CAPACITY: usize = 5 + 2 * MAX_PAYLOAD + 2;
