use crate::error::BridgeError;
use crate::serial::SerialConnection;
use anyhow::Result;
use i2c_bridge_protocol::command::Payload;
use i2c_bridge_protocol::{Reply, Request, MAX_PAYLOAD};
use indicatif::ProgressBar;

/// First and last address probed by `scan`; the rest are reserved.
pub const SCAN_FIRST: u8 = 0x08;
pub const SCAN_LAST: u8 = 0x77;

pub struct BridgeCommands<'a> {
    connection: &'a mut SerialConnection,
}

impl<'a> BridgeCommands<'a> {
    pub fn new(connection: &'a mut SerialConnection) -> Self {
        Self { connection }
    }

    pub async fn ping(&mut self) -> Result<()> {
        let reply = self.connection.transact(&Request::Ping).await?;
        expect_ok(reply)
    }

    pub async fn read(&mut self, address: u8, length: usize) -> Result<Vec<u8>> {
        let request = Request::Read {
            address: check_address(address)?,
            length: check_length(length)?,
        };
        let reply = self.connection.transact(&request).await?;
        expect_data(reply, length)
    }

    pub async fn write(&mut self, address: u8, data: &[u8]) -> Result<()> {
        let request = Request::Write {
            address: check_address(address)?,
            data: payload(data)?,
        };
        let reply = self.connection.transact(&request).await?;
        expect_ok(reply)
    }

    pub async fn write_read(&mut self, address: u8, data: &[u8], length: usize) -> Result<Vec<u8>> {
        let request = Request::WriteRead {
            address: check_address(address)?,
            data: payload(data)?,
            length: check_length(length)?,
        };
        let reply = self.connection.transact(&request).await?;
        expect_data(reply, length)
    }

    pub async fn write_write(&mut self, address: u8, first: &[u8], second: &[u8]) -> Result<()> {
        let request = Request::WriteWrite {
            address: check_address(address)?,
            first: payload(first)?,
            second: payload(second)?,
        };
        let reply = self.connection.transact(&request).await?;
        expect_ok(reply)
    }

    /// Whether a device acknowledges its address (one-byte read).
    pub async fn probe(&mut self, address: u8) -> Result<bool> {
        match self.read(address, 1).await {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.downcast_ref::<BridgeError>(), Some(BridgeError::Device)) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn scan(&mut self, progress: &ProgressBar) -> Result<Vec<u8>> {
        let mut found = Vec::new();

        for address in SCAN_FIRST..=SCAN_LAST {
            progress.set_message(format!("0x{:02x}", address));
            if self.probe(address).await? {
                found.push(address);
            }
            progress.inc(1);
        }

        Ok(found)
    }

    /// Read `length` bytes starting at register `offset`, in
    /// `MAX_PAYLOAD`-sized pieces, each addressed with its own offset.
    pub async fn dump(
        &mut self,
        address: u8,
        offset: u32,
        length: usize,
        width: OffsetWidth,
        progress: &ProgressBar,
    ) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(length);

        for (start, size) in plan_reads(offset, length) {
            let register = width.encode(start);
            let chunk = self.write_read(address, &register, size).await?;
            data.extend_from_slice(&chunk);
            progress.inc(size as u64);
        }

        Ok(data)
    }
}

/// Register address size of the target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetWidth {
    One,
    Two,
}

impl OffsetWidth {
    /// Big-endian register address, truncated to the width.
    pub fn encode(self, offset: u32) -> Vec<u8> {
        match self {
            OffsetWidth::One => vec![offset as u8],
            OffsetWidth::Two => (offset as u16).to_be_bytes().to_vec(),
        }
    }

    pub fn limit(self) -> u32 {
        match self {
            OffsetWidth::One => 0x100,
            OffsetWidth::Two => 0x1_0000,
        }
    }
}

/// Split `length` bytes at `offset` into `(offset, size)` reads of at most
/// `MAX_PAYLOAD` bytes.
pub fn plan_reads(offset: u32, length: usize) -> Vec<(u32, usize)> {
    let mut reads = Vec::new();
    let mut done = 0;

    while done < length {
        let size = (length - done).min(MAX_PAYLOAD);
        reads.push((offset + done as u32, size));
        done += size;
    }

    reads
}

fn check_address(address: u8) -> Result<u8, BridgeError> {
    if (0x01..=0x7f).contains(&address) {
        Ok(address)
    } else {
        Err(BridgeError::Address(address))
    }
}

fn check_length(length: usize) -> Result<usize, BridgeError> {
    if (1..=MAX_PAYLOAD).contains(&length) {
        Ok(length)
    } else {
        Err(BridgeError::PayloadLength(length))
    }
}

fn payload(data: &[u8]) -> Result<Payload, BridgeError> {
    check_length(data.len())?;
    Payload::from_slice(data).map_err(|_| BridgeError::PayloadLength(data.len()))
}

fn expect_ok(reply: Reply) -> Result<()> {
    match reply {
        Reply::Ok => Ok(()),
        Reply::Error => Err(BridgeError::Device.into()),
        Reply::Data(data) => {
            Err(BridgeError::UnexpectedReply(format!("DATA {}", hex::encode(&data))).into())
        }
    }
}

fn expect_data(reply: Reply, length: usize) -> Result<Vec<u8>> {
    match reply {
        Reply::Data(data) if data.len() == length => Ok(data.to_vec()),
        Reply::Data(data) => Err(BridgeError::LengthMismatch {
            expected: length,
            actual: data.len(),
        }
        .into()),
        Reply::Error => Err(BridgeError::Device.into()),
        Reply::Ok => Err(BridgeError::UnexpectedReply("OK".to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_reads_splits_at_max_payload() {
        assert_eq!(plan_reads(0x10, 150), vec![(0x10, 64), (0x50, 64), (0x90, 22)]);
        assert_eq!(plan_reads(0, 64), vec![(0, 64)]);
        assert!(plan_reads(0, 0).is_empty());
    }

    #[test]
    fn test_offset_width_encoding() {
        assert_eq!(OffsetWidth::One.encode(0x1234), vec![0x34]);
        assert_eq!(OffsetWidth::Two.encode(0x1234), vec![0x12, 0x34]);
    }

    #[test]
    fn test_argument_checks() {
        assert!(check_address(0x00).is_err());
        assert!(check_address(0x80).is_err());
        assert_eq!(check_address(0x50).unwrap(), 0x50);
        assert!(check_length(0).is_err());
        assert!(check_length(65).is_err());
        assert!(payload(&[0u8; 64]).is_ok());
        assert!(payload(&[]).is_err());
    }

    #[test]
    fn test_reply_expectations() {
        assert!(expect_ok(Reply::Ok).is_ok());
        let err = expect_ok(Reply::Error).unwrap_err();
        assert!(matches!(err.downcast_ref::<BridgeError>(), Some(BridgeError::Device)));

        let data = Payload::from_slice(&[1, 2, 3]).unwrap();
        assert_eq!(expect_data(Reply::Data(data.clone()), 3).unwrap(), vec![1, 2, 3]);
        let err = expect_data(Reply::Data(data), 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::LengthMismatch { expected: 4, actual: 3 })
        ));
    }
}
