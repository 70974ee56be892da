use anyhow::{Context, Result};
use i2c_bridge_protocol::{Reply, Request};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::SerialStream;

use crate::error::BridgeError;

/// Longest line the device can produce, with some slack for noise.
const MAX_LINE: usize = 512;

pub struct SerialConnection {
    port: SerialStream,
    timeout: Duration,
    received: Vec<u8>,
}

impl SerialConnection {
    pub async fn new(port_name: &str, baud_rate: u32, reply_timeout: Duration) -> Result<Self> {
        let port = SerialStream::open(&tokio_serial::new(port_name, baud_rate))
            .with_context(|| format!("Failed to open serial port: {}", port_name))?;

        Ok(Self {
            port,
            timeout: reply_timeout,
            received: Vec::new(),
        })
    }

    pub async fn send_request(&mut self, request: &Request) -> Result<()> {
        let mut line = String::new();
        request
            .write_line(&mut line)
            .context("Failed to render command line")?;

        self.port
            .write_all(line.as_bytes())
            .await
            .context("Failed to write command to serial port")?;

        Ok(())
    }

    pub async fn receive_reply(&mut self) -> Result<Reply> {
        let mut temp_buf = [0u8; 256];

        loop {
            if let Some(line) = take_line(&mut self.received) {
                return Reply::parse(&line).map_err(|_| BridgeError::UnexpectedReply(line).into());
            }

            if self.received.len() > MAX_LINE {
                self.received.clear();
                return Err(BridgeError::LineTooLong.into());
            }

            match timeout(self.timeout, self.port.read(&mut temp_buf)).await {
                Ok(Ok(n)) if n > 0 => self.received.extend_from_slice(&temp_buf[..n]),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e).context("Serial read error"),
                Err(_) => return Err(BridgeError::Timeout(self.timeout).into()),
            }
        }
    }

    /// Send one command and wait for its reply line.
    pub async fn transact(&mut self, request: &Request) -> Result<Reply> {
        self.send_request(request).await?;
        self.receive_reply().await
    }

    /// Drop anything left over from an earlier, interrupted session.
    pub async fn resync(&mut self) -> Result<()> {
        self.received.clear();
        // A bare CRLF is an empty line: the device ignores it.
        self.port
            .write_all(b"\r\n")
            .await
            .context("Failed to write to serial port")?;

        let mut temp_buf = [0u8; 256];
        while let Ok(Ok(n)) =
            timeout(Duration::from_millis(50), self.port.read(&mut temp_buf)).await
        {
            if n == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Split the first CRLF- or LF-terminated line off `buffer`.
///
/// Blank lines are skipped; the terminator is not part of the result.
fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    loop {
        let end = buffer.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = buffer.drain(..=end).collect();
        let text = String::from_utf8_lossy(&raw);
        let line = text.trim_end_matches(['\r', '\n']);
        if !line.is_empty() {
            return Some(line.to_string());
        }
    }
}
