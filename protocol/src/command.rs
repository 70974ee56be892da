//! Line protocol: requests from the host and the replies to them.
//!
//! ```text
//! PING
//! READ aa nn
//! WRITE aa nn <2nn hex>
//! WRITE_READ aa n1 <2n1 hex> n2
//! WRITE_WRITE aa n1 <2n1 hex> n2 <2n2 hex>
//! ```
//!
//! `aa` is a 7-bit address as two lowercase hex digits, lengths are decimal
//! in `1..=64`. Replies are `OK`, `ERROR` or `DATA <hex>`, each ending in CRLF.

use core::fmt;

use heapless::Vec;

use crate::hex::{self, HexError};
use crate::{MAX_PAYLOAD, REPLY_CAPACITY};

pub type Payload = Vec<u8, MAX_PAYLOAD>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// Blank line
    Empty,
    /// First token is not a known keyword
    UnknownCommand,
    /// Line ended before all arguments were seen
    MissingArgument,
    /// Arguments left over after a complete command
    TrailingArgument,
    /// Address is not two hex digits in `0x01..=0x7f`
    InvalidAddress,
    /// Length is not a decimal number in `1..=64`
    InvalidLength,
    /// Payload does not decode to the announced length
    InvalidData(HexError),
    /// Reply line is none of `OK`, `ERROR`, `DATA`
    UnexpectedReply,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty line"),
            ParseError::UnknownCommand => write!(f, "unknown command"),
            ParseError::MissingArgument => write!(f, "missing argument"),
            ParseError::TrailingArgument => write!(f, "unexpected trailing argument"),
            ParseError::InvalidAddress => write!(f, "invalid address"),
            ParseError::InvalidLength => write!(f, "invalid length"),
            ParseError::InvalidData(e) => write!(f, "invalid data: {}", e),
            ParseError::UnexpectedReply => write!(f, "unexpected reply"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ParseError {}

impl From<HexError> for ParseError {
    fn from(e: HexError) -> Self {
        ParseError::InvalidData(e)
    }
}

/// A validated command, ready for the I2C engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    Read {
        address: u8,
        length: usize,
    },
    Write {
        address: u8,
        data: Payload,
    },
    WriteRead {
        address: u8,
        data: Payload,
        length: usize,
    },
    WriteWrite {
        address: u8,
        first: Payload,
        second: Payload,
    },
}

struct Tokens<'a> {
    inner: core::str::Split<'a, char>,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self {
            inner: line.split(' '),
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        self.inner.by_ref().find(|t| !t.is_empty())
    }

    fn require(&mut self) -> Result<&'a str, ParseError> {
        self.next().ok_or(ParseError::MissingArgument)
    }

    fn address(&mut self) -> Result<u8, ParseError> {
        let token = self.require()?;
        match hex::decode_byte(token.as_bytes()) {
            Ok(address @ 0x01..=0x7f) => Ok(address),
            _ => Err(ParseError::InvalidAddress),
        }
    }

    fn length(&mut self) -> Result<usize, ParseError> {
        let token = self.require()?;
        if token.is_empty() || token.len() > 2 || !token.bytes().all(|c| c.is_ascii_digit()) {
            return Err(ParseError::InvalidLength);
        }

        let length = token
            .bytes()
            .fold(0usize, |acc, c| acc * 10 + (c - b'0') as usize);
        if (1..=MAX_PAYLOAD).contains(&length) {
            Ok(length)
        } else {
            Err(ParseError::InvalidLength)
        }
    }

    fn payload(&mut self, length: usize) -> Result<Payload, ParseError> {
        let token = self.require()?;
        if token.len() != length * 2 {
            return Err(ParseError::InvalidData(HexError::OddLength));
        }

        let mut buffer = [0u8; MAX_PAYLOAD];
        let n = hex::decode(token.as_bytes(), &mut buffer)?;
        Vec::from_slice(&buffer[..n]).map_err(|_| ParseError::InvalidData(HexError::BufferTooSmall))
    }
}

impl Request {
    /// Parse one command line (without its terminator).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut tokens = Tokens::new(line);
        let action = tokens.next().ok_or(ParseError::Empty)?;

        let request = match action {
            // Anything after PING is ignored.
            "PING" => return Ok(Request::Ping),
            "READ" => {
                let address = tokens.address()?;
                let length = tokens.length()?;
                Request::Read { address, length }
            }
            "WRITE" => {
                let address = tokens.address()?;
                let length = tokens.length()?;
                let data = tokens.payload(length)?;
                Request::Write { address, data }
            }
            "WRITE_READ" => {
                let address = tokens.address()?;
                let length = tokens.length()?;
                let data = tokens.payload(length)?;
                let length = tokens.length()?;
                Request::WriteRead {
                    address,
                    data,
                    length,
                }
            }
            "WRITE_WRITE" => {
                let address = tokens.address()?;
                let length = tokens.length()?;
                let first = tokens.payload(length)?;
                let length = tokens.length()?;
                let second = tokens.payload(length)?;
                Request::WriteWrite {
                    address,
                    first,
                    second,
                }
            }
            _ => return Err(ParseError::UnknownCommand),
        };

        if tokens.next().is_some() {
            return Err(ParseError::TrailingArgument);
        }

        Ok(request)
    }

    /// Render the command line the device expects, including CRLF.
    pub fn write_line<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        match self {
            Request::Ping => out.write_str("PING")?,
            Request::Read { address, length } => write!(out, "READ {:02x} {:02}", address, length)?,
            Request::Write { address, data } => {
                write!(out, "WRITE {:02x} ", address)?;
                write_payload(out, data)?;
            }
            Request::WriteRead {
                address,
                data,
                length,
            } => {
                write!(out, "WRITE_READ {:02x} ", address)?;
                write_payload(out, data)?;
                write!(out, " {:02}", length)?;
            }
            Request::WriteWrite {
                address,
                first,
                second,
            } => {
                write!(out, "WRITE_WRITE {:02x} ", address)?;
                write_payload(out, first)?;
                out.write_char(' ')?;
                write_payload(out, second)?;
            }
        }
        out.write_str("\r\n")
    }
}

fn write_payload<W: fmt::Write>(out: &mut W, data: &[u8]) -> fmt::Result {
    write!(out, "{:02} ", data.len())?;
    for byte in data {
        write!(out, "{:02x}", byte)?;
    }
    Ok(())
}

/// Device response to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Data(Payload),
    Error,
}

impl Reply {
    /// Serialize reply to bytes
    pub fn to_bytes(&self) -> Vec<u8, REPLY_CAPACITY> {
        let mut bytes = Vec::new();
        match self {
            Reply::Ok => {
                bytes.extend_from_slice(b"OK\r\n").ok();
            }
            Reply::Error => {
                bytes.extend_from_slice(b"ERROR\r\n").ok();
            }
            Reply::Data(data) => {
                let mut text = [0u8; 2 * MAX_PAYLOAD];
                let n = hex::encode(data, &mut text).unwrap_or(0);
                bytes.extend_from_slice(b"DATA ").ok();
                bytes.extend_from_slice(&text[..n]).ok();
                bytes.extend_from_slice(b"\r\n").ok();
            }
        }
        bytes
    }

    /// Parse a reply line; trailing CR/LF is ignored.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        match line {
            "OK" => Ok(Reply::Ok),
            "ERROR" => Ok(Reply::Error),
            _ => {
                let text = line.strip_prefix("DATA ").ok_or(ParseError::UnexpectedReply)?;
                let mut buffer = [0u8; MAX_PAYLOAD];
                let n = hex::decode(text.as_bytes(), &mut buffer)?;
                Vec::from_slice(&buffer[..n])
                    .map(Reply::Data)
                    .map_err(|_| ParseError::InvalidData(HexError::BufferTooSmall))
            }
        }
    }
}
