use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::time::timeout;

mod commands;
mod error;
mod serial;

use commands::{BridgeCommands, OffsetWidth, SCAN_FIRST, SCAN_LAST};
use serial::SerialConnection;

#[derive(Parser)]
#[command(name = "i2c-bridge")]
#[command(about = "Drive an I2C bus through the STM32G4 USB-I2C bridge")]
#[command(version = "0.1.0")]
struct Cli {
    /// Serial port to connect to
    #[arg(short, long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Baud rate (ignored for USB CDC, but kept for compatibility)
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Time to wait for each reply, e.g. "2s" or "500ms"
    #[arg(short, long, default_value = "3s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the bridge answers
    Ping,
    /// Read bytes from a device
    Read {
        /// 7-bit device address (hex)
        #[arg(value_parser = parse_address)]
        address: u8,
        /// Number of bytes, 1-64
        length: usize,
    },
    /// Write bytes to a device
    Write {
        /// 7-bit device address (hex)
        #[arg(value_parser = parse_address)]
        address: u8,
        /// Data as hex, e.g. 00ff10
        #[arg(value_parser = parse_bytes)]
        data: HexBytes,
    },
    /// Write, then read after a repeated START
    WriteRead {
        /// 7-bit device address (hex)
        #[arg(value_parser = parse_address)]
        address: u8,
        /// Data as hex
        #[arg(value_parser = parse_bytes)]
        data: HexBytes,
        /// Number of bytes to read, 1-64
        length: usize,
    },
    /// Two writes joined by a repeated START
    WriteWrite {
        /// 7-bit device address (hex)
        #[arg(value_parser = parse_address)]
        address: u8,
        /// First write as hex
        #[arg(value_parser = parse_bytes)]
        first: HexBytes,
        /// Second write as hex
        #[arg(value_parser = parse_bytes)]
        second: HexBytes,
    },
    /// Probe every non-reserved address
    Scan,
    /// Read a register range (EEPROM, sensor map) into a hex dump or file
    Dump {
        /// 7-bit device address (hex)
        #[arg(value_parser = parse_address)]
        address: u8,
        /// First register, decimal or 0x-prefixed hex
        #[arg(short, long, value_parser = parse_hex, default_value = "0")]
        offset: u32,
        /// Number of bytes, decimal or 0x-prefixed hex
        #[arg(short, long, value_parser = parse_hex, default_value = "0x100")]
        size: u32,
        /// Device uses two-byte register addresses
        #[arg(short, long)]
        wide: bool,
        /// Write raw bytes here instead of printing a dump
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    if s.starts_with("0x") || s.starts_with("0X") {
        u32::from_str_radix(&s[2..], 16)
    } else {
        s.parse()
    }
}

fn parse_address(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    let address = u8::from_str_radix(digits, 16).map_err(|e| e.to_string())?;
    if (0x01..=0x7f).contains(&address) {
        Ok(address)
    } else {
        Err(format!("0x{:02x} is not a 7-bit address", address))
    }
}

/// Command-line byte string, given as hex.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HexBytes(Vec<u8>);

fn parse_bytes(s: &str) -> Result<HexBytes, hex::FromHexError> {
    hex::decode(s.trim_start_matches("0x")).map(HexBytes)
}

/// Classic 16-bytes-per-row hex dump, rows labelled with register offsets.
fn format_dump(offset: u32, data: &[u8]) -> String {
    let mut out = String::new();

    for (row, chunk) in data.chunks(16).enumerate() {
        let ascii: String = chunk
            .iter()
            .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
            .collect();
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        out.push_str(&format!(
            "{:04x}: {:<47}  {}\n",
            offset as usize + row * 16,
            bytes.join(" "),
            ascii
        ));
    }

    out
}

fn progress_bar(length: u64, template: &str) -> ProgressBar {
    let pb = ProgressBar::new(length);
    if let Ok(style) = ProgressStyle::default_bar().template(template) {
        pb.set_style(style);
    }
    pb
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    println!("Connecting to {}...", cli.port);

    let mut connection = timeout(
        cli.timeout,
        SerialConnection::new(&cli.port, cli.baud, cli.timeout),
    )
    .await
    .context("Connection timeout")?
    .context("Failed to connect to bridge")?;

    connection.resync().await?;

    let mut bridge = BridgeCommands::new(&mut connection);

    match cli.command {
        Commands::Ping => {
            bridge.ping().await.context("Bridge did not answer PING")?;
            println!("OK");
        }

        Commands::Read { address, length } => {
            let data = bridge
                .read(address, length)
                .await
                .with_context(|| format!("Read from 0x{:02x} failed", address))?;
            println!("{}", hex::encode(data));
        }

        Commands::Write { address, data } => {
            bridge
                .write(address, &data.0)
                .await
                .with_context(|| format!("Write to 0x{:02x} failed", address))?;
            println!("OK");
        }

        Commands::WriteRead {
            address,
            data,
            length,
        } => {
            let data = bridge
                .write_read(address, &data.0, length)
                .await
                .with_context(|| format!("Write-read on 0x{:02x} failed", address))?;
            println!("{}", hex::encode(data));
        }

        Commands::WriteWrite {
            address,
            first,
            second,
        } => {
            bridge
                .write_write(address, &first.0, &second.0)
                .await
                .with_context(|| format!("Write-write on 0x{:02x} failed", address))?;
            println!("OK");
        }

        Commands::Scan => {
            let pb = progress_bar(
                (SCAN_LAST - SCAN_FIRST + 1) as u64,
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            );
            let found = bridge.scan(&pb).await?;
            pb.finish_and_clear();

            if found.is_empty() {
                println!("No devices found");
            }
            for address in found {
                println!("0x{:02x}", address);
            }
        }

        Commands::Dump {
            address,
            offset,
            size,
            wide,
            file,
        } => {
            let width = if wide { OffsetWidth::Two } else { OffsetWidth::One };
            if size == 0 || offset as u64 + size as u64 > width.limit() as u64 {
                bail!(
                    "range 0x{:x}+0x{:x} does not fit a {}-byte register address",
                    offset,
                    size,
                    if wide { 2 } else { 1 }
                );
            }

            let pb = progress_bar(
                size as u64,
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            );
            let data = bridge
                .dump(address, offset, size as usize, width, &pb)
                .await
                .with_context(|| format!("Dump of 0x{:02x} failed", address))?;
            pb.finish_and_clear();

            match file {
                Some(path) => {
                    fs::write(&path, &data)
                        .await
                        .with_context(|| format!("Failed to write file: {:?}", path))?;
                    println!("Saved {} bytes to {:?}", data.len(), path);
                }
                None => print!("{}", format_dump(offset, &data)),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("50"), Ok(0x50));
        assert_eq!(parse_address("0x3c"), Ok(0x3c));
        assert!(parse_address("0").is_err());
        assert!(parse_address("80").is_err());
        assert!(parse_address("zz").is_err());
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("00ff10").unwrap().0, vec![0x00, 0xff, 0x10]);
        assert_eq!(parse_bytes("0xAB").unwrap().0, vec![0xab]);
        assert!(parse_bytes("abc").is_err());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x100"), Ok(256));
        assert_eq!(parse_hex("64"), Ok(64));
    }

    #[test]
    fn test_format_dump() {
        let data: Vec<u8> = (0x41..0x41 + 18).collect();
        let dump = format_dump(0x20, &data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0020: 41 42 43"));
        assert!(lines[0].ends_with("ABCDEFGHIJKLMNOP"));
        assert!(lines[1].starts_with("0030: 51 52"));
        assert!(lines[1].ends_with("QR"));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "i2c-bridge",
            "--timeout",
            "500ms",
            "write-read",
            "50",
            "0010",
            "8",
        ])
        .unwrap();
        assert_eq!(cli.timeout, Duration::from_millis(500));
        match cli.command {
            Commands::WriteRead {
                address,
                data,
                length,
            } => {
                assert_eq!(address, 0x50);
                assert_eq!(data.0, vec![0x00, 0x10]);
                assert_eq!(length, 8);
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
