//! Command shell: assemble lines from the serial port, run them against the
//! I2C master and answer with one reply line each.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::command::{Payload, Reply, Request};
use crate::i2c::I2cMaster;
use crate::line::LineBuffer;
use crate::serial::SerialPort;
use crate::{LINE_CAPACITY, MAX_PAYLOAD};

pub struct Shell<'a, M: RawMutex, const N: usize, I: I2cMaster> {
    port: &'a SerialPort<M, N>,
    bus: I,
    line: LineBuffer<LINE_CAPACITY>,
}

impl<'a, M: RawMutex, const N: usize, I: I2cMaster> Shell<'a, M, N, I> {
    pub fn new(port: &'a SerialPort<M, N>, bus: I) -> Self {
        Self {
            port,
            bus,
            line: LineBuffer::new(),
        }
    }

    /// Serve commands forever.
    pub async fn run(&mut self) -> ! {
        loop {
            self.step().await;
        }
    }

    /// Consume one byte from the host; answer if it completed a line.
    pub async fn step(&mut self) {
        let mut byte = [0u8; 1];
        if self.port.recv(&mut byte).await == 0 {
            return;
        }

        let Some(line) = self.line.push(byte[0]) else {
            return;
        };

        let reply = execute(&mut self.bus, line).await;
        self.port.send(&reply.to_bytes()).await;
    }

    pub fn bus(&self) -> &I {
        &self.bus
    }
}

/// Run one command line. Malformed lines never reach the bus.
pub async fn execute<I: I2cMaster>(bus: &mut I, line: &str) -> Reply {
    let request = match Request::parse(line) {
        Ok(request) => request,
        Err(_e) => {
            #[cfg(feature = "defmt")]
            defmt::debug!("shell: rejected line: {}", _e);
            return Reply::Error;
        }
    };

    let result = match &request {
        Request::Ping => return Reply::Ok,
        Request::Read { address, length } => {
            let Some(mut data) = zeroed(*length) else {
                return Reply::Error;
            };
            bus.read(*address, &mut data).await.map(|_| Some(data))
        }
        Request::Write { address, data } => bus.write(*address, data).await.map(|_| None),
        Request::WriteRead {
            address,
            data,
            length,
        } => {
            let Some(mut buffer) = zeroed(*length) else {
                return Reply::Error;
            };
            bus.write_read(*address, data, &mut buffer)
                .await
                .map(|_| Some(buffer))
        }
        Request::WriteWrite {
            address,
            first,
            second,
        } => bus.write_write(*address, first, second).await.map(|_| None),
    };

    match result {
        Ok(Some(data)) => Reply::Data(data),
        Ok(None) => Reply::Ok,
        Err(_e) => {
            #[cfg(feature = "defmt")]
            defmt::debug!("shell: {}", _e);
            Reply::Error
        }
    }
}

/// Read buffer of `length` zero bytes, if it fits a payload.
fn zeroed(length: usize) -> Option<Payload> {
    let zeros = [0u8; MAX_PAYLOAD];
    Payload::from_slice(zeros.get(..length)?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i2c::mock::{self, Answer};
    use crate::i2c::{Direction, I2cError, Phase};
    use crate::serial::{LinkError, PacketRx, PacketTx};
    use crate::PACKET_SIZE;
    use core::cell::RefCell;
    use embassy_futures::block_on;
    use embassy_futures::select::{select, Either};
    use embassy_futures::yield_now;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_sync::signal::Signal;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Read(u8, usize),
        Write(u8, Vec<u8>),
        WriteRead(u8, Vec<u8>, usize),
        WriteWrite(u8, Vec<u8>, Vec<u8>),
    }

    #[derive(Default)]
    struct FakeBus {
        calls: Vec<Call>,
        device: Vec<u8>,
        fail: Option<Phase>,
    }

    impl FakeBus {
        fn answering(device: &[u8]) -> Self {
            Self {
                device: device.to_vec(),
                ..Default::default()
            }
        }

        fn failing(phase: Phase) -> Self {
            Self {
                fail: Some(phase),
                ..Default::default()
            }
        }

        fn outcome(&self, requested: usize) -> Result<(), I2cError> {
            match self.fail {
                Some(phase) => Err(I2cError {
                    phase,
                    requested,
                    transferred: 0,
                }),
                None => Ok(()),
            }
        }

        fn fill(&self, buffer: &mut [u8]) {
            for (slot, byte) in buffer.iter_mut().zip(self.device.iter().cycle()) {
                *slot = *byte;
            }
        }
    }

    impl I2cMaster for FakeBus {
        async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), I2cError> {
            self.calls.push(Call::Read(address, buffer.len()));
            self.fill(buffer);
            self.outcome(buffer.len())
        }

        async fn write(&mut self, address: u8, data: &[u8]) -> Result<(), I2cError> {
            self.calls.push(Call::Write(address, data.to_vec()));
            self.outcome(data.len())
        }

        async fn write_read(
            &mut self,
            address: u8,
            data: &[u8],
            buffer: &mut [u8],
        ) -> Result<(), I2cError> {
            self.calls.push(Call::WriteRead(address, data.to_vec(), buffer.len()));
            self.fill(buffer);
            self.outcome(buffer.len())
        }

        async fn write_write(
            &mut self,
            address: u8,
            first: &[u8],
            second: &[u8],
        ) -> Result<(), I2cError> {
            self.calls.push(Call::WriteWrite(address, first.to_vec(), second.to_vec()));
            self.outcome(second.len())
        }
    }

    fn run<I: I2cMaster>(bus: &mut I, line: &str) -> Vec<u8> {
        block_on(execute(bus, line)).to_bytes().to_vec()
    }

    #[test]
    fn test_ping() {
        let mut bus = FakeBus::default();
        assert_eq!(run(&mut bus, "PING"), b"OK\r\n");
        assert_eq!(run(&mut bus, "PING PONG"), b"OK\r\n");
        assert!(bus.calls.is_empty());
    }

    #[test]
    fn test_read_returns_data() {
        let mut bus = FakeBus::answering(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(run(&mut bus, "READ 50 04"), b"DATA deadbeef\r\n");
        assert_eq!(bus.calls, vec![Call::Read(0x50, 4)]);
    }

    #[test]
    fn test_write_passes_decoded_bytes() {
        let mut bus = FakeBus::default();
        assert_eq!(run(&mut bus, "WRITE 3c 03 00af10"), b"OK\r\n");
        assert_eq!(bus.calls, vec![Call::Write(0x3c, vec![0x00, 0xaf, 0x10])]);
    }

    #[test]
    fn test_write_read_and_write_write() {
        let mut bus = FakeBus::answering(&[0x12, 0x34]);
        assert_eq!(run(&mut bus, "WRITE_READ 68 01 75 02"), b"DATA 1234\r\n");
        assert_eq!(run(&mut bus, "WRITE_WRITE 50 02 0010 01 ff"), b"OK\r\n");
        assert_eq!(
            bus.calls,
            vec![
                Call::WriteRead(0x68, vec![0x75], 2),
                Call::WriteWrite(0x50, vec![0x00, 0x10], vec![0xff]),
            ]
        );
    }

    #[test]
    fn test_malformed_lines_never_reach_bus() {
        let mut bus = FakeBus::default();
        for line in [
            "WRITE 50 02 AABB",
            "FOO",
            "READ 50 00",
            "READ 50 65",
            "READ 80 01",
            "WRITE 50 02 aa",
            "READ 50 01 02",
        ] {
            assert_eq!(run(&mut bus, line), b"ERROR\r\n", "{}", line);
        }
        assert!(bus.calls.is_empty());
    }

    #[test]
    fn test_bus_failure_is_error() {
        let mut bus = FakeBus::failing(Phase::Second);
        assert_eq!(run(&mut bus, "WRITE_READ 50 01 00 04"), b"ERROR\r\n");
        assert_eq!(bus.calls.len(), 1);

        let mut bus = FakeBus::failing(Phase::First);
        assert_eq!(run(&mut bus, "READ 50 04"), b"ERROR\r\n");
    }

    #[test]
    fn test_engine_failure_on_either_phase_is_error() {
        // (line, reply when every chunk is acknowledged, chunks on the bus)
        let cases: [(&str, &[u8], usize); 4] = [
            ("READ 50 02", b"DATA ffff\r\n", 1),
            ("WRITE 50 02 aabb", b"OK\r\n", 1),
            ("WRITE_READ 50 01 00 02", b"DATA ffff\r\n", 2),
            ("WRITE_WRITE 50 01 00 02 aabb", b"OK\r\n", 2),
        ];

        for (line, reply, chunks) in cases {
            let done = Signal::new();
            let mut i2c = mock::engine(&done, &[]);
            assert_eq!(run(&mut i2c, line), reply, "{}", line);
            assert_eq!(i2c.bus().starts().len(), chunks, "{}", line);

            for failing in 0..chunks {
                for fault in [Answer::Nack, Answer::Silent, Answer::DmaError] {
                    let mut answers = vec![Answer::Ack; chunks];
                    answers[failing] = fault;

                    let done = Signal::new();
                    let mut i2c = mock::engine(&done, &answers);
                    assert_eq!(
                        run(&mut i2c, line),
                        b"ERROR\r\n",
                        "{} with {:?} on chunk {}",
                        line,
                        fault,
                        failing + 1
                    );
                    // Nothing is started after the failing chunk.
                    assert_eq!(i2c.bus().starts().len(), failing + 1, "{}", line);
                }
            }
        }
    }

    #[test]
    fn test_write_delivers_every_length() {
        for length in 1..=MAX_PAYLOAD {
            let data: Vec<u8> = (0..length).map(|i| (i * 37 + length) as u8).collect();
            let text: String = data.iter().map(|b| format!("{:02x}", b)).collect();
            let line = format!("WRITE 2a {:02} {}", length, text);

            let done = Signal::new();
            let mut i2c = mock::engine(&done, &[]);
            assert_eq!(run(&mut i2c, &line), b"OK\r\n", "{}", line);
            assert_eq!(i2c.bus().written, data);
            assert_eq!(
                i2c.bus().starts(),
                vec![(0x2a, Direction::Write, length as u8)]
            );
        }
    }

    #[test]
    fn test_zeroed_buffer_bounds() {
        assert_eq!(zeroed(MAX_PAYLOAD).map(|p| p.len()), Some(MAX_PAYLOAD));
        assert_eq!(zeroed(1).map(|p| p.len()), Some(1));
        assert_eq!(zeroed(MAX_PAYLOAD + 1), None);
    }

    struct QueueRx<'a> {
        packets: &'a RefCell<VecDeque<Vec<u8>>>,
    }

    impl PacketRx for QueueRx<'_> {
        async fn read_packet(&mut self, buffer: &mut [u8]) -> Result<usize, LinkError> {
            loop {
                let next = self.packets.borrow_mut().pop_front();
                match next {
                    Some(packet) => {
                        buffer[..packet.len()].copy_from_slice(&packet);
                        return Ok(packet.len());
                    }
                    None => yield_now().await,
                }
            }
        }
    }

    struct RecordingTx<'a> {
        packets: &'a RefCell<Vec<Vec<u8>>>,
    }

    impl PacketTx for RecordingTx<'_> {
        async fn write_packet(&mut self, data: &[u8]) -> Result<(), LinkError> {
            self.packets.borrow_mut().push(data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_session_over_serial_port() {
        let port = SerialPort::<NoopRawMutex, 512>::new();
        let input = b"PING\r\nREAD 50 04\r\nWRITE 50 02 AABB\r\nFOO\r\n";
        let rx_packets = RefCell::new(
            input
                .chunks(PACKET_SIZE / 8)
                .map(|c| c.to_vec())
                .collect::<VecDeque<_>>(),
        );
        let tx_packets = RefCell::new(Vec::new());
        let mut rx = QueueRx { packets: &rx_packets };
        let mut tx = RecordingTx { packets: &tx_packets };

        let mut shell = Shell::new(&port, FakeBus::answering(&[0xde, 0xad, 0xbe, 0xef]));
        let expected: &[u8] = b"OK\r\nDATA deadbeef\r\nERROR\r\nERROR\r\n";

        let session = async {
            while !(rx_packets.borrow().is_empty() && port.inbound().is_empty()) {
                shell.step().await;
            }
            for _ in 0..16 {
                yield_now().await;
            }
        };

        match block_on(select(port.service(&mut rx, &mut tx), session)) {
            Either::First(e) => panic!("service ended: {:?}", e),
            Either::Second(()) => {}
        }

        assert_eq!(tx_packets.borrow().concat(), expected);
        assert_eq!(shell.bus().calls, vec![Call::Read(0x50, 4)]);
    }
}
