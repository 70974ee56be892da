//! I2C master transaction engine.
//!
//! One chunk at a time: program the peripheral, arm DMA, START, then sleep
//! on the completion signal until an interrupt gives it or the timeout runs
//! out. Whatever happened, the bus is left idle (STOP, NACK cleared or soft
//! reset) and the interrupt sources are re-enabled before the next chunk.

use core::fmt;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use embedded_hal_async::delay::DelayNs;

use crate::{MAX_CHUNK, TRANSFER_TIMEOUT_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Read,
    Write,
}

/// Which half of a composed operation fell short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    First,
    Second,
}

/// A transfer moved fewer bytes than requested.
///
/// NACK, timeout and DMA faults all end up here; the engine has already
/// put the bus back into a usable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct I2cError {
    pub phase: Phase,
    pub requested: usize,
    pub transferred: usize,
}

impl fmt::Display for I2cError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "I2C transfer short ({:?} phase): {} of {} bytes",
            self.phase, self.transferred, self.requested
        )
    }
}

#[cfg(feature = "std")]
impl std::error::Error for I2cError {}

/// DMA channel state read back when a chunk is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaOutcome {
    pub complete: bool,
    pub error: bool,
}

/// Register-level access to one I2C peripheral and its two DMA channels.
///
/// The interrupt handlers for the peripheral give the engine's completion
/// signal and mask themselves; [`BusDriver::rearm_interrupts`] unmasks them.
pub trait BusDriver {
    /// Program target address, direction and byte count for the next chunk.
    fn configure(&mut self, address: u8, direction: Direction, length: u8);

    /// Point the DMA channel serving `direction` at `buffer` and enable it.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for `length` bytes (writable for
    /// [`Direction::Read`]) until [`BusDriver::disarm_dma`] returns.
    unsafe fn arm_dma(&mut self, direction: Direction, buffer: *mut u8, length: u8);

    /// Disable the channel, report and clear its flags.
    fn disarm_dma(&mut self, direction: Direction) -> DmaOutcome;

    fn send_start(&mut self);

    fn send_stop(&mut self);

    /// All programmed bytes moved and the peripheral is holding the bus.
    fn transfer_complete(&self) -> bool;

    fn nack_received(&self) -> bool;

    /// Clear the NACK and STOP flags after a rejected transfer.
    fn clear_nack(&mut self);

    /// Disable the peripheral, wait until it reads back disabled, re-enable.
    fn soft_reset(&mut self);

    /// Drop pending interrupt requests and unmask the peripheral's interrupts.
    fn rearm_interrupts(&mut self);
}

/// Composed operations as the shell sees them.
pub trait I2cMaster {
    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), I2cError>;

    async fn write(&mut self, address: u8, data: &[u8]) -> Result<(), I2cError>;

    /// Write then read with a repeated START in between.
    async fn write_read(
        &mut self,
        address: u8,
        data: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), I2cError>;

    /// Two writes with a repeated START in between.
    async fn write_write(
        &mut self,
        address: u8,
        first: &[u8],
        second: &[u8],
    ) -> Result<(), I2cError>;
}

pub struct I2cEngine<'a, M: RawMutex, B: BusDriver, D: DelayNs> {
    bus: B,
    done: &'a Signal<M, ()>,
    delay: D,
}

impl<'a, M: RawMutex, B: BusDriver, D: DelayNs> I2cEngine<'a, M, B, D> {
    pub fn new(bus: B, done: &'a Signal<M, ()>, delay: D) -> Self {
        Self { bus, done, delay }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Move `length` bytes at `buffer`, splitting into DMA chunks.
    ///
    /// STOP is suppressed between chunks, and after the last one when
    /// `continue_transfer` is set. Stops at the first short chunk and
    /// returns the bytes moved so far.
    ///
    /// # Safety
    ///
    /// Same contract as [`BusDriver::arm_dma`] for the whole range.
    async unsafe fn transfer(
        &mut self,
        address: u8,
        direction: Direction,
        buffer: *mut u8,
        length: usize,
        continue_transfer: bool,
    ) -> usize {
        let mut moved = 0;

        while moved < length {
            let chunk = (length - moved).min(MAX_CHUNK);
            let last = moved + chunk == length;
            let stop = last && !continue_transfer;

            let n = self
                .transfer_chunk(address, direction, buffer.add(moved), chunk as u8, stop)
                .await;
            moved += n;

            if n != chunk {
                break;
            }
        }

        moved
    }

    async unsafe fn transfer_chunk(
        &mut self,
        address: u8,
        direction: Direction,
        buffer: *mut u8,
        length: u8,
        stop: bool,
    ) -> usize {
        if length == 0 {
            return 0;
        }

        self.bus.configure(address, direction, length);
        self.bus.arm_dma(direction, buffer, length);

        // A give left over from the previous chunk must not end this one.
        self.done.reset();

        self.bus.send_start();

        let timeout = self.delay.delay_ms(TRANSFER_TIMEOUT_MS);
        let signalled = match select(self.done.wait(), timeout).await {
            Either::First(()) => true,
            Either::Second(()) => false,
        };

        let dma = self.bus.disarm_dma(direction);
        let mut transferred = length as usize;

        if !signalled {
            #[cfg(feature = "defmt")]
            defmt::warn!("i2c: 0x{:02x} timed out after {} ms", address, TRANSFER_TIMEOUT_MS);
            transferred = 0;
        }

        if self.bus.transfer_complete() {
            if stop {
                self.bus.send_stop();
            }
        } else {
            if self.bus.nack_received() {
                #[cfg(feature = "defmt")]
                defmt::debug!("i2c: 0x{:02x} NACK", address);
                self.bus.clear_nack();
            } else {
                #[cfg(feature = "defmt")]
                defmt::warn!("i2c: bus stuck, soft reset");
                self.bus.soft_reset();
            }
            transferred = 0;
        }

        if !dma.complete || dma.error {
            #[cfg(feature = "defmt")]
            defmt::warn!("i2c: DMA incomplete={} error={}", !dma.complete, dma.error);
            transferred = 0;
        }

        self.bus.rearm_interrupts();

        transferred
    }

    async fn read_phase(
        &mut self,
        address: u8,
        buffer: &mut [u8],
        continue_transfer: bool,
        phase: Phase,
    ) -> Result<(), I2cError> {
        let requested = buffer.len();
        // SAFETY: `buffer` is exclusively borrowed for the whole call and the
        // DMA channel is disarmed before `transfer` returns.
        let transferred = unsafe {
            self.transfer(
                address,
                Direction::Read,
                buffer.as_mut_ptr(),
                requested,
                continue_transfer,
            )
            .await
        };
        check(phase, requested, transferred)
    }

    async fn write_phase(
        &mut self,
        address: u8,
        data: &[u8],
        continue_transfer: bool,
        phase: Phase,
    ) -> Result<(), I2cError> {
        let requested = data.len();
        // SAFETY: the write channel only reads memory-to-peripheral, and the
        // borrow of `data` outlives the disarmed channel.
        let transferred = unsafe {
            self.transfer(
                address,
                Direction::Write,
                data.as_ptr() as *mut u8,
                requested,
                continue_transfer,
            )
            .await
        };
        check(phase, requested, transferred)
    }
}

fn check(phase: Phase, requested: usize, transferred: usize) -> Result<(), I2cError> {
    if transferred == requested {
        Ok(())
    } else {
        Err(I2cError {
            phase,
            requested,
            transferred,
        })
    }
}

impl<M: RawMutex, B: BusDriver, D: DelayNs> I2cMaster for I2cEngine<'_, M, B, D> {
    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), I2cError> {
        self.read_phase(address, buffer, false, Phase::First).await
    }

    async fn write(&mut self, address: u8, data: &[u8]) -> Result<(), I2cError> {
        self.write_phase(address, data, false, Phase::First).await
    }

    async fn write_read(
        &mut self,
        address: u8,
        data: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), I2cError> {
        self.write_phase(address, data, true, Phase::First).await?;
        self.read_phase(address, buffer, false, Phase::Second).await
    }

    async fn write_write(
        &mut self,
        address: u8,
        first: &[u8],
        second: &[u8],
    ) -> Result<(), I2cError> {
        self.write_phase(address, first, true, Phase::First).await?;
        self.write_phase(address, second, false, Phase::Second).await
    }
}

/// Scripted stand-in for the peripheral, shared with the shell tests.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use std::collections::VecDeque;

    /// How the simulated target answers one chunk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Answer {
        Ack,
        Nack,
        Silent,
        DmaError,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Event {
        Start {
            address: u8,
            direction: Direction,
            length: u8,
        },
        Stop,
        ClearNack,
        SoftReset,
        Rearm,
    }

    pub(crate) struct MockBus<'a> {
        done: &'a Signal<NoopRawMutex, ()>,
        answers: VecDeque<Answer>,
        pub(crate) read_data: VecDeque<u8>,
        pub(crate) written: Vec<u8>,
        pub(crate) events: Vec<Event>,
        current: Option<(u8, Direction, u8)>,
        dma: Option<(*mut u8, u8)>,
        answer: Answer,
    }

    impl<'a> MockBus<'a> {
        pub(crate) fn new(done: &'a Signal<NoopRawMutex, ()>, answers: &[Answer]) -> Self {
            Self {
                done,
                answers: answers.iter().copied().collect(),
                read_data: VecDeque::new(),
                written: Vec::new(),
                events: Vec::new(),
                current: None,
                dma: None,
                answer: Answer::Ack,
            }
        }

        pub(crate) fn starts(&self) -> Vec<(u8, Direction, u8)> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Start {
                        address,
                        direction,
                        length,
                    } => Some((*address, *direction, *length)),
                    _ => None,
                })
                .collect()
        }
    }

    impl BusDriver for MockBus<'_> {
        fn configure(&mut self, address: u8, direction: Direction, length: u8) {
            self.current = Some((address, direction, length));
        }

        unsafe fn arm_dma(&mut self, _direction: Direction, buffer: *mut u8, length: u8) {
            self.dma = Some((buffer, length));
        }

        fn disarm_dma(&mut self, _direction: Direction) -> DmaOutcome {
            self.dma = None;
            DmaOutcome {
                complete: self.answer == Answer::Ack,
                error: self.answer == Answer::DmaError,
            }
        }

        fn send_start(&mut self) {
            let (address, direction, length) = self.current.unwrap();
            self.events.push(Event::Start {
                address,
                direction,
                length,
            });
            self.answer = self.answers.pop_front().unwrap_or(Answer::Ack);

            if self.answer == Answer::Ack {
                let (buffer, len) = self.dma.unwrap();
                let memory = unsafe { core::slice::from_raw_parts_mut(buffer, len as usize) };
                match direction {
                    Direction::Write => self.written.extend_from_slice(memory),
                    Direction::Read => {
                        for byte in memory.iter_mut() {
                            *byte = self.read_data.pop_front().unwrap_or(0xff);
                        }
                    }
                }
            }

            if self.answer != Answer::Silent {
                self.done.signal(());
            }
        }

        fn send_stop(&mut self) {
            self.events.push(Event::Stop);
        }

        fn transfer_complete(&self) -> bool {
            matches!(self.answer, Answer::Ack | Answer::DmaError)
        }

        fn nack_received(&self) -> bool {
            self.answer == Answer::Nack
        }

        fn clear_nack(&mut self) {
            self.events.push(Event::ClearNack);
        }

        fn soft_reset(&mut self) {
            self.events.push(Event::SoftReset);
        }

        fn rearm_interrupts(&mut self) {
            self.events.push(Event::Rearm);
        }
    }

    /// Timeout source that expires as soon as it is polled.
    pub(crate) struct Expired;

    impl DelayNs for Expired {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    pub(crate) fn engine<'a>(
        done: &'a Signal<NoopRawMutex, ()>,
        answers: &[Answer],
    ) -> I2cEngine<'a, NoopRawMutex, MockBus<'a>, Expired> {
        I2cEngine::new(MockBus::new(done, answers), done, Expired)
    }
}
