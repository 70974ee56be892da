//! Byte-stream view of a pair of USB bulk endpoints.
//!
//! The shell talks to [`SerialPort::recv`] and [`SerialPort::send`]. Packet
//! traffic and flow control live in [`SerialPort::service`], the single
//! servicing loop. The two sides share only the byte streams, the flow
//! flags and the [`PendingWork`] set.
//!
//! Flow flags:
//! - `receiving` is false exactly when the inbound stream could not take
//!   another full packet; no OUT transfer is accepted until `recv` drains
//!   the stream and a [`Work::RECV_RESUME`] is handled.
//! - `sending` is true from the first non-empty packet of a message until a
//!   packet shorter than [`PACKET_SIZE`] has been queued.

use core::fmt;
use core::future::pending;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;

use crate::stream::ByteStream;
use crate::PACKET_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    /// Endpoint disabled, the host went away
    Disconnected,
    /// Host sent more than one packet's worth
    Overflow,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::Disconnected => write!(f, "USB endpoint disabled"),
            LinkError::Overflow => write!(f, "USB packet overflow"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LinkError {}

/// Bulk-out endpoint (host to device).
pub trait PacketRx {
    async fn read_packet(&mut self, buffer: &mut [u8]) -> Result<usize, LinkError>;
}

/// Bulk-in endpoint (device to host).
///
/// `write_packet` must wait for the endpoint to be free before queueing and
/// must not lose the packet if dropped while waiting.
pub trait PacketTx {
    async fn write_packet(&mut self, data: &[u8]) -> Result<(), LinkError>;
}

/// Set of pending requests for the servicing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Work(u8);

impl Work {
    /// Inbound stream was drained while reception was held off
    pub const RECV_RESUME: Work = Work(0x01);
    /// Outbound stream gained bytes while no send was in progress
    pub const SEND_RESUME: Work = Work(0x02);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Work) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Additive notification flags with a single waiting consumer.
///
/// Posting never overwrites: bits accumulate until [`PendingWork::take`]
/// consumes them all at once.
pub struct PendingWork<M: RawMutex> {
    bits: AtomicU8,
    wake: Signal<M, ()>,
}

impl<M: RawMutex> PendingWork<M> {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
            wake: Signal::new(),
        }
    }

    pub fn post(&self, work: Work) {
        self.bits.fetch_or(work.bits(), Ordering::AcqRel);
        self.wake.signal(());
    }

    pub async fn take(&self) -> Work {
        loop {
            let bits = self.bits.swap(0, Ordering::AcqRel);
            if bits != 0 {
                self.wake.reset();
                return Work(bits);
            }
            self.wake.wait().await;
        }
    }

    pub fn peek(&self) -> Work {
        Work(self.bits.load(Ordering::Acquire))
    }
}

impl<M: RawMutex> Default for PendingWork<M> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SerialPort<M: RawMutex, const N: usize> {
    inbound: ByteStream<M, N>,
    outbound: ByteStream<M, N>,
    receiving: AtomicBool,
    sending: AtomicBool,
    pending: PendingWork<M>,
}

impl<M: RawMutex, const N: usize> SerialPort<M, N> {
    pub const fn new() -> Self {
        Self {
            inbound: ByteStream::new(),
            outbound: ByteStream::new(),
            receiving: AtomicBool::new(true),
            sending: AtomicBool::new(false),
            pending: PendingWork::new(),
        }
    }

    /// Read at least one byte from the host, waiting as long as it takes.
    pub async fn recv(&self, buffer: &mut [u8]) -> usize {
        let n = self.inbound.get(buffer).await;

        if !self.receiving.load(Ordering::Acquire) {
            self.pending.post(Work::RECV_RESUME);
        }

        n
    }

    /// Queue all of `data` for the host, waiting for room as needed.
    pub async fn send(&self, data: &[u8]) -> usize {
        let mut written = 0;

        while written < data.len() {
            written += self.outbound.put_some(&data[written..]).await;

            if !self.sending.load(Ordering::Acquire) {
                self.pending.post(Work::SEND_RESUME);
            }
        }

        written
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    pub fn inbound(&self) -> &ByteStream<M, N> {
        &self.inbound
    }

    pub fn outbound(&self) -> &ByteStream<M, N> {
        &self.outbound
    }

    /// Reset flow state for a freshly connected host.
    ///
    /// Bytes already buffered in either direction are kept.
    pub fn link_up(&self) {
        self.sending.store(false, Ordering::Release);
        self.receiving.store(
            self.inbound.space_available() >= PACKET_SIZE,
            Ordering::Release,
        );
        if !self.outbound.is_empty() {
            self.pending.post(Work::SEND_RESUME);
        }
    }

    /// Bulk-out packet arrived. Returns whether reception stays enabled.
    pub fn on_packet_received(&self, packet: &[u8]) -> bool {
        let taken = self.inbound.try_put(packet);
        if taken < packet.len() {
            #[cfg(feature = "defmt")]
            defmt::warn!("serial: dropped {} inbound bytes", packet.len() - taken);
        }

        let open = self.inbound.space_available() >= PACKET_SIZE;
        if !open {
            self.receiving.store(false, Ordering::Release);
        }
        open
    }

    /// Bulk-in endpoint is free: pull the next packet to queue, if any.
    ///
    /// A full packet keeps `sending` set, so the call after it yields a
    /// zero-length packet when the stream has run dry.
    pub fn next_packet(&self, buffer: &mut [u8; PACKET_SIZE]) -> Option<usize> {
        let length = self.outbound.try_get(buffer);

        if length > 0 {
            self.sending.store(true, Ordering::Release);
        }

        let packet = if self.sending.load(Ordering::Acquire) {
            Some(length)
        } else {
            None
        };

        if length < PACKET_SIZE {
            self.sending.store(false, Ordering::Release);
        }

        packet
    }

    fn handle(&self, work: Work, staged: &mut Option<usize>, buffer: &mut [u8; PACKET_SIZE]) {
        if work.contains(Work::RECV_RESUME)
            && !self.receiving.load(Ordering::Acquire)
            && self.inbound.space_available() >= PACKET_SIZE
        {
            self.receiving.store(true, Ordering::Release);
        }

        if work.contains(Work::SEND_RESUME)
            && staged.is_none()
            && !self.sending.load(Ordering::Acquire)
            && !self.outbound.is_empty()
        {
            *staged = self.next_packet(buffer);
        }
    }

    /// Move packets between the endpoints and the streams until the link
    /// drops.
    pub async fn service<R: PacketRx, T: PacketTx>(&self, rx: &mut R, tx: &mut T) -> LinkError {
        let mut rx_buffer = [0u8; PACKET_SIZE];
        let mut tx_buffer = [0u8; PACKET_SIZE];
        let mut staged: Option<usize> = None;

        loop {
            let receiving = self.receiving.load(Ordering::Acquire);

            let event = select3(
                self.pending.take(),
                async {
                    if receiving {
                        rx.read_packet(&mut rx_buffer).await
                    } else {
                        pending().await
                    }
                },
                async {
                    match staged {
                        Some(length) => tx.write_packet(&tx_buffer[..length]).await,
                        None => pending().await,
                    }
                },
            )
            .await;

            match event {
                Either3::First(work) => self.handle(work, &mut staged, &mut tx_buffer),
                Either3::Second(Ok(length)) => {
                    self.on_packet_received(&rx_buffer[..length]);
                }
                Either3::Third(Ok(())) => {
                    staged = self.next_packet(&mut tx_buffer);
                }
                Either3::Second(Err(e)) | Either3::Third(Err(e)) => {
                    #[cfg(feature = "defmt")]
                    if let Some(length) = staged {
                        defmt::warn!("serial: link down, dropped {} outbound bytes", length);
                    }
                    return e;
                }
            }
        }
    }
}

impl<M: RawMutex, const N: usize> Default for SerialPort<M, N> {
    fn default() -> Self {
        Self::new()
    }
}
