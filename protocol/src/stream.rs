use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::pipe::Pipe;

/// Bounded single-producer/single-consumer byte FIFO.
///
/// One side runs in task context and may block; the other side is driven
/// from endpoint events and only uses the non-blocking `try_` calls.
pub struct ByteStream<M: RawMutex, const N: usize> {
    pipe: Pipe<M, N>,
}

impl<M: RawMutex, const N: usize> ByteStream<M, N> {
    pub const fn new() -> Self {
        Self { pipe: Pipe::new() }
    }

    /// Write all of `data`, waiting for room as needed.
    pub async fn put(&self, data: &[u8]) -> usize {
        self.pipe.write_all(data).await;
        data.len()
    }

    /// Write as much of `data` as fits once at least one byte fits.
    pub async fn put_some(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        self.pipe.write(data).await
    }

    /// Read at least one byte, waiting until one is available.
    pub async fn get(&self, buffer: &mut [u8]) -> usize {
        if buffer.is_empty() {
            return 0;
        }
        self.pipe.read(buffer).await
    }

    /// Non-blocking write; returns how many bytes were taken.
    pub fn try_put(&self, data: &[u8]) -> usize {
        self.pipe.try_write(data).unwrap_or(0)
    }

    /// Non-blocking read; returns how many bytes were produced.
    pub fn try_get(&self, buffer: &mut [u8]) -> usize {
        self.pipe.try_read(buffer).unwrap_or(0)
    }

    pub fn space_available(&self) -> usize {
        self.pipe.free_capacity()
    }

    pub fn bytes_available(&self) -> usize {
        self.pipe.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipe.is_empty()
    }
}

impl<M: RawMutex, const N: usize> Default for ByteStream<M, N> {
    fn default() -> Self {
        Self::new()
    }
}
