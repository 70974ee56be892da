/// Accumulates printable characters until a line terminator.
///
/// Bytes past the capacity are dropped; the truncated line is still handed
/// out at the next terminator. Control characters and non-ASCII bytes are
/// ignored, and a terminator on an empty line yields nothing, so `\r\n`
/// dispatches once.
pub struct LineBuffer<const N: usize> {
    buffer: [u8; N],
    length: usize,
    complete: bool,
}

impl<const N: usize> LineBuffer<N> {
    pub const fn new() -> Self {
        Self {
            buffer: [0; N],
            length: 0,
            complete: false,
        }
    }

    /// Feed one byte. Returns the finished line when `byte` terminates it.
    pub fn push(&mut self, byte: u8) -> Option<&str> {
        if self.complete {
            self.complete = false;
            self.length = 0;
        }

        match byte {
            b'\r' | b'\n' if self.length != 0 => {
                self.complete = true;
                // Only printable ASCII is ever stored.
                core::str::from_utf8(&self.buffer[..self.length]).ok()
            }
            b' '..=b'~' => {
                if self.length < N {
                    self.buffer[self.length] = byte;
                    self.length += 1;
                }
                None
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        if self.complete {
            0
        } else {
            self.length
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<const N: usize> Default for LineBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
