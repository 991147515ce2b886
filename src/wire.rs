//! Relay datagram codec.
//!
//! Two fixed-capacity buffers carry every datagram the tunnel sends or
//! receives. Integers are stored in host byte order, strings are
//! NUL-terminated. Writing past capacity is a programming error and panics;
//! reading past the filled length yields zero instead of failing, which the
//! relay protocol relies on for truncated datagrams.

/// Capacity of both the inbound and the outbound buffer.
pub const BUFFER_SIZE: usize = 2048;

/// Relay protocol command bytes. The values are fixed by deployed relay servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Tunnel = 0,
    P2P = 1,
    Disconnect = 2,
    Ping = 3,
    Query = 4,
    TestP2P = 5,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Tunnel),
            1 => Ok(Command::P2P),
            2 => Ok(Command::Disconnect),
            3 => Ok(Command::Ping),
            4 => Ok(Command::Query),
            5 => Ok(Command::TestP2P),
            other => Err(other),
        }
    }
}

/// Datagram being assembled for sending.
///
/// Fields can be appended across several calls; nothing leaves the buffer
/// until the owner sends [`OutBuffer::as_slice`] and calls
/// [`OutBuffer::discard`].
pub struct OutBuffer {
    bytes: [u8; BUFFER_SIZE],
    pos: usize,
}

impl OutBuffer {
    pub fn new() -> Self {
        Self {
            bytes: [0; BUFFER_SIZE],
            pos: 0,
        }
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_bytes(&value.to_ne_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_bytes(&value.to_ne_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_ne_bytes());
    }

    /// Append raw bytes.
    ///
    /// # Panics
    ///
    /// Panics if the datagram would grow past [`BUFFER_SIZE`].
    pub fn write_bytes(&mut self, data: &[u8]) {
        assert!(
            self.pos + data.len() <= BUFFER_SIZE,
            "outbound datagram overflow: {} + {} > {}",
            self.pos,
            data.len(),
            BUFFER_SIZE
        );
        self.bytes[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
    }

    /// Append the bytes of `value` followed by a NUL terminator.
    pub fn write_string(&mut self, value: &str) {
        assert!(
            self.pos + value.len() < BUFFER_SIZE,
            "outbound string overflow: {} + {} >= {}",
            self.pos,
            value.len(),
            BUFFER_SIZE
        );
        self.write_bytes(value.as_bytes());
        self.write_bytes(&[0]);
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Bytes assembled so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.pos]
    }

    /// Drop the assembled datagram, typically right after it was sent.
    pub fn discard(&mut self) {
        self.pos = 0;
    }
}

impl Default for OutBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Most recently received datagram and the read cursor into it.
pub struct InBuffer {
    bytes: [u8; BUFFER_SIZE],
    len: usize,
    pos: usize,
}

impl InBuffer {
    pub fn new() -> Self {
        Self {
            bytes: [0; BUFFER_SIZE],
            len: 0,
            pos: 0,
        }
    }

    /// Reset the cursor and hand out the whole buffer to receive into.
    /// Call [`InBuffer::set_filled`] with the received length afterwards.
    pub fn prepare(&mut self) -> &mut [u8] {
        self.len = 0;
        self.pos = 0;
        &mut self.bytes
    }

    pub fn set_filled(&mut self, len: usize) {
        self.len = len.min(BUFFER_SIZE);
        self.pos = 0;
    }

    /// Load `data` as if it had just been received.
    pub fn fill_from(&mut self, data: &[u8]) {
        let len = data.len().min(BUFFER_SIZE);
        self.prepare()[..len].copy_from_slice(&data[..len]);
        self.set_filled(len);
    }

    pub fn read_i8(&mut self) -> i8 {
        self.read_array::<1>().map(i8::from_ne_bytes).unwrap_or(0)
    }

    pub fn read_i16(&mut self) -> i16 {
        self.read_array::<2>().map(i16::from_ne_bytes).unwrap_or(0)
    }

    pub fn read_i32(&mut self) -> i32 {
        self.read_array::<4>().map(i32::from_ne_bytes).unwrap_or(0)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.pos + N > self.len {
            return None;
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        Some(out)
    }

    /// Copy up to `out.len()` bytes, returning how many were copied.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.remaining());
        out[..count].copy_from_slice(&self.bytes[self.pos..self.pos + count]);
        self.pos += count;
        count
    }

    /// Read a NUL-terminated string of at most `max_len - 1` bytes.
    ///
    /// The cursor always moves past the terminator (or to the end of the
    /// datagram when there is none), even if the string was cut short.
    pub fn read_string(&mut self, max_len: usize) -> String {
        let rest = &self.bytes[self.pos..self.len];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let keep = end.min(max_len.saturating_sub(1));
        let value = String::from_utf8_lossy(&rest[..keep]).into_owned();
        self.pos = (self.pos + end + 1).min(self.len);
        value
    }

    pub fn remaining(&self) -> usize {
        self.len - self.pos
    }

    /// Unread part of the datagram.
    pub fn remaining_slice(&self) -> &[u8] {
        &self.bytes[self.pos..self.len]
    }
}

impl Default for InBuffer {
    fn default() -> Self {
        Self::new()
    }
}
