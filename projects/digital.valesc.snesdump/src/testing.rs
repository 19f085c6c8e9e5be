//! Test doubles for the device link.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::transport::{Transport, TransportError};

/// A stream behaving like a serial port with a short read timeout.
pub(crate) struct FakeStream {
    /// Bytes waiting to be read.
    incoming: VecDeque<u8>,

    /// Every byte written so far.
    sent: Arc<Mutex<Vec<u8>>>,

    /// Maximum number of bytes handed out per read call.
    chunk_size: usize,

    /// If an empty stream reports its end instead of timing out.
    ends_when_drained: bool,

    /// Maximum number of bytes accepted before writes return zero.
    write_capacity: usize,

    /// Incremented when the stream is dropped.
    drops: Arc<AtomicUsize>,
}

impl FakeStream {
    /// Create a stream that will hand out `incoming`.
    pub(crate) fn new(incoming: Vec<u8>) -> FakeStream {
        FakeStream {
            incoming: incoming.into(),
            sent: Arc::new(Mutex::new(Vec::new())),
            chunk_size: usize::MAX,
            ends_when_drained: false,
            write_capacity: usize::MAX,
            drops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Hand out at most `chunk_size` bytes per read.
    pub(crate) fn with_chunk_size(mut self, chunk_size: usize) -> FakeStream {
        self.chunk_size = chunk_size;
        self
    }

    /// Report the end of the stream once every byte was read.
    pub(crate) fn ending_when_drained(mut self) -> FakeStream {
        self.ends_when_drained = true;
        self
    }

    /// Stop accepting writes after `write_capacity` bytes.
    pub(crate) fn accepting_at_most(mut self, write_capacity: usize) -> FakeStream {
        self.write_capacity = write_capacity;
        self
    }

    /// The bytes written so far, shared with the stream.
    pub(crate) fn sent(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.sent)
    }

    /// How many times the stream was dropped.
    pub(crate) fn drop_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.drops)
    }
}

impl Read for FakeStream {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            if self.ends_when_drained {
                return Ok(0);
            }

            thread::sleep(Duration::from_millis(1));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }

        let count = buffer.len().min(self.chunk_size).min(self.incoming.len());

        for (slot, byte) in buffer.iter_mut().zip(self.incoming.drain(..count)) {
            *slot = byte;
        }

        Ok(count)
    }
}

impl Write for FakeStream {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut sent = self.sent.lock().unwrap();
        let count = bytes.len().min(self.write_capacity - sent.len().min(self.write_capacity));

        sent.extend_from_slice(&bytes[..count]);

        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// A scripted device recording every write and serving queued replies.
#[derive(Default)]
pub(crate) struct FakeDevice {
    /// Each `write_exact` call, in order.
    pub(crate) writes: Vec<Vec<u8>>,

    /// The size of each `read_exact` call, in order.
    pub(crate) reads: Vec<usize>,

    /// Bytes the device will answer with.
    pub(crate) replies: VecDeque<u8>,

    /// If the link was closed.
    pub(crate) closed: bool,
}

impl FakeDevice {
    /// Create a device with nothing to answer.
    pub(crate) fn new() -> FakeDevice {
        FakeDevice::default()
    }

    /// Queue bytes the device will answer with.
    pub(crate) fn reply(&mut self, bytes: &[u8]) {
        self.replies.extend(bytes.iter().copied());
    }
}

impl Transport for FakeDevice {
    fn read_exact(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        self.reads.push(buffer.len());

        if self.replies.len() < buffer.len() {
            let actual = self.replies.len();
            self.replies.clear();

            return Err(TransportError::ShortRead {
                expected: buffer.len(),
                actual,
            });
        }

        let wanted = buffer.len();

        for (slot, byte) in buffer.iter_mut().zip(self.replies.drain(..wanted)) {
            *slot = byte;
        }

        Ok(())
    }

    fn write_exact(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        self.writes.push(bytes.to_vec());

        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_open(&self) -> bool {
        !self.closed
    }
}

/// A destination that refuses every write.
pub(crate) struct FailingSink;

impl Write for FailingSink {
    fn write(&mut self, _bytes: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "disk full"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Build a raw cartridge header with the fields used by the dumper.
pub(crate) fn raw_header(title: &str, map_mode: u8, rom_size: u8, sram_size: u8) -> [u8; 32] {
    let mut raw = [b' '; 32];

    raw[..title.len()].copy_from_slice(title.as_bytes());
    raw[21] = map_mode;
    raw[22] = 0x02;
    raw[23] = rom_size;
    raw[24] = sram_size;
    raw[25] = 0x01;
    raw[26] = 0x33;
    raw[27] = 0x00;
    raw[28] = 0x5A;
    raw[29] = 0xA5;
    raw[30] = 0xA5;
    raw[31] = 0x5A;

    raw
}
