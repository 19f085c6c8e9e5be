//! Holds the byte stream link with the dumper device.
//!
//! A link is considered usable only after the device has answered the one byte
//! handshake sent on reset. Reads and writes either move the whole requested
//! amount of bytes or fail, a partial transfer is never reported as a success.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use serialport::SerialPort;
use thiserror::Error;

/// The baud rate the dumper firmware listens at.
pub const DEFAULT_BAUD_RATE: u32 = 2_000_000;

/// Time the device has to send its greeting byte after the port is opened.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Granularity at which a blocked transfer checks for a stop request.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time a transfer may go without moving a single byte before failing.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// A bidirectional link able to move exact amounts of bytes.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Block until `buffer` has been completely filled with incoming bytes.
    fn read_exact(&mut self, buffer: &mut [u8]) -> Result<(), TransportError>;

    /// Block until every byte of `bytes` has been sent.
    fn write_exact(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Release the underlying link. Calling it more than once does nothing.
    fn close(&mut self);

    /// If the underlying link has not been released yet.
    fn is_open(&self) -> bool;
}

#[derive(Error, Debug)]
/// Errors that may happen while opening a link with the device.
pub enum PortError {
    #[error("Unable to open the serial port {path}: {source}")]
    /// The operating system refused to open the port.
    Open {
        /// The name of the port.
        path: String,

        /// The reason reported by the serial driver.
        #[source]
        source: serialport::Error,
    },

    #[error("The device on {path} did not answer the handshake: {source}")]
    /// The port opened, but the device never sent its greeting byte.
    Handshake {
        /// The name of the port.
        path: String,

        /// What went wrong while waiting for the greeting.
        #[source]
        source: TransportError,
    },
}

#[derive(Error, Debug)]
/// Errors that may happen while exchanging bytes through an open link.
pub enum TransportError {
    #[error("The link ended after {actual} of {expected} expected bytes")]
    /// The stream reached its end before the requested amount of bytes arrived.
    ShortRead {
        /// The number of bytes requested.
        expected: usize,

        /// The number of bytes that actually arrived.
        actual: usize,
    },

    #[error("The link accepted only {actual} of {expected} bytes")]
    /// The stream stopped accepting bytes before everything was sent.
    ShortWrite {
        /// The number of bytes to send.
        expected: usize,

        /// The number of bytes that were actually sent.
        actual: usize,
    },

    #[error("No data moved for {idle:?}, {actual} of {expected} bytes transferred")]
    /// The device stopped answering in the middle of a transfer.
    TimedOut {
        /// The number of bytes of the transfer.
        expected: usize,

        /// The number of bytes moved before the link went silent.
        actual: usize,

        /// How long the link stayed silent.
        idle: Duration,
    },

    #[error("The transfer was interrupted by a stop request")]
    /// A [StopSignal] was raised, the link has been closed.
    Interrupted,

    #[error("The link is closed")]
    /// The link was already released.
    Closed,

    #[error("Unable to use the serial link: {0}")]
    /// The serial driver reported an error.
    Io(#[from] io::Error),
}

/// A shared flag used to ask blocked transfers to give up.
///
/// Raising it makes any in-flight transfer close its link and fail with
/// [TransportError::Interrupted] on its next poll.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create a new, lowered, [StopSignal].
    pub fn new() -> StopSignal {
        StopSignal::default()
    }

    /// Ask every transfer watching this signal to stop.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// If a stop has been requested.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Settings used to open a serial link with the device.
#[derive(Debug, Clone)]
pub struct PortOptions {
    /// The name of the serial port, like `/dev/ttyUSB0` or `COM3`.
    pub path: String,

    /// The speed of the link.
    pub baud_rate: u32,

    /// Time the device has to answer the handshake, `None` waits forever.
    pub handshake_timeout: Option<Duration>,

    /// How long a single read blocks before checking for a stop request.
    pub poll_interval: Duration,

    /// Time a transfer may go without progress, `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl PortOptions {
    /// Create the default [PortOptions] for the given port.
    pub fn new(path: impl Into<String>) -> PortOptions {
        PortOptions {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

/// A [Transport] over a serial port, or any stream that behaves like one.
///
/// Reads on the stream are expected to time out periodically, returning
/// [io::ErrorKind::TimedOut], so that stop requests are noticed.
pub struct SerialChannel<S: Read + Write = Box<dyn SerialPort>> {
    /// The stream, `None` once closed.
    stream: Option<S>,

    /// The name of the port, only used for logging.
    name: String,

    /// Time a transfer may go without progress.
    idle_timeout: Option<Duration>,

    /// Checked between polls of the stream.
    stop: StopSignal,
}

impl SerialChannel {
    /// Open a serial port and wait for the device handshake.
    pub fn open(options: &PortOptions, stop: StopSignal) -> Result<SerialChannel, PortError> {
        debug!(
            "Opening serial port {} at {} bauds",
            options.path, options.baud_rate
        );

        let stream = serialport::new(&options.path, options.baud_rate)
            .timeout(options.poll_interval)
            .open()
            .map_err(|source| PortError::Open {
                path: options.path.clone(),
                source,
            })?;

        SerialChannel::handshake(stream, options, stop)
    }
}

impl<S: Read + Write> SerialChannel<S> {
    /// Wrap an already open stream, waiting for the device to send its greeting byte.
    ///
    /// On failure the stream is dropped, no half open channel is ever returned.
    pub fn handshake(
        stream: S,
        options: &PortOptions,
        stop: StopSignal,
    ) -> Result<SerialChannel<S>, PortError> {
        let mut channel = SerialChannel {
            stream: Some(stream),
            name: options.path.clone(),
            idle_timeout: options.idle_timeout,
            stop,
        };

        let mut greeting = [0u8; 1];

        if let Err(source) = channel.fill(&mut greeting, options.handshake_timeout) {
            channel.close();

            return Err(PortError::Handshake {
                path: options.path.clone(),
                source,
            });
        }

        debug!("Device on {} answered with {:#04X}", channel.name, greeting[0]);

        Ok(channel)
    }

    /// Close the stream and report the interruption if a stop was requested.
    fn check_stop(&mut self) -> Result<(), TransportError> {
        if self.stop.is_raised() {
            warn!("Stop requested, closing {}", self.name);
            self.close();

            return Err(TransportError::Interrupted);
        }

        Ok(())
    }

    /// Fill `buffer`, failing if nothing arrives for longer than `idle_limit`.
    fn fill(&mut self, buffer: &mut [u8], idle_limit: Option<Duration>) -> Result<(), TransportError> {
        let expected = buffer.len();
        let mut filled = 0;
        let mut last_progress = Instant::now();

        while filled < expected {
            self.check_stop()?;

            let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

            match stream.read(&mut buffer[filled..]) {
                Ok(0) => {
                    return Err(TransportError::ShortRead {
                        expected,
                        actual: filled,
                    })
                }

                Ok(read) => {
                    filled += read;
                    last_progress = Instant::now();
                }

                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    let idle = last_progress.elapsed();

                    if idle_limit.is_some_and(|limit| idle >= limit) {
                        return Err(TransportError::TimedOut {
                            expected,
                            actual: filled,
                            idle,
                        });
                    }
                }

                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}

                Err(err) => return Err(TransportError::Io(err)),
            }
        }

        trace!("Read {expected} bytes from {}", self.name);

        Ok(())
    }
}

impl<S: Read + Write> Transport for SerialChannel<S> {
    fn read_exact(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        self.fill(buffer, self.idle_timeout)
    }

    fn write_exact(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let expected = bytes.len();
        let mut written = 0;
        let mut last_progress = Instant::now();

        while written < expected {
            self.check_stop()?;

            let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

            match stream.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(TransportError::ShortWrite {
                        expected,
                        actual: written,
                    })
                }

                Ok(count) => {
                    written += count;
                    last_progress = Instant::now();
                }

                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    let idle = last_progress.elapsed();

                    if self.idle_timeout.is_some_and(|limit| idle >= limit) {
                        return Err(TransportError::TimedOut {
                            expected,
                            actual: written,
                            idle,
                        });
                    }
                }

                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}

                Err(err) => return Err(TransportError::Io(err)),
            }
        }

        self.stream
            .as_mut()
            .ok_or(TransportError::Closed)?
            .flush()?;

        trace!("Wrote {expected} bytes to {}", self.name);

        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            debug!("Closed {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl<S: Read + Write> Drop for SerialChannel<S> {
    fn drop(&mut self) {
        self.close();
    }
}
