//! Holds the transfer algorithms built on top of the device protocol.
//!
//! Every operation works from a freshly fetched [CartridgeHeader]: the layout
//! decides the addresses to request and the size fields decide how much to
//! transfer. An all zero header stops any operation before it touches the
//! cartridge.

use std::fmt;
use std::io::{self, Write};
use std::mem;
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::header::{CartridgeHeader, HEADER_END_ADDRESS, HEADER_LENGTH, HEADER_START_ADDRESS};
use crate::protocol::{CartridgeProtocol, ControlLines, Section};
use crate::transport::{PortError, PortOptions, SerialChannel, StopSignal, Transport, TransportError};

/// The number of bytes streamed for each ROM bank.
pub const ROM_BANK_SIZE: usize = 0x10000;

/// The address of the last byte of every ROM bank window.
const ROM_BANK_END_ADDRESS: u16 = 0xFFFF;

/// The most banks addressable with a one byte bank number.
const MAX_ROM_BANKS: u64 = 256;

/// Pause after each SRAM byte, the device needs it to complete the write cycle.
const DEFAULT_SRAM_WRITE_DELAY: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
/// Errors that may happen while running a cartridge operation.
pub enum SessionError {
    #[error("Unable to talk with the device: {0}")]
    /// The link failed in the middle of an exchange.
    Transport(#[from] TransportError),

    #[error("Unable to read the cartridge header, check the cartridge and the connection")]
    /// The header read back was all zeroes.
    InvalidCartridge,

    #[error("The game has no SRAM")]
    /// The header reports no battery backed SRAM.
    NoSram,

    #[error("The data holds {actual} bytes but the game SRAM holds {expected} bytes")]
    /// The bytes to write do not match the SRAM size.
    SizeMismatch {
        /// The SRAM size reported by the header.
        expected: usize,

        /// The amount of bytes provided.
        actual: usize,
    },

    #[error("The ROM size on the header needs {banks} banks, more than the device can address")]
    /// The ROM size field is beyond anything a one byte bank number reaches.
    RomTooLarge {
        /// The number of banks the header asks for.
        banks: u64,
    },

    #[error("The SRAM of {size} bytes does not fit a single window starting at {start:#06X}")]
    /// The SRAM size field does not fit the 16 bits address window.
    SramWindowOverflow {
        /// The SRAM size reported by the header.
        size: u32,

        /// The start of the SRAM window.
        start: u16,
    },

    #[error("Unable to store the transferred data: {0}")]
    /// The destination of a dump refused the data.
    Sink(#[source] io::Error),

    #[error("The device is not connected")]
    /// No link is open.
    Disconnected,
}

/// How far a transfer has gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// The bytes transferred so far.
    pub transferred: u64,

    /// The bytes the transfer is expected to move.
    pub total: u64,
}

impl fmt::Display for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} bytes",
            group_thousands(self.transferred),
            group_thousands(self.total)
        )
    }
}

/// Format a number with a comma between each group of three digits.
fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);

    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }

        grouped.push(digit);
    }

    grouped
}

/// Settings of the transfer algorithms.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Pause after each SRAM byte written.
    pub sram_write_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> SessionOptions {
        SessionOptions {
            sram_write_delay: DEFAULT_SRAM_WRITE_DELAY,
        }
    }
}

/// Runs cartridge operations over an exclusively owned link.
pub struct CartridgeSession<T: Transport> {
    /// The protocol over the link.
    protocol: CartridgeProtocol<T>,

    /// Settings of the transfer algorithms.
    options: SessionOptions,
}

impl<T: Transport> CartridgeSession<T> {
    /// Create a new [CartridgeSession].
    pub fn new(transport: T, options: SessionOptions) -> CartridgeSession<T> {
        CartridgeSession {
            protocol: CartridgeProtocol::new(transport),
            options,
        }
    }

    /// Borrow the underlying link.
    pub fn transport(&self) -> &T {
        self.protocol.transport()
    }

    /// Read and decode the cartridge header.
    ///
    /// The header is returned even if it is all zeroes, check it with
    /// [CartridgeHeader::is_valid] or use [Self::read_header].
    pub fn fetch_header(&mut self) -> Result<CartridgeHeader, SessionError> {
        debug!("Fetching the cartridge header");

        self.protocol
            .set_control_lines(ControlLines::from_lines(false, true, false, true))?;

        let mut raw = [0u8; HEADER_LENGTH];
        let section = Section {
            bank: 0,
            start: HEADER_START_ADDRESS,
            end: HEADER_END_ADDRESS,
        };

        self.protocol.read_section(section, &mut raw)?;

        Ok(CartridgeHeader::from_bytes(raw))
    }

    /// Fetch the header, failing if it is not valid.
    ///
    /// Called before every operation, so a removed or swapped cartridge is
    /// noticed each time.
    pub fn read_header(&mut self) -> Result<CartridgeHeader, SessionError> {
        let header = self.fetch_header()?;

        if !header.is_valid() {
            warn!("The cartridge header is empty");
            return Err(SessionError::InvalidCartridge);
        }

        debug!("Cartridge: {:?} ({})", header.title, header.layout);

        Ok(header)
    }

    /// Dump the whole ROM into `sink`, bank by bank, returning the bytes written.
    ///
    /// Whole banks are always transferred, so the dump may be up to one bank
    /// larger than the ROM size on the header.
    pub fn dump_rom<W, P>(
        &mut self,
        header: &CartridgeHeader,
        sink: &mut W,
        mut progress: P,
    ) -> Result<u64, SessionError>
    where
        W: Write,
        P: FnMut(TransferProgress),
    {
        if !header.is_valid() {
            return Err(SessionError::InvalidCartridge);
        }

        let banks = header.rom_size_bytes.div_ceil(ROM_BANK_SIZE as u64);

        if banks > MAX_ROM_BANKS {
            return Err(SessionError::RomTooLarge { banks });
        }

        debug!(
            "Dumping {} bytes of ROM in {banks} banks",
            header.rom_size_bytes
        );

        self.protocol
            .set_control_lines(ControlLines::from_lines(false, true, false, true))?;

        let start = header.layout.rom_bank_start_address();
        let mut buffer = vec![0u8; ROM_BANK_SIZE];
        let mut transferred = 0u64;

        for bank in 0..banks {
            let section = Section {
                bank: bank as u8,
                start,
                end: ROM_BANK_END_ADDRESS,
            };

            self.protocol.read_section(section, &mut buffer)?;
            sink.write_all(&buffer).map_err(SessionError::Sink)?;

            transferred += ROM_BANK_SIZE as u64;
            trace!("ROM bank {bank} done");

            progress(TransferProgress {
                transferred,
                total: header.rom_size_bytes,
            });
        }

        sink.flush().map_err(SessionError::Sink)?;

        Ok(transferred)
    }

    /// Dump the SRAM into `sink` with a single read, returning the bytes written.
    pub fn dump_sram<W, P>(
        &mut self,
        header: &CartridgeHeader,
        sink: &mut W,
        mut progress: P,
    ) -> Result<u64, SessionError>
    where
        W: Write,
        P: FnMut(TransferProgress),
    {
        let section = sram_section(header)?;
        let size = header.sram_size_bytes as usize;

        debug!("Dumping {size} bytes of SRAM");

        self.protocol.set_control_lines(ControlLines::from_lines(
            false,
            true,
            header.layout.selects_cartridge_for_sram(),
            true,
        ))?;

        let mut buffer = vec![0u8; size];

        self.protocol.read_section(section, &mut buffer)?;
        sink.write_all(&buffer).map_err(SessionError::Sink)?;
        sink.flush().map_err(SessionError::Sink)?;

        progress(TransferProgress {
            transferred: size as u64,
            total: size as u64,
        });

        Ok(size as u64)
    }

    /// Write `source` into the SRAM, one byte at a time.
    ///
    /// `source` must hold exactly as many bytes as the SRAM, otherwise nothing
    /// is sent to the device.
    pub fn write_sram<P>(
        &mut self,
        header: &CartridgeHeader,
        source: &[u8],
        mut progress: P,
    ) -> Result<(), SessionError>
    where
        P: FnMut(TransferProgress),
    {
        let section = sram_section(header)?;
        let expected = header.sram_size_bytes as usize;

        if source.len() != expected {
            return Err(SessionError::SizeMismatch {
                expected,
                actual: source.len(),
            });
        }

        debug!("Writing {expected} bytes of SRAM");

        self.protocol.set_control_lines(ControlLines::from_lines(
            true,
            false,
            header.layout.selects_cartridge_for_sram(),
            true,
        ))?;
        self.protocol.begin_write_section(section)?;

        for (index, byte) in source.iter().enumerate() {
            self.protocol.write_payload(&[*byte])?;
            thread::sleep(self.options.sram_write_delay);

            progress(TransferProgress {
                transferred: index as u64 + 1,
                total: expected as u64,
            });
        }

        Ok(())
    }

    /// Release the link.
    pub fn close(&mut self) {
        self.protocol.close();
    }
}

/// The window holding the SRAM of the cartridge.
fn sram_section(header: &CartridgeHeader) -> Result<Section, SessionError> {
    if !header.is_valid() {
        return Err(SessionError::InvalidCartridge);
    }

    if !header.has_sram() {
        return Err(SessionError::NoSram);
    }

    let start = header.layout.sram_start_address();
    let end = u16::try_from(start as u32 + header.sram_size_bytes - 1).map_err(|_| {
        SessionError::SramWindowOverflow {
            size: header.sram_size_bytes,
            start,
        }
    })?;

    Ok(Section { bank: 0, start, end })
}

/// The link with the device, if any.
pub enum ConnectionState<T: Transport = SerialChannel> {
    /// No link is open.
    Disconnected,

    /// A link is open and answered the handshake.
    Connected(CartridgeSession<T>),
}

impl ConnectionState {
    /// Open a serial port and wait for the device handshake.
    pub fn connect(
        port: &PortOptions,
        options: SessionOptions,
        stop: StopSignal,
    ) -> Result<ConnectionState, PortError> {
        let channel = SerialChannel::open(port, stop)?;
        info!("Connected to {}", port.path);

        Ok(ConnectionState::Connected(CartridgeSession::new(channel, options)))
    }
}

impl<T: Transport> ConnectionState<T> {
    /// If a link is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    /// Borrow the session of the open link.
    pub fn session(&mut self) -> Result<&mut CartridgeSession<T>, SessionError> {
        match self {
            ConnectionState::Connected(session) => Ok(session),
            ConnectionState::Disconnected => Err(SessionError::Disconnected),
        }
    }

    /// Close the link, if any.
    pub fn disconnect(&mut self) {
        if let ConnectionState::Connected(mut session) = mem::replace(self, ConnectionState::Disconnected) {
            session.close();
            info!("Disconnected");
        }
    }
}
