//! Holds the command protocol spoken by the dumper firmware.
//!
//! Every exchange starts with a one byte [Command]. Control frames carry a
//! single [ControlLines] byte, section frames carry a bank number followed by
//! the start and end addresses of the window, both big endian.

use bitflags::bitflags;
use log::trace;

use crate::transport::{Transport, TransportError};
use crate::U16Ex;

/// The commands understood by the device.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Set the state of the control lines.
    Ctrl = 0,

    /// Stream back the bytes of a section.
    ReadSection = 1,

    /// Store the bytes that follow into a section.
    WriteSection = 2,
}

impl Command {
    /// The byte sent on the wire for this command.
    pub fn opcode(self) -> u8 {
        self as u8
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// The lines driven by the device on the cartridge slot.
    pub struct ControlLines: u8 {
        /// Read enable line.
        const Read = 1 << 3;

        /// Write enable line.
        const Write = 1 << 2;

        /// Selects the cartridge address space, used to reach the SRAM of HiROM games.
        const Cartridge = 1 << 1;

        /// Reset line.
        const Reset = 1 << 0;
    }
}

impl ControlLines {
    /// Pack the state of each line.
    pub fn from_lines(read: bool, write: bool, cartridge: bool, reset: bool) -> ControlLines {
        let mut lines = ControlLines::empty();

        lines.set(ControlLines::Read, read);
        lines.set(ControlLines::Write, write);
        lines.set(ControlLines::Cartridge, cartridge);
        lines.set(ControlLines::Reset, reset);

        lines
    }
}

/// An addressed window of a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    /// The bank number.
    pub bank: u8,

    /// The address of the first byte of the window.
    pub start: u16,

    /// The address of the last byte of the window, inclusive.
    pub end: u16,
}

impl Section {
    /// The frame requesting this section with `command`.
    fn frame(&self, command: Command) -> [u8; 6] {
        let [start_upper, start_lower] = encode_address(self.start);
        let [end_upper, end_lower] = encode_address(self.end);

        [
            command.opcode(),
            self.bank,
            start_upper,
            start_lower,
            end_upper,
            end_lower,
        ]
    }
}

/// The two bytes sent for an address, most significant first.
pub fn encode_address(address: u16) -> [u8; 2] {
    [address.get_upper_byte(), address.get_lower_byte()]
}

/// Speaks the device protocol over a [Transport].
///
/// Payload bytes are never interpreted here, a wrong amount of bytes surfaces
/// as the [TransportError] of the underlying link.
pub struct CartridgeProtocol<T: Transport> {
    /// The link with the device.
    transport: T,
}

impl<T: Transport> CartridgeProtocol<T> {
    /// Create a new [CartridgeProtocol].
    pub fn new(transport: T) -> CartridgeProtocol<T> {
        CartridgeProtocol { transport }
    }

    /// Borrow the underlying link.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send a control frame.
    pub fn set_control_lines(&mut self, lines: ControlLines) -> Result<(), TransportError> {
        trace!("Protocol: CTRL {:#06b}", lines.bits());

        self.transport
            .write_exact(&[Command::Ctrl.opcode(), lines.bits()])
    }

    /// Send a single address.
    pub fn write_address(&mut self, address: u16) -> Result<(), TransportError> {
        self.transport.write_exact(&encode_address(address))
    }

    /// Request a section and fill `buffer` with the streamed bytes.
    ///
    /// The amount of bytes read is driven by `buffer`, not by the window.
    pub fn read_section(&mut self, section: Section, buffer: &mut [u8]) -> Result<(), TransportError> {
        trace!(
            "Protocol: READSECTION bank {:#04X} [{:#06X}, {:#06X}], reading {} bytes",
            section.bank,
            section.start,
            section.end,
            buffer.len()
        );

        self.transport
            .write_exact(&section.frame(Command::ReadSection))?;
        self.transport.read_exact(buffer)
    }

    /// Announce a section write, the payload must follow with [Self::write_payload].
    pub fn begin_write_section(&mut self, section: Section) -> Result<(), TransportError> {
        trace!(
            "Protocol: WRITESECTION bank {:#04X} [{:#06X}, {:#06X}]",
            section.bank,
            section.start,
            section.end
        );

        self.transport
            .write_exact(&section.frame(Command::WriteSection))
    }

    /// Send payload bytes of an announced section write.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.transport.write_exact(bytes)
    }

    /// Release the underlying link.
    pub fn close(&mut self) {
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::eq;
    use mockall::Sequence;

    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_command_opcodes() {
        assert_eq!(Command::Ctrl.opcode(), 0x00);
        assert_eq!(Command::ReadSection.opcode(), 0x01);
        assert_eq!(Command::WriteSection.opcode(), 0x02);
    }

    #[test]
    fn test_control_lines_packing() {
        assert_eq!(ControlLines::from_lines(true, false, true, false).bits(), 0b1010);
        assert_eq!(ControlLines::from_lines(false, true, false, true).bits(), 0b0101);
        assert_eq!(ControlLines::from_lines(true, true, true, true).bits(), 0x0F);
        assert_eq!(ControlLines::from_lines(false, false, false, false).bits(), 0x00);
    }

    #[test]
    fn test_encode_address() {
        assert_eq!(encode_address(0x1234), [0x12, 0x34]);
        assert_eq!(encode_address(0xFFDF), [0xFF, 0xDF]);
    }

    #[test]
    fn test_write_address() {
        let mut transport = MockTransport::new();
        transport
            .expect_write_exact()
            .with(eq(vec![0x12_u8, 0x34]))
            .times(1)
            .returning(|_| Ok(()));

        let mut protocol = CartridgeProtocol::new(transport);

        protocol.write_address(0x1234).unwrap();
    }

    #[test]
    fn test_set_control_lines() {
        let mut transport = MockTransport::new();
        transport
            .expect_write_exact()
            .with(eq(vec![0x00_u8, 0x0A]))
            .times(1)
            .returning(|_| Ok(()));

        let mut protocol = CartridgeProtocol::new(transport);

        protocol
            .set_control_lines(ControlLines::Read | ControlLines::Cartridge)
            .unwrap();
    }

    #[test]
    fn test_read_section() {
        let mut sequence = Sequence::new();
        let mut transport = MockTransport::new();

        transport
            .expect_write_exact()
            .with(eq(vec![0x01_u8, 0x00, 0xFF, 0xC0, 0xFF, 0xDF]))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));

        transport
            .expect_read_exact()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|buffer: &mut [u8]| {
                buffer.fill(0xAB);
                Ok(())
            });

        let mut protocol = CartridgeProtocol::new(transport);
        let mut buffer = [0u8; 32];

        protocol
            .read_section(Section { bank: 0, start: 0xFFC0, end: 0xFFDF }, &mut buffer)
            .unwrap();

        assert_eq!(buffer, [0xAB; 32]);
    }

    #[test]
    fn test_read_section_propagates_short_read() {
        let mut transport = MockTransport::new();

        transport.expect_write_exact().returning(|_| Ok(()));
        transport.expect_read_exact().returning(|buffer: &mut [u8]| {
            Err(TransportError::ShortRead {
                expected: buffer.len(),
                actual: 3,
            })
        });

        let mut protocol = CartridgeProtocol::new(transport);
        let mut buffer = [0u8; 16];

        let result = protocol.read_section(Section { bank: 1, start: 0x8000, end: 0xFFFF }, &mut buffer);

        assert!(matches!(
            result,
            Err(TransportError::ShortRead { expected: 16, actual: 3 })
        ));
    }

    #[test]
    fn test_begin_write_section() {
        let mut transport = MockTransport::new();
        transport
            .expect_write_exact()
            .with(eq(vec![0x02_u8, 0x00, 0x60, 0x00, 0x7F, 0xFF]))
            .times(1)
            .returning(|_| Ok(()));

        let mut protocol = CartridgeProtocol::new(transport);

        protocol
            .begin_write_section(Section { bank: 0, start: 0x6000, end: 0x7FFF })
            .unwrap();
    }
}
