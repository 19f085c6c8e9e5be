//! Host side driver for the serial attached SNES cartridge reader/writer.

pub mod header;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

/// The number of bytes in a kibibyte (1 KiB).
pub(crate) const BYTES_ON_A_KIBIBYTE: usize = 1024;

/// Extension methods for the [u16] type.
pub(crate) trait U16Ex {
    /// Get the least significant byte of the [u16].
    fn get_lower_byte(&self) -> u8;

    /// Get the most significant byte of the [u16].
    fn get_upper_byte(&self) -> u8;
}

impl U16Ex for u16 {
    #[inline(always)]
    fn get_lower_byte(&self) -> u8 {
        (self & 0x00FF) as u8
    }

    #[inline(always)]
    fn get_upper_byte(&self) -> u8 {
        ((self & 0xFF00) >> 8) as u8
    }
}
