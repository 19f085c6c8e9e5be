//! Decoding of the internal header every SNES cartridge carries.

use std::fmt;

use crate::BYTES_ON_A_KIBIBYTE;

/// The size of the header as returned by the device.
pub const HEADER_LENGTH: usize = 32;

/// The address, on bank zero, of the first byte of the header.
pub const HEADER_START_ADDRESS: u16 = 0xFFC0;

/// The address, on bank zero, of the last byte of the header.
pub const HEADER_END_ADDRESS: u16 = 0xFFDF;

/// The number of bytes of the title field.
const TITLE_LENGTH: usize = 21;

/// Offset of the map mode byte, its lowest bit tells the layout.
const MAP_MODE_OFFSET: usize = 21;

/// Offset of the ROM size byte, stored as a power of two of kibibytes.
const ROM_SIZE_OFFSET: usize = 23;

/// Offset of the SRAM size byte, stored as a number of 2 KiB blocks.
const SRAM_SIZE_OFFSET: usize = 24;

/// Offset of the region code.
const REGION_OFFSET: usize = 25;

/// Offset of the revision number.
const VERSION_OFFSET: usize = 27;

/// Offset of the most significant byte of the checksum.
const CHECKSUM_OFFSET: usize = 30;

/// The number of bytes of each unit of the SRAM size field.
const SRAM_BLOCK_SIZE: u32 = 2 * BYTES_ON_A_KIBIBYTE as u32;

/// How the ROM and SRAM of a cartridge are laid out in the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// ROM banks are mapped on the upper half of each bank.
    LoRom,

    /// ROM banks are mapped on the whole bank.
    HiRom,
}

impl Layout {
    /// The address where each ROM bank window starts.
    pub fn rom_bank_start_address(self) -> u16 {
        match self {
            Layout::HiRom => 0x0000,
            Layout::LoRom => 0x8000,
        }
    }

    /// The address where the SRAM window starts.
    pub fn sram_start_address(self) -> u16 {
        match self {
            Layout::HiRom => 0x6000,
            Layout::LoRom => 0x8000,
        }
    }

    /// If SRAM access needs the cartridge address space select line.
    pub fn selects_cartridge_for_sram(self) -> bool {
        self == Layout::HiRom
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::LoRom => write!(f, "LoROM"),
            Layout::HiRom => write!(f, "HiROM"),
        }
    }
}

/// The region a cartridge was released for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Japan, NTSC.
    Japan,

    /// United States and Canada, NTSC.
    NorthAmerica,

    /// Europe, Oceania and Asia, PAL.
    EuropeOceaniaAsia,

    /// Sweden, PAL.
    Sweden,

    /// Finland, PAL.
    Finland,

    /// Denmark, PAL.
    Denmark,

    /// France, PAL.
    France,

    /// The Netherlands, PAL.
    Netherlands,

    /// Spain, PAL.
    Spain,

    /// Germany, Austria and Switzerland, PAL.
    GermanyAustriaSwitzerland,

    /// Italy, PAL.
    Italy,

    /// Hong Kong and China, PAL.
    HongKongChina,

    /// Indonesia, PAL.
    Indonesia,

    /// South Korea, PAL.
    Korea,

    /// A code outside of the known table, kept as is.
    Unknown(u8),
}

/// Every known region, indexed by its code.
const REGIONS: [Region; 14] = [
    Region::Japan,
    Region::NorthAmerica,
    Region::EuropeOceaniaAsia,
    Region::Sweden,
    Region::Finland,
    Region::Denmark,
    Region::France,
    Region::Netherlands,
    Region::Spain,
    Region::GermanyAustriaSwitzerland,
    Region::Italy,
    Region::HongKongChina,
    Region::Indonesia,
    Region::Korea,
];

impl Region {
    /// Look up a region code, unknown codes are never an error.
    pub fn from_code(code: u8) -> Region {
        REGIONS
            .get(code as usize)
            .copied()
            .unwrap_or(Region::Unknown(code))
    }

    /// The code stored on the header for this region.
    pub fn code(self) -> u8 {
        match self {
            Region::Unknown(code) => code,
            known => REGIONS
                .iter()
                .position(|region| *region == known)
                .map_or(0, |index| index as u8),
        }
    }

    /// A readable name including the video standard, `None` for unknown codes.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Region::Japan => "Japan (NTSC)",
            Region::NorthAmerica => "USA (NTSC)",
            Region::EuropeOceaniaAsia => "Europe, Oceania, Asia (PAL)",
            Region::Sweden => "Sweden (PAL)",
            Region::Finland => "Finland (PAL)",
            Region::Denmark => "Denmark (PAL)",
            Region::France => "France (PAL)",
            Region::Netherlands => "Netherlands (PAL)",
            Region::Spain => "Spain (PAL)",
            Region::GermanyAustriaSwitzerland => "Germany, Austria, Switzerland (PAL)",
            Region::Italy => "Italy (PAL)",
            Region::HongKongChina => "Hong Kong, China (PAL)",
            Region::Indonesia => "Indonesia (PAL)",
            Region::Korea => "Korea (PAL)",
            Region::Unknown(_) => return None,
        };

        Some(name)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{}", self.code()),
        }
    }
}

/// Tell if the bytes read as a header hold any data at all.
///
/// The device answers with zeroes when the cartridge is missing or the link is
/// faulty, so an all zero header must never be trusted.
pub fn is_valid_header(bytes: &[u8]) -> bool {
    bytes.iter().any(|&byte| byte != 0)
}

/// The decoded cartridge header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartridgeHeader {
    /// The bytes as returned by the device.
    pub raw: [u8; HEADER_LENGTH],

    /// The game title, trailing whitespace removed.
    pub title: String,

    /// Where ROM and SRAM are mapped.
    pub layout: Layout,

    /// The size of the ROM, saturated at [u64::MAX] for nonsensical size codes.
    pub rom_size_bytes: u64,

    /// The size of the battery backed SRAM, zero if there is none.
    pub sram_size_bytes: u32,

    /// The release region.
    pub region: Region,

    /// The revision number of the game.
    pub version: u8,

    /// The checksum stored on the header, not verified.
    pub checksum: u16,
}

impl CartridgeHeader {
    /// Decode the fields of a raw header.
    pub fn from_bytes(raw: [u8; HEADER_LENGTH]) -> CartridgeHeader {
        let title = String::from_utf8_lossy(&raw[..TITLE_LENGTH])
            .trim_end()
            .to_string();

        let layout = if raw[MAP_MODE_OFFSET] & 1 == 1 {
            Layout::HiRom
        } else {
            Layout::LoRom
        };

        let rom_size_bytes = 1u64
            .checked_shl(raw[ROM_SIZE_OFFSET] as u32)
            .and_then(|kibibytes| kibibytes.checked_mul(BYTES_ON_A_KIBIBYTE as u64))
            .unwrap_or(u64::MAX);

        CartridgeHeader {
            title,
            layout,
            rom_size_bytes,
            sram_size_bytes: raw[SRAM_SIZE_OFFSET] as u32 * SRAM_BLOCK_SIZE,
            region: Region::from_code(raw[REGION_OFFSET]),
            version: raw[VERSION_OFFSET],
            checksum: u16::from_be_bytes([raw[CHECKSUM_OFFSET], raw[CHECKSUM_OFFSET + 1]]),
            raw,
        }
    }

    /// If the header holds any data, see [is_valid_header].
    pub fn is_valid(&self) -> bool {
        is_valid_header(&self.raw)
    }

    /// If the cartridge has battery backed SRAM.
    pub fn has_sram(&self) -> bool {
        self.sram_size_bytes > 0
    }
}

impl fmt::Display for CartridgeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Title: {}", self.title)?;
        writeln!(f, "Layout: {}", self.layout)?;

        if self.rom_size_bytes == u64::MAX {
            writeln!(f, "ROM size: invalid ({:#04X})", self.raw[ROM_SIZE_OFFSET])?;
        } else {
            writeln!(f, "ROM size: {} KiB", self.rom_size_bytes / BYTES_ON_A_KIBIBYTE as u64)?;
        }

        writeln!(f, "SRAM size: {} KiB", self.sram_size_bytes / BYTES_ON_A_KIBIBYTE as u32)?;
        writeln!(f, "Region: {}", self.region)?;
        writeln!(f, "Version: {}", self.version)?;
        write!(f, "Checksum: {:#06X}", self.checksum)
    }
}
