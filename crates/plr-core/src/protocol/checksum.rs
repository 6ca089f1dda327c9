//! Checksum engine
//!
//! The PLR frames are authenticated with one of two custom CRCs. Both are
//! non-reflected with a zero final XOR:
//!
//! | variant | poly       | init       |
//! |---------|------------|------------|
//! | CRC-8   | 0xA6       | 0xAA       |
//! | CRC-32  | 0x04C11DB7 | 0xAAAAAAAA |

use crc::{Algorithm, Crc};

use super::frame::RequestFormat;
use super::ProtocolError;

/// CRC-8 used for long and short frames
pub const CRC_8_PLR: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0xa6,
    init: 0xaa,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xf4,
    residue: 0x00,
};

/// CRC-32 used for extended frames
pub const CRC_32_PLR: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c11db7,
    init: 0xaaaaaaaa,
    refin: false,
    refout: false,
    xorout: 0x00000000,
    check: 0x7ac43c6f,
    residue: 0x00000000,
};

/// Which checksum authenticates a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumVariant {
    /// One byte, long and short frames
    Crc8,
    /// Four bytes, extended frames
    Crc32,
}

impl ChecksumVariant {
    /// Select the variant for a request format
    pub fn for_format(format: RequestFormat) -> Result<Self, ProtocolError> {
        match format {
            RequestFormat::Long | RequestFormat::Short => Ok(ChecksumVariant::Crc8),
            RequestFormat::Extended => Ok(ChecksumVariant::Crc32),
            RequestFormat::Reserved => Err(ProtocolError::UnsupportedMode(format.bits() << 2)),
        }
    }

    /// Number of bytes the checksum occupies on the wire
    pub fn width_bytes(&self) -> usize {
        match self {
            ChecksumVariant::Crc8 => 1,
            ChecksumVariant::Crc32 => 4,
        }
    }
}

/// Holds both CRC calculators.
///
/// Build one per session and hand it to the frame codec by reference.
pub struct ChecksumEngine {
    crc8: Crc<u8>,
    crc32: Crc<u32>,
}

impl ChecksumEngine {
    /// Build both calculators
    pub fn new() -> Self {
        Self {
            crc8: Crc::<u8>::new(&CRC_8_PLR),
            crc32: Crc::<u32>::new(&CRC_32_PLR),
        }
    }

    /// Compute the checksum of `bytes` with the given variant
    pub fn compute(&self, variant: ChecksumVariant, bytes: &[u8]) -> u32 {
        match variant {
            ChecksumVariant::Crc8 => self.crc8.checksum(bytes) as u32,
            ChecksumVariant::Crc32 => self.crc32.checksum(bytes),
        }
    }

    /// Compute the checksum and render it MSB first in its wire width
    pub fn checksum_bytes(&self, variant: ChecksumVariant, bytes: &[u8]) -> Vec<u8> {
        let value = self.compute(variant, bytes);
        match variant {
            ChecksumVariant::Crc8 => vec![value as u8],
            ChecksumVariant::Crc32 => value.to_be_bytes().to_vec(),
        }
    }
}

impl Default for ChecksumEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChecksumEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc8_check_value() {
        let engine = ChecksumEngine::new();
        assert_eq!(engine.compute(ChecksumVariant::Crc8, b"123456789"), 0xf4);
    }

    #[test]
    fn test_crc32_check_value() {
        let engine = ChecksumEngine::new();
        assert_eq!(
            engine.compute(ChecksumVariant::Crc32, b"123456789"),
            0x7ac43c6f
        );
    }

    #[test]
    fn test_empty_input_yields_init() {
        let engine = ChecksumEngine::new();
        assert_eq!(engine.compute(ChecksumVariant::Crc8, &[]), 0xaa);
        assert_eq!(engine.compute(ChecksumVariant::Crc32, &[]), 0xaaaaaaaa);
    }

    #[test]
    fn test_command_template_checksums() {
        let engine = ChecksumEngine::new();
        assert_eq!(engine.compute(ChecksumVariant::Crc8, &[0xc0, 0x05, 0x00]), 0xc2);
        assert_eq!(engine.compute(ChecksumVariant::Crc8, &[0xc0, 0x40, 0x00]), 0xee);
        assert_eq!(
            engine.compute(ChecksumVariant::Crc8, &[0xc0, 0x55, 0x02, 0x01, 0x00]),
            0x1a
        );
    }

    #[test]
    fn test_deterministic() {
        let engine = ChecksumEngine::new();
        let data = [0xc8, 0x10, 0x02, 0x00, 0xab, 0xcd];
        let a = engine.compute(ChecksumVariant::Crc32, &data);
        let b = engine.compute(ChecksumVariant::Crc32, &data);
        assert_eq!(a, b);
        assert_eq!(a, 0x895ea85d);
    }

    #[test]
    fn test_checksum_bytes_width() {
        let engine = ChecksumEngine::new();
        assert_eq!(engine.checksum_bytes(ChecksumVariant::Crc8, b"x").len(), 1);
        assert_eq!(
            engine.checksum_bytes(ChecksumVariant::Crc32, b"123456789"),
            vec![0x7a, 0xc4, 0x3c, 0x6f]
        );
    }

    #[test]
    fn test_variant_for_format() {
        assert_eq!(
            ChecksumVariant::for_format(RequestFormat::Long).unwrap(),
            ChecksumVariant::Crc8
        );
        assert_eq!(
            ChecksumVariant::for_format(RequestFormat::Short).unwrap(),
            ChecksumVariant::Crc8
        );
        assert_eq!(
            ChecksumVariant::for_format(RequestFormat::Extended).unwrap(),
            ChecksumVariant::Crc32
        );
        assert!(matches!(
            ChecksumVariant::for_format(RequestFormat::Reserved),
            Err(ProtocolError::UnsupportedMode(0x0c))
        ));
    }
}
