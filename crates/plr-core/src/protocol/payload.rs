//! Payload decoders
//!
//! Fixed-layout records carried in frame data. Multi-byte numbers are
//! little-endian as sent by the device.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Size of an exchange data record
pub const EXCHANGE_DATA_LEN: usize = 16;

/// Size of a device info record
pub const DEVICE_INFO_LEN: usize = 29;

/// Size of a distance reply
pub const DISTANCE_LEN: usize = 4;

/// Millimetres per distance count
pub const DISTANCE_SCALE: f64 = 0.05;

const UNITS_IMPERIAL: u8 = 0b0000_1000;
const LOW_BATTERY: u8 = 0b0000_0100;
const TEMPERATURE_WARNING: u8 = 0b0000_0010;
const LASER_ON: u8 = 0b0000_0001;

/// Measurement reference point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementMode {
    /// Front edge
    Front,
    /// Tripod thread
    Tripod,
    /// Rear edge
    Rear,
    /// Fold-out pin
    Pin,
}

impl MeasurementMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => MeasurementMode::Front,
            1 => MeasurementMode::Tripod,
            2 => MeasurementMode::Rear,
            _ => MeasurementMode::Pin,
        }
    }
}

/// Display units selected on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Units {
    /// Metres
    Metric,
    /// Feet and inches
    Imperial,
}

/// Live measurement/status record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExchangeData {
    /// Measurement counter
    pub id: u16,
    /// Main result shown on the display
    pub result: f32,
    /// First auxiliary value (e.g. area or volume parts)
    pub component_1: f32,
    /// Second auxiliary value
    pub component_2: f32,
    /// Reference point
    pub mode: MeasurementMode,
    /// Display units
    pub units: Units,
    /// Battery warning
    pub low_battery: bool,
    /// Temperature out of range
    pub temperature_warning: bool,
    /// Laser currently on
    pub laser_on: bool,
}

/// Device identification snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Four-character production date code
    pub date_code: String,
    /// Serial number
    pub serial_number: u32,
    /// Software revision counter
    pub sw_revision: u16,
    /// "major.minor.patch"
    pub sw_version: String,
    /// "major.minor.patch"
    pub hw_version: String,
    /// Bosch part number
    pub part_number: String,
}

fn require(data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() < expected {
        return Err(ProtocolError::TruncatedPayload {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Decode a 16-byte exchange data record
pub fn decode_exchange_data(data: &[u8]) -> Result<ExchangeData, ProtocolError> {
    require(data, EXCHANGE_DATA_LEN)?;

    let status = data[1];
    Ok(ExchangeData {
        id: LittleEndian::read_u16(&data[2..4]),
        result: LittleEndian::read_f32(&data[4..8]),
        component_1: LittleEndian::read_f32(&data[8..12]),
        component_2: LittleEndian::read_f32(&data[12..16]),
        mode: MeasurementMode::from_bits(data[0]),
        units: if status & UNITS_IMPERIAL != 0 {
            Units::Imperial
        } else {
            Units::Metric
        },
        low_battery: status & LOW_BATTERY != 0,
        temperature_warning: status & TEMPERATURE_WARNING != 0,
        laser_on: status & LASER_ON != 0,
    })
}

/// Decode a 29-byte device info record
pub fn decode_info(data: &[u8]) -> Result<DeviceInfo, ProtocolError> {
    require(data, DEVICE_INFO_LEN)?;

    Ok(DeviceInfo {
        date_code: decode_ascii(&data[0..4])?,
        serial_number: LittleEndian::read_u32(&data[4..8]),
        sw_revision: LittleEndian::read_u16(&data[8..10]),
        sw_version: decode_version(&data[10..13])?,
        hw_version: decode_version(&data[13..16])?,
        part_number: decode_ascii(&data[16..29])?,
    })
}

/// Decode a distance reply, in millimetres
pub fn decode_distance(data: &[u8]) -> Result<f64, ProtocolError> {
    require(data, DISTANCE_LEN)?;
    Ok(LittleEndian::read_u32(&data[..4]) as f64 * DISTANCE_SCALE)
}

/// Decode an ASCII string, dropping trailing NULs
pub fn decode_ascii(data: &[u8]) -> Result<String, ProtocolError> {
    if !data.is_ascii() {
        return Err(ProtocolError::InvalidResponse);
    }
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    Ok(data[..end].iter().map(|&b| b as char).collect())
}

/// Decode three version bytes into "major.minor.patch"
pub fn decode_version(data: &[u8]) -> Result<String, ProtocolError> {
    require(data, 3)?;
    Ok(format!("{}.{}.{}", data[0], data[1], data[2]))
}
