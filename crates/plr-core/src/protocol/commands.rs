//! Protocol commands
//!
//! Defines the commands the host issues to a PLR device and how each reply
//! payload is interpreted.

use serde::{Deserialize, Serialize};

use super::payload::{
    decode_ascii, decode_distance, decode_exchange_data, decode_info, DeviceInfo, ExchangeData,
};
use super::ProtocolError;

/// Command code of a spontaneous exchange data push
pub const PUSH_EXCHANGE_DATA: u8 = 0x55;

/// Commands for PLR communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Device name
    Name,

    /// Device identification record
    Info,

    /// Trigger a single distance measurement
    Measure,

    /// Switch the laser on
    LaserOn,
    /// Switch the laser off
    LaserOff,
    /// Switch the display backlight on
    BacklightOn,
    /// Switch the display backlight off
    BacklightOff,

    /// Enable exchange data pushes
    BeginReceive,
}

impl Command {
    /// Every command, in code order
    pub const ALL: [Command; 8] = [
        Command::Name,
        Command::Info,
        Command::Measure,
        Command::LaserOn,
        Command::LaserOff,
        Command::BacklightOn,
        Command::BacklightOff,
        Command::BeginReceive,
    ];

    /// Frame template without its checksum
    pub fn template(&self) -> &'static [u8] {
        match self {
            Command::Name => &[0xc0, 0x05, 0x00],
            Command::Info => &[0xc0, 0x06, 0x00],
            Command::Measure => &[0xc0, 0x40, 0x00],
            Command::LaserOn => &[0xc0, 0x41, 0x00],
            Command::LaserOff => &[0xc0, 0x42, 0x00],
            Command::BacklightOn => &[0xc0, 0x47, 0x00],
            Command::BacklightOff => &[0xc0, 0x48, 0x00],
            Command::BeginReceive => &[0xc0, 0x55, 0x02, 0x01, 0x00],
        }
    }

    /// Command byte
    pub fn code(&self) -> u8 {
        self.template()[1]
    }

    /// How the reply payload is decoded
    pub fn reply_decoder(&self) -> ReplyDecoder {
        match self {
            Command::Name => ReplyDecoder::Ascii,
            Command::Info => ReplyDecoder::DeviceInfo,
            Command::Measure => ReplyDecoder::Distance,
            Command::BeginReceive => ReplyDecoder::ExchangeData,
            Command::LaserOn
            | Command::LaserOff
            | Command::BacklightOn
            | Command::BacklightOff => ReplyDecoder::Ack,
        }
    }
}

/// Interpretation applied to a successful reply payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyDecoder {
    /// NUL-padded ASCII text
    Ascii,
    /// Device info record
    DeviceInfo,
    /// Scaled distance
    Distance,
    /// Exchange data record
    ExchangeData,
    /// Payload ignored
    Ack,
}

impl ReplyDecoder {
    /// Decode a successful reply payload
    pub fn decode(&self, data: &[u8]) -> Result<Reply, ProtocolError> {
        Ok(match self {
            ReplyDecoder::Ascii => Reply::Text(decode_ascii(data)?),
            ReplyDecoder::DeviceInfo => Reply::Info(decode_info(data)?),
            ReplyDecoder::Distance => Reply::Distance(decode_distance(data)?),
            ReplyDecoder::ExchangeData => Reply::Exchange(decode_exchange_data(data)?),
            ReplyDecoder::Ack => Reply::Ack,
        })
    }
}

/// A decoded reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Text reply (device name)
    Text(String),
    /// Device info
    Info(DeviceInfo),
    /// Millimetres
    Distance(f64),
    /// Current exchange data
    Exchange(ExchangeData),
    /// Command accepted
    Ack,
}
