//! Frame encoding/decoding
//!
//! Every frame starts with an info byte whose bits 7-6 select the shape:
//!
//! ```text
//! 00xx xxxx  response      [info][len][data ..][crc8]
//! 11xx xxxx  request/push  [info][cmd][len?][data ..][crc]
//! other      invalid
//! ```
//!
//! Request/push frames are what the host sends and also what the device
//! pushes on its own. Bits 3-2 of the info byte give the request format,
//! which decides where the length lives and which checksum follows:
//!
//! | format   | length field        | data at | checksum          |
//! |----------|---------------------|---------|-------------------|
//! | long     | u8 at 2             | 3       | CRC-8 at 3 + len  |
//! | short    | none (0)            | -       | CRC-8 at 2        |
//! | extended | u16 LE at 2..4      | 4       | CRC-32 at 4 + len |

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::checksum::{ChecksumEngine, ChecksumVariant};
use super::{ProtocolError, MAX_FRAME_SIZE};

const SHAPE_MASK: u8 = 0b1100_0000;
const SHAPE_RESPONSE: u8 = 0b0000_0000;
const SHAPE_REQUEST: u8 = 0b1100_0000;

const HAND_RAISED: u8 = 0b0010_0000;
const NOT_READY: u8 = 0b0001_0000;
const HARDWARE_ERROR: u8 = 0b0000_1000;

/// Device-reported outcome of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommStatus {
    /// Request handled
    Success,
    /// Device timed out receiving the request
    CommunicationTimeout,
    /// Also reported on frame overflow
    InvalidMode,
    /// Device rejected the request checksum
    ChecksumError,
    /// Command code not recognised
    UnknownCommand,
    /// Command needs a higher access level
    InvalidAccessLevel,
    /// Request data out of range
    InvalidData,
    /// Status code 7
    Reserved,
}

impl CommStatus {
    /// Map bits 2-0 of a response info byte
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0 => CommStatus::Success,
            1 => CommStatus::CommunicationTimeout,
            2 => CommStatus::InvalidMode,
            3 => CommStatus::ChecksumError,
            4 => CommStatus::UnknownCommand,
            5 => CommStatus::InvalidAccessLevel,
            6 => CommStatus::InvalidData,
            _ => CommStatus::Reserved,
        }
    }

    /// Status code as carried in bits 2-0
    pub fn bits(&self) -> u8 {
        match self {
            CommStatus::Success => 0,
            CommStatus::CommunicationTimeout => 1,
            CommStatus::InvalidMode => 2,
            CommStatus::ChecksumError => 3,
            CommStatus::UnknownCommand => 4,
            CommStatus::InvalidAccessLevel => 5,
            CommStatus::InvalidData => 6,
            CommStatus::Reserved => 7,
        }
    }

    /// True for `Success`
    pub fn is_success(&self) -> bool {
        *self == CommStatus::Success
    }
}

/// Layout of a request/push frame body (also used for the response format bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestFormat {
    /// u8 length, CRC-8
    Long,
    /// No data, CRC-8
    Short,
    /// u16 length, CRC-32
    Extended,
    /// Not defined by the device
    Reserved,
}

impl RequestFormat {
    /// Map a 2-bit field
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => RequestFormat::Long,
            0b01 => RequestFormat::Short,
            0b10 => RequestFormat::Extended,
            _ => RequestFormat::Reserved,
        }
    }

    /// Two-bit field value
    pub fn bits(&self) -> u8 {
        match self {
            RequestFormat::Long => 0b00,
            RequestFormat::Short => 0b01,
            RequestFormat::Extended => 0b10,
            RequestFormat::Reserved => 0b11,
        }
    }

    /// Offset of the first data byte (short frames carry none, so
    /// their checksum sits right after the command)
    fn data_offset(&self) -> usize {
        match self {
            RequestFormat::Long => 3,
            RequestFormat::Short => 2,
            _ => 4,
        }
    }
}

/// A frame answering a host request
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    /// Device asks to talk
    pub hand_raised: bool,
    /// E.g. sensor not calibrated
    pub not_ready: bool,
    /// Device flagged a hardware fault
    pub hardware_error: bool,
    /// Outcome of the request
    pub comm_status: CommStatus,
    /// Reply payload
    pub data: Vec<u8>,
    /// Trailing CRC-8, when the buffer carried one
    pub checksum: Option<u8>,
}

impl ResponseFrame {
    /// Successful response carrying `data`
    pub fn success(data: Vec<u8>) -> Self {
        Self::with_status(CommStatus::Success, data)
    }

    /// Response with an explicit status
    pub fn with_status(comm_status: CommStatus, data: Vec<u8>) -> Self {
        Self {
            hand_raised: false,
            not_ready: false,
            hardware_error: false,
            comm_status,
            data,
            checksum: None,
        }
    }

    fn info_byte(&self) -> u8 {
        let mut info = SHAPE_RESPONSE | self.comm_status.bits();
        if self.hand_raised {
            info |= HAND_RAISED;
        }
        if self.not_ready {
            info |= NOT_READY;
        }
        if self.hardware_error {
            info |= HARDWARE_ERROR;
        }
        info
    }

    /// Serialize with a trailing CRC-8 (what a device sends back)
    pub fn to_bytes(&self, engine: &ChecksumEngine) -> Result<Vec<u8>, ProtocolError> {
        let length = u8::try_from(self.data.len()).map_err(|_| {
            ProtocolError::MalformedFrame(format!(
                "response data of {} bytes does not fit a u8 length",
                self.data.len()
            ))
        })?;

        let mut bytes = Vec::with_capacity(3 + self.data.len());
        bytes.push(self.info_byte());
        bytes.push(length);
        bytes.extend_from_slice(&self.data);
        let crc = engine.checksum_bytes(ChecksumVariant::Crc8, &bytes);
        bytes.extend_from_slice(&crc);
        Ok(bytes)
    }
}

/// A host request or a spontaneous device push (same wire shape)
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    /// Bits 3-2: layout of this frame
    pub request_format: RequestFormat,
    /// Bits 1-0: layout asked of the reply
    pub response_format: RequestFormat,
    /// Command code
    pub command: u8,
    /// Declared data length
    pub data_length: usize,
    /// Frame data
    pub data: Vec<u8>,
    /// Checksum as carried on the wire
    pub checksum: u32,
}

impl RequestFrame {
    /// Serialize the frame fields and append the checksum.
    ///
    /// `data_length` and `checksum` are recomputed from `data`.
    pub fn to_bytes(&self, engine: &ChecksumEngine) -> Result<Vec<u8>, ProtocolError> {
        let info = SHAPE_REQUEST | (self.request_format.bits() << 2) | self.response_format.bits();
        let mut template = vec![info, self.command];

        match self.request_format {
            RequestFormat::Long => {
                let length = u8::try_from(self.data.len()).map_err(|_| {
                    ProtocolError::MalformedFrame(format!(
                        "{} data bytes exceed a long frame",
                        self.data.len()
                    ))
                })?;
                template.push(length);
            }
            RequestFormat::Short => {
                if !self.data.is_empty() {
                    return Err(ProtocolError::MalformedFrame(
                        "short frames carry no data".to_string(),
                    ));
                }
            }
            RequestFormat::Extended => {
                let length = u16::try_from(self.data.len()).map_err(|_| {
                    ProtocolError::MalformedFrame(format!(
                        "{} data bytes exceed an extended frame",
                        self.data.len()
                    ))
                })?;
                let mut len_bytes = [0u8; 2];
                LittleEndian::write_u16(&mut len_bytes, length);
                template.extend_from_slice(&len_bytes);
            }
            RequestFormat::Reserved => return Err(ProtocolError::UnsupportedMode(info)),
        }

        template.extend_from_slice(&self.data);
        encode(engine, &template)
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Reply to a host request
    Response(ResponseFrame),
    /// Host request or device push
    Request(RequestFrame),
    /// Info byte matched no known shape
    Invalid { info: u8 },
}

/// True when `info` opens a response frame
pub fn is_response(info: u8) -> bool {
    info & SHAPE_MASK == SHAPE_RESPONSE
}

/// Encode a command template: append the checksum selected by bits 3-2 of byte 0
pub fn encode(engine: &ChecksumEngine, template: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let info = *template
        .first()
        .ok_or_else(|| ProtocolError::MalformedFrame("empty command template".to_string()))?;

    let variant = match (info >> 2) & 0b11 {
        0b00 | 0b01 => ChecksumVariant::Crc8,
        0b10 => ChecksumVariant::Crc32,
        _ => return Err(ProtocolError::UnsupportedMode(info)),
    };

    let mut frame = Vec::with_capacity(template.len() + variant.width_bytes());
    frame.extend_from_slice(template);
    frame.extend_from_slice(&engine.checksum_bytes(variant, template));
    Ok(frame)
}

/// Decode a frame and verify its checksum
pub fn decode(engine: &ChecksumEngine, buffer: &[u8]) -> Result<Frame, ProtocolError> {
    decode_with(engine, buffer, true)
}

/// Decode a frame, optionally skipping checksum verification
pub fn decode_with(
    engine: &ChecksumEngine,
    buffer: &[u8],
    verify: bool,
) -> Result<Frame, ProtocolError> {
    let info = *buffer
        .first()
        .ok_or_else(|| ProtocolError::MalformedFrame("empty buffer".to_string()))?;

    match info & SHAPE_MASK {
        SHAPE_RESPONSE => decode_response(engine, info, buffer, verify).map(Frame::Response),
        SHAPE_REQUEST => decode_request(engine, info, buffer, verify).map(Frame::Request),
        _ => Ok(Frame::Invalid { info }),
    }
}

fn decode_response(
    engine: &ChecksumEngine,
    info: u8,
    buffer: &[u8],
    verify: bool,
) -> Result<ResponseFrame, ProtocolError> {
    let length = *buffer
        .get(1)
        .ok_or_else(|| ProtocolError::MalformedFrame("response missing length byte".to_string()))?
        as usize;
    let data_end = 2 + length;
    let data = buffer.get(2..data_end).ok_or_else(|| {
        ProtocolError::MalformedFrame(format!(
            "response declares {} data bytes, buffer holds {}",
            length,
            buffer.len().saturating_sub(2)
        ))
    })?;

    let checksum = buffer.get(data_end).copied();
    if let (Some(actual), true) = (checksum, verify) {
        let expected = engine.compute(ChecksumVariant::Crc8, &buffer[..data_end]);
        if expected != actual as u32 {
            return Err(ProtocolError::ChecksumMismatch {
                expected,
                actual: actual as u32,
            });
        }
    }

    Ok(ResponseFrame {
        hand_raised: info & HAND_RAISED != 0,
        not_ready: info & NOT_READY != 0,
        hardware_error: info & HARDWARE_ERROR != 0,
        comm_status: CommStatus::from_bits(info),
        data: data.to_vec(),
        checksum,
    })
}

fn decode_request(
    engine: &ChecksumEngine,
    info: u8,
    buffer: &[u8],
    verify: bool,
) -> Result<RequestFrame, ProtocolError> {
    let request_format = RequestFormat::from_bits(info >> 2);
    let response_format = RequestFormat::from_bits(info);
    let variant = ChecksumVariant::for_format(request_format).map_err(|_| {
        ProtocolError::MalformedFrame(format!("reserved request format in {:#04x}", info))
    })?;

    let command = *buffer
        .get(1)
        .ok_or_else(|| ProtocolError::MalformedFrame("request missing command byte".to_string()))?;

    let data_length = declared_length(request_format, buffer)?;
    let data_offset = request_format.data_offset();
    let checksum_offset = data_offset + data_length;
    let frame_end = checksum_offset + variant.width_bytes();
    if buffer.len() < frame_end {
        return Err(ProtocolError::MalformedFrame(format!(
            "frame needs {} bytes, buffer holds {}",
            frame_end,
            buffer.len()
        )));
    }

    let data = buffer[data_offset..checksum_offset].to_vec();
    let checksum = match variant {
        ChecksumVariant::Crc8 => buffer[checksum_offset] as u32,
        ChecksumVariant::Crc32 => BigEndian::read_u32(&buffer[checksum_offset..frame_end]),
    };

    if verify {
        let expected = engine.compute(variant, &buffer[..checksum_offset]);
        if expected != checksum {
            return Err(ProtocolError::ChecksumMismatch {
                expected,
                actual: checksum,
            });
        }
    }

    Ok(RequestFrame {
        request_format,
        response_format,
        command,
        data_length,
        data,
        checksum,
    })
}

/// Read the data length a request/push frame declares
fn declared_length(format: RequestFormat, buffer: &[u8]) -> Result<usize, ProtocolError> {
    match format {
        RequestFormat::Long => buffer.get(2).map(|&len| len as usize).ok_or_else(|| {
            ProtocolError::MalformedFrame("long frame missing length byte".to_string())
        }),
        RequestFormat::Short => Ok(0),
        RequestFormat::Extended => buffer
            .get(2..4)
            .map(|len| LittleEndian::read_u16(len) as usize)
            .ok_or_else(|| {
                ProtocolError::MalformedFrame("extended frame missing length field".to_string())
            }),
        RequestFormat::Reserved => Err(ProtocolError::MalformedFrame(
            "reserved request format".to_string(),
        )),
    }
}

/// Total wire length of the frame starting at `buffer[0]`.
///
/// Returns `Ok(None)` when more bytes are needed to know. An info byte of
/// no known shape counts as a one-byte frame.
pub fn encoded_len(buffer: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(&info) = buffer.first() else {
        return Ok(None);
    };

    let total = match info & SHAPE_MASK {
        SHAPE_RESPONSE => match buffer.get(1) {
            Some(&len) => 2 + len as usize + ChecksumVariant::Crc8.width_bytes(),
            None => return Ok(None),
        },
        SHAPE_REQUEST => {
            let format = RequestFormat::from_bits(info >> 2);
            let variant = ChecksumVariant::for_format(format).map_err(|_| {
                ProtocolError::MalformedFrame(format!("reserved request format in {:#04x}", info))
            })?;
            let header_len = match format {
                RequestFormat::Long => 3,
                RequestFormat::Short => 2,
                _ => 4,
            };
            if buffer.len() < header_len {
                return Ok(None);
            }
            let data_length = declared_length(format, buffer)?;
            format.data_offset() + data_length + variant.width_bytes()
        }
        _ => 1,
    };

    if total > MAX_FRAME_SIZE {
        return Err(ProtocolError::MalformedFrame(format!(
            "declared frame of {} bytes exceeds {}",
            total, MAX_FRAME_SIZE
        )));
    }

    Ok(Some(total))
}
