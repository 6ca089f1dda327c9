//! PLR Protocol Communication
//!
//! Implements the binary frame protocol spoken by Bosch PLR laser distance
//! meters over their Bluetooth serial profile.
//!
//! Replies to host commands and spontaneous measurement pushes arrive
//! interleaved on one byte stream; the correlator tells them apart.

pub mod checksum;
pub mod commands;
pub mod correlator;
mod device;
mod error;
pub mod frame;
pub mod payload;
pub mod serial;
pub mod stream;

pub use checksum::{ChecksumEngine, ChecksumVariant};
pub use commands::{Command, Reply, ReplyDecoder, PUSH_EXCHANGE_DATA};
pub use correlator::{Correlator, MeasurementHandle, ReplyHandle, RequestId, Submission};
pub use device::{ConnectionState, Device, DeviceConfig};
pub use error::ProtocolError;
pub use frame::{decode, encode, CommStatus, Frame, RequestFormat, RequestFrame, ResponseFrame};
pub use payload::{DeviceInfo, ExchangeData, MeasurementMode, Units};
pub use serial::{list_ports, open_port, PortInfo};
pub use stream::{FrameAssembler, PlrCodec, RejectedFrame};

/// Default baud rate for the serial port
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default reply deadline in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Maximum frame size accepted from the device
pub const MAX_FRAME_SIZE: usize = 1024;

/// Measurement pushes buffered per subscriber
pub const DEFAULT_PUSH_CAPACITY: usize = 64;

/// Bytes requested from the transport per read
pub const READ_CHUNK_SIZE: usize = 1024;
