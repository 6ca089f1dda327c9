//! # PLR Core Library
//!
//! Protocol engine for Bosch PLR laser distance meters.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The checksum engine (custom CRC-8 / CRC-32)
//! - Frame encoding, decoding and stream reassembly
//! - Decoders for the device's measurement and info records
//! - Request/response correlation over one shared byte stream
//! - A device session over an RFCOMM serial port
//!
//! ## Example
//!
//! ```rust,ignore
//! use plr_core::protocol::{Device, DeviceConfig};
//!
//! let config = DeviceConfig {
//!     port_name: "/dev/rfcomm0".to_string(),
//!     ..Default::default()
//! };
//! let device = Device::connect(config)?;
//!
//! println!("{}", device.name().await?);
//! println!("{} mm", device.measure().await?);
//!
//! device.begin_receive().await?;
//! let pushed = device.wait_for_next_measurement().await?;
//! println!("{:?}", pushed);
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        Command, ConnectionState, Device, DeviceConfig, DeviceInfo, ExchangeData, Frame,
        MeasurementMode, ProtocolError, Reply, Units,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
