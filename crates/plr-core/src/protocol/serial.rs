//! Serial port handling
//!
//! A paired PLR exposes its serial profile as an RFCOMM tty (for example
//! `/dev/rfcomm0` after `rfcomm bind`, or a Bluetooth COM port on Windows).
//! Pairing and binding happen outside this crate.

use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{ProtocolError, DEFAULT_BAUD_RATE};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/rfcomm0" or "COM5")
    pub name: String,

    /// Bluetooth-backed port, as far as the name or port type tells
    pub bluetooth: bool,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let bluetooth = matches!(info.port_type, SerialPortType::BluetoothPort)
            || is_rfcomm(&info.port_name);
        let product = match info.port_type {
            SerialPortType::UsbPort(usb_info) => usb_info.product,
            _ => None,
        };

        Self {
            name: info.port_name,
            bluetooth,
            product,
        }
    }
}

fn is_rfcomm(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .map(|base| base.starts_with("rfcomm"))
        .unwrap_or(false)
}

/// Sort key: Bluetooth/RFCOMM ports first (numeric suffix order), then the rest by name
fn port_sort_key(port: &PortInfo) -> (u8, usize, String) {
    let basename = port.name.rsplit('/').next().unwrap_or(&port.name);
    if let Some(rest) = basename.strip_prefix("rfcomm") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if port.bluetooth {
        return (1, 0, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List serial ports, RFCOMM ports first
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Bound RFCOMM devices are not always enumerated
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("rfcomm") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        bluetooth: true,
                        product: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(port_sort_key);
    v
}

/// Open a port as an async byte stream
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<SerialStream, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    tracing::debug!("opening {} at {} baud", name, baud);

    tokio_serial::new(name, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| match e.kind() {
            tokio_serial::ErrorKind::NoDevice => ProtocolError::SerialError(format!(
                "port not found: {}",
                name
            )),
            _ => ProtocolError::SerialError(e.to_string()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, bluetooth: bool) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            bluetooth,
            product: None,
        }
    }

    #[test]
    fn test_list_ports() {
        // Only checks that enumeration does not panic
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {} (bluetooth={})", port.name, port.bluetooth);
        }
    }

    #[test]
    fn test_rfcomm_detection() {
        assert!(is_rfcomm("/dev/rfcomm0"));
        assert!(is_rfcomm("rfcomm12"));
        assert!(!is_rfcomm("/dev/ttyUSB0"));
    }

    #[test]
    fn test_port_sorting() {
        let mut ports = vec![
            port("/dev/ttyUSB0", false),
            port("/dev/rfcomm10", true),
            port("COM7", true),
            port("/dev/rfcomm1", true),
            port("/dev/ttyACM0", false),
        ];

        ports.sort_by_key(port_sort_key);
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/rfcomm1",
                "/dev/rfcomm10",
                "COM7",
                "/dev/ttyACM0",
                "/dev/ttyUSB0",
            ]
        );
    }
}
