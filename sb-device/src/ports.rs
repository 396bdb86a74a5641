use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tracing::warn;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub device: String,
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub usb_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PortScan {
    pub ports: Vec<PortDescriptor>,
    #[serde(default)]
    pub diagnostic: Option<String>,
}

// Enumeration is best-effort: a failed query degrades to an empty listing
// with the underlying error preserved as a diagnostic, never a hard error.
pub fn scan_ports() -> PortScan {
    match serialport::available_ports() {
        Ok(infos) => {
            let mut ports = infos.into_iter().map(describe).collect::<Vec<_>>();
            ports.sort_by(|lhs, rhs| lhs.device.cmp(&rhs.device));
            PortScan {
                ports,
                diagnostic: None,
            }
        }
        Err(err) => {
            warn!("serial port enumeration failed: {err}");
            PortScan {
                ports: Vec::new(),
                diagnostic: Some(err.to_string()),
            }
        }
    }
}

fn describe(info: serialport::SerialPortInfo) -> PortDescriptor {
    match info.port_type {
        SerialPortType::UsbPort(usb) => {
            let description = usb
                .product
                .or(usb.manufacturer)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty());
            PortDescriptor {
                device: info.port_name,
                kind: "usb".to_string(),
                description,
                usb_id: Some(format!("{:04x}:{:04x}", usb.vid, usb.pid)),
            }
        }
        SerialPortType::PciPort => PortDescriptor {
            device: info.port_name,
            kind: "pci".to_string(),
            description: None,
            usb_id: None,
        },
        SerialPortType::BluetoothPort => PortDescriptor {
            device: info.port_name,
            kind: "bluetooth".to_string(),
            description: None,
            usb_id: None,
        },
        SerialPortType::Unknown => PortDescriptor {
            device: info.port_name,
            kind: "unknown".to_string(),
            description: None,
            usb_id: None,
        },
    }
}
