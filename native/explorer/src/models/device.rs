use std::{collections::BTreeMap, fmt};

use crate::error::ExplorerError;

pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";
pub const DEFAULT_TCP_PORT: u16 = 5555;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    Ready,
    Unauthorized,
    #[default]
    Unknown,
}

impl DeviceState {
    /// Maps the state column of `adb devices`
    pub fn from_adb(state: &str) -> Self {
        match state {
            "device" => Self::Ready,
            "unauthorized" => Self::Unauthorized,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ready => "ready",
            Self::Unauthorized => "unauthorized",
            Self::Unknown => "unknown",
        })
    }
}

/// A device as shown in the device picker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Serial for USB devices, `host:port` for wireless ones
    pub id: String,
    pub display_name: String,
    pub state: DeviceState,
}

impl Device {
    pub fn is_available(&self) -> bool {
        self.state == DeviceState::Ready
    }

    pub fn is_wireless(&self) -> bool {
        self.id.contains(':') || is_mdns_name(&self.id)
    }
}

/// One raw row of the device enumeration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceRecord {
    pub serial: String,
    pub state: String,
    /// Trailing `key:value` pairs such as `model:Pixel_7`
    pub properties: BTreeMap<String, String>,
}

impl DeviceRecord {
    /// Display name derived from the `model` property
    pub fn model_name(&self) -> Option<String> {
        self.properties
            .get("model")
            .map(|model| model.replace('_', " "))
            .filter(|model| !model.trim().is_empty())
    }

    pub fn to_device(&self) -> Device {
        Device {
            id: self.serial.clone(),
            display_name: self.model_name().unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()),
            state: DeviceState::from_adb(&self.state),
        }
    }
}

/// What the user asked to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// A device the adb server already lists, over USB or found through mDNS
    Serial(String),
    Tcp { host: String, port: u16 },
}

impl ConnectTarget {
    /// Anything with a `.` or `:` is a network address, port 5555 when omitted.
    /// mDNS service names like `adb-XXXX._adb-tls-connect._tcp` are serials.
    pub fn parse(target: &str) -> Result<Self, ExplorerError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(ExplorerError::PreconditionUnmet("Device address is empty".to_string()));
        }
        if is_mdns_name(target) || (!target.contains('.') && !target.contains(':')) {
            return Ok(Self::Serial(target.to_string()));
        }
        let (host, port) = match target.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    ExplorerError::PreconditionUnmet(format!("Invalid port '{port}'"))
                })?;
                (host, port)
            }
            None => (target, DEFAULT_TCP_PORT),
        };
        if host.is_empty() {
            return Err(ExplorerError::PreconditionUnmet(format!("Invalid address '{target}'")));
        }
        Ok(Self::Tcp { host: host.to_string(), port })
    }

    /// Serial adb will list the device under
    pub fn serial(&self) -> String {
        match self {
            Self::Serial(serial) => serial.clone(),
            Self::Tcp { host, port } => format!("{host}:{port}"),
        }
    }
}

fn is_mdns_name(serial: &str) -> bool {
    serial.contains("._adb")
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serial())
    }
}

/// Parses the output of `adb devices -l`
pub fn parse_device_table(text: &str) -> Vec<DeviceRecord> {
    text.lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*')
        })
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let serial = columns.next()?.to_string();
            let state = columns.next()?.to_string();
            let properties = columns
                .filter_map(|pair| pair.split_once(':'))
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect();
            Some(DeviceRecord { serial, state, properties })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES_OUTPUT: &str = "\
* daemon not running; starting now at tcp:5037
* daemon started successfully
List of devices attached
emulator-5554          device product:sdk_gphone64 model:sdk_gphone64_x86_64 device:emu64x transport_id:1
192.168.1.20:5555      unauthorized transport_id:3
R58N12345              offline
";

    #[test]
    fn parses_device_table() {
        let records = parse_device_table(DEVICES_OUTPUT);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].serial, "emulator-5554");
        assert_eq!(records[0].properties["transport_id"], "1");

        let devices: Vec<Device> = records.iter().map(DeviceRecord::to_device).collect();
        assert_eq!(devices[0].display_name, "sdk gphone64 x86 64");
        assert!(devices[0].is_available());
        assert_eq!(devices[1].state, DeviceState::Unauthorized);
        assert_eq!(devices[1].display_name, UNKNOWN_DEVICE_NAME);
        assert!(devices[1].is_wireless());
        assert_eq!(devices[2].state, DeviceState::Unknown);
    }

    #[test]
    fn connect_targets() {
        assert_eq!(
            ConnectTarget::parse("emulator-5554").unwrap(),
            ConnectTarget::Serial("emulator-5554".into())
        );
        assert_eq!(
            ConnectTarget::parse("192.168.1.20").unwrap(),
            ConnectTarget::Tcp { host: "192.168.1.20".into(), port: DEFAULT_TCP_PORT }
        );
        assert_eq!(ConnectTarget::parse(" 10.0.0.2:5039 ").unwrap().serial(), "10.0.0.2:5039");
        assert!(ConnectTarget::parse("10.0.0.2:abc").is_err());
        assert!(ConnectTarget::parse("").is_err());
        assert!(ConnectTarget::parse(":5555").is_err());

        let mdns = "adb-R58N12345-AbCdEf._adb-tls-connect._tcp";
        assert_eq!(ConnectTarget::parse(mdns).unwrap(), ConnectTarget::Serial(mdns.into()));
        assert_eq!(ConnectTarget::parse(mdns).unwrap().serial(), mdns);
        let device = Device { id: mdns.into(), display_name: "x".into(), state: DeviceState::Ready };
        assert!(device.is_wireless());
    }

    #[test]
    fn empty_table_yields_no_devices() {
        assert!(parse_device_table("List of devices attached\n\n").is_empty());
    }
}
