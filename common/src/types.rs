use std::collections::BTreeMap;

use serde::Serialize;

pub const INPUT_COUNT: usize = 8;
pub const OUTPUT_COUNT: usize = 4;

pub const FIRMWARE_REVISION: u32 = 2025121900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardType {
    Lite,
    Rs485,
    Wifi,
}

impl BoardType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Lite => "Opta Lite AFX00003",
            Self::Rs485 => "Opta RS485 AFX00001",
            Self::Wifi => "Opta Wifi AFX00002",
        }
    }

    pub fn has_wifi(self) -> bool {
        matches!(self, Self::Wifi)
    }

    pub fn has_rs485(self) -> bool {
        matches!(self, Self::Rs485)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Ethernet,
    WifiStandard,
    WifiAccessPoint,
}

impl NetworkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ethernet => "ethernet",
            Self::WifiStandard => "wifi standard",
            Self::WifiAccessPoint => "wifi access point",
        }
    }

    pub fn is_access_point(self) -> bool {
        matches!(self, Self::WifiAccessPoint)
    }
}

/// Radio state as reported by the Wi-Fi module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioStatus {
    NoModule,
    Idle,
    Connected,
    Disconnected,
    ConnectFailed,
    Listening,
    ClientAttached,
}

/// Human readable form of a `YYYYMMDDRR` revision number, e.g. `2025.12.19 (r00)`.
pub fn version_label(revision: u32) -> String {
    let year = revision / 1_000_000;
    let month = revision / 10_000 % 100;
    let day = revision / 100 % 100;
    let build = revision % 100;
    format!("{year:04}.{month:02}.{day:02} (r{build:02})")
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusEnvelope {
    pub status: &'static str,
    pub message: &'static str,
}

impl StatusEnvelope {
    pub fn success(message: &'static str) -> Self {
        Self {
            status: "success",
            message,
        }
    }

    pub fn error(message: &'static str) -> Self {
        Self {
            status: "error",
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum InputReading {
    Volts(f32),
    Level(u8),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InputStatus {
    #[serde(rename = "type")]
    pub kind: u8,
    pub value: InputReading,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DataPayload {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub version: String,
    #[serde(rename = "mqttConnected")]
    pub mqtt_connected: bool,
    pub time: String,
    pub gmt: i32,
    pub inputs: BTreeMap<String, InputStatus>,
    pub outputs: BTreeMap<String, u8>,
}
