use std::{collections::BTreeMap, net::Ipv4Addr};

use log::{debug, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    hal::{IpAssignment, KvStore, StaticIp},
    types::{version_label, FIRMWARE_REVISION, INPUT_COUNT},
};

pub const CONFIG_STORE_KEY: &str = "config";
pub const BROKER_DISABLED_HOST: &str = "0.0.0.0";
pub const TIME_OFFSET_LIMIT_HOURS: i32 = 24;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("configuration JSON is not an object")]
    NotAnObject,
    #[error("no configuration record in store")]
    Missing,
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("input index {0} is out of range")]
    InputIndex(usize),
    #[error("input type code {0} is not 0, 1 or 2")]
    InputType(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Analog,
    Digital,
    Pulse,
}

impl InputType {
    pub fn code(self) -> u8 {
        match self {
            Self::Analog => 0,
            Self::Digital => 1,
            Self::Pulse => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Analog),
            1 => Some(Self::Digital),
            2 => Some(Self::Pulse),
            _ => None,
        }
    }

    pub fn is_analog(self) -> bool {
        matches!(self, Self::Analog)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub dhcp: bool,
    pub wifi: bool,
    pub ssid: String,
    pub password: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::new(192, 168, 1, 231),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            subnet: Ipv4Addr::new(255, 255, 0, 0),
            dns: Ipv4Addr::new(4, 4, 4, 4),
            dhcp: false,
            wifi: true,
            ssid: String::new(),
            password: String::new(),
        }
    }
}

impl NetworkConfig {
    pub fn has_wifi_credentials(&self) -> bool {
        !self.ssid.is_empty() && !self.password.is_empty()
    }

    pub fn static_ip(&self) -> StaticIp {
        StaticIp {
            ip: self.ip,
            gateway: self.gateway,
            subnet: self.subnet,
            dns: self.dns,
        }
    }

    pub fn ip_assignment(&self) -> IpAssignment {
        if self.dhcp {
            IpAssignment::Dhcp
        } else {
            IpAssignment::Static(self.static_ip())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub base: String,
    pub interval_secs: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 1883,
            user: "mqtt_user".to_string(),
            password: "mqtt_password".to_string(),
            base: "/opta/".to_string(),
            interval_secs: 0,
        }
    }
}

impl BrokerConfig {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// An empty host is stored as the disabling sentinel.
    pub fn set_host(&mut self, host: &str) {
        let host = host.trim();
        self.host = if host.is_empty() {
            BROKER_DISABLED_HOST.to_string()
        } else {
            host.to_string()
        };
    }

    pub fn is_enabled(&self) -> bool {
        self.host != BROKER_DISABLED_HOST
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub device_id: String,
    pub device_user: String,
    pub device_password: String,
    time_offset: i32,
    pub network: NetworkConfig,
    pub broker: BrokerConfig,
    inputs: [InputType; INPUT_COUNT],
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "99999".to_string(),
            device_user: "admin".to_string(),
            device_password: "admin".to_string(),
            time_offset: 0,
            network: NetworkConfig::default(),
            broker: BrokerConfig::default(),
            inputs: [InputType::Digital; INPUT_COUNT],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigDocument<'a> {
    pub version: String,
    #[serde(rename = "deviceId")]
    pub device_id: &'a str,
    #[serde(rename = "deviceUser")]
    pub device_user: &'a str,
    #[serde(rename = "devicePassword")]
    pub device_password: &'a str,
    #[serde(rename = "timeOffset")]
    pub time_offset: i32,
    #[serde(rename = "netIp")]
    pub net_ip: Ipv4Addr,
    #[serde(rename = "netGateway")]
    pub net_gateway: Ipv4Addr,
    #[serde(rename = "netSubnet")]
    pub net_subnet: Ipv4Addr,
    #[serde(rename = "netDns")]
    pub net_dns: Ipv4Addr,
    #[serde(rename = "netDhcp")]
    pub net_dhcp: bool,
    #[serde(rename = "netWifi")]
    pub net_wifi: bool,
    #[serde(rename = "netSsid")]
    pub net_ssid: &'a str,
    #[serde(rename = "netPassword")]
    pub net_password: &'a str,
    #[serde(rename = "mqttIp")]
    pub mqtt_ip: &'a str,
    #[serde(rename = "mqttPort")]
    pub mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    pub mqtt_user: &'a str,
    #[serde(rename = "mqttPassword")]
    pub mqtt_password: &'a str,
    #[serde(rename = "mqttBase")]
    pub mqtt_base: &'a str,
    #[serde(rename = "mqttInterval")]
    pub mqtt_interval: u32,
    pub inputs: BTreeMap<String, u8>,
}

impl DeviceConfig {
    pub fn time_offset(&self) -> i32 {
        self.time_offset
    }

    /// Offsets outside one day either side of UTC fall back to 0.
    pub fn set_time_offset(&mut self, hours: i32) {
        if (-TIME_OFFSET_LIMIT_HOURS..=TIME_OFFSET_LIMIT_HOURS).contains(&hours) {
            self.time_offset = hours;
        } else {
            warn!("time offset {hours} out of range, using 0");
            self.time_offset = 0;
        }
    }

    pub fn input_type(&self, index: usize) -> InputType {
        self.inputs.get(index).copied().unwrap_or(InputType::Analog)
    }

    pub fn input_types(&self) -> &[InputType; INPUT_COUNT] {
        &self.inputs
    }

    pub fn set_input_type(&mut self, index: usize, code: i64) -> Result<(), ConfigError> {
        if index >= INPUT_COUNT {
            return Err(ConfigError::InputIndex(index));
        }
        let kind = InputType::from_code(code).ok_or(ConfigError::InputType(code))?;
        self.inputs[index] = kind;
        Ok(())
    }

    pub fn validate_identity(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() {
            return Err(ConfigError::EmptyField("deviceId"));
        }
        if self.device_user.is_empty() {
            return Err(ConfigError::EmptyField("deviceUser"));
        }
        Ok(())
    }

    pub fn to_document(&self, no_secrets: bool) -> ConfigDocument<'_> {
        ConfigDocument {
            version: version_label(FIRMWARE_REVISION),
            device_id: &self.device_id,
            device_user: &self.device_user,
            device_password: masked(&self.device_password, no_secrets),
            time_offset: self.time_offset,
            net_ip: self.network.ip,
            net_gateway: self.network.gateway,
            net_subnet: self.network.subnet,
            net_dns: self.network.dns,
            net_dhcp: self.network.dhcp,
            net_wifi: self.network.wifi,
            net_ssid: &self.network.ssid,
            net_password: masked(&self.network.password, no_secrets),
            mqtt_ip: self.broker.host(),
            mqtt_port: self.broker.port,
            mqtt_user: &self.broker.user,
            mqtt_password: masked(&self.broker.password, no_secrets),
            mqtt_base: &self.broker.base,
            mqtt_interval: self.broker.interval_secs,
            inputs: self
                .inputs
                .iter()
                .enumerate()
                .map(|(index, kind)| (format!("I{}", index + 1), kind.code()))
                .collect(),
        }
    }

    pub fn to_json(&self, no_secrets: bool) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(&self.to_document(no_secrets))?)
    }

    /// Applies every recognised key present in `raw`; absent or malformed keys keep their
    /// current value. Only an unparsable document is an error.
    pub fn apply_json(&mut self, raw: &[u8]) -> Result<(), ConfigError> {
        let document: Value = serde_json::from_slice(raw)?;
        let Value::Object(document) = document else {
            return Err(ConfigError::NotAnObject);
        };
        let fields = FieldReader::new(&document);

        if let Some(value) = fields.string("deviceId") {
            self.device_id = value;
        }
        if let Some(value) = fields.string("deviceUser") {
            self.device_user = value;
        }
        if let Some(value) = fields.string("devicePassword") {
            self.device_password = value;
        }
        if let Some(value) = fields.integer("timeOffset") {
            match i32::try_from(value) {
                Ok(hours) => self.time_offset = hours,
                Err(_) => warn!("timeOffset {value} ignored"),
            }
        }

        if let Some(value) = fields.address("netIp") {
            self.network.ip = value;
        }
        if let Some(value) = fields.address("netGateway") {
            self.network.gateway = value;
        }
        if let Some(value) = fields.address("netSubnet") {
            self.network.subnet = value;
        }
        if let Some(value) = fields.address("netDns") {
            self.network.dns = value;
        }
        if let Some(value) = fields.boolean("netDhcp") {
            self.network.dhcp = value;
        }
        if let Some(value) = fields.boolean("netWifi") {
            self.network.wifi = value;
        }
        if let Some(value) = fields.string("netSsid") {
            self.network.ssid = value;
        }
        if let Some(value) = fields.string("netPassword") {
            self.network.password = value;
        }

        if let Some(value) = fields.string("mqttIp") {
            self.broker.set_host(&value);
        }
        if let Some(value) = fields.integer("mqttPort") {
            match u16::try_from(value) {
                Ok(port) => self.broker.port = port,
                Err(_) => warn!("mqttPort {value} ignored"),
            }
        }
        if let Some(value) = fields.string("mqttUser") {
            self.broker.user = value;
        }
        if let Some(value) = fields.string("mqttPassword") {
            self.broker.password = value;
        }
        if let Some(value) = fields.string("mqttBase") {
            self.broker.base = value;
        }
        if let Some(value) = fields.integer("mqttInterval") {
            self.broker.interval_secs = value.clamp(0, i64::from(u32::MAX)) as u32;
        }

        if let Some(inputs) = fields.object("inputs") {
            for index in 0..INPUT_COUNT {
                let key = format!("I{}", index + 1);
                let Some(code) = inputs.get(&key).and_then(Value::as_i64) else {
                    continue;
                };
                if let Err(err) = self.set_input_type(index, code) {
                    warn!("{key} ignored: {err}");
                }
            }
        }

        fields.report_missing();
        Ok(())
    }

    pub fn load_from_store<S: KvStore + ?Sized>(store: &mut S) -> Result<Self, ConfigError> {
        debug!("reading configuration from store");
        let raw = store.get(CONFIG_STORE_KEY)?.ok_or(ConfigError::Missing)?;
        let mut config = Self::default();
        config.apply_json(&raw)?;
        Ok(config)
    }

    pub fn save_to_store<S: KvStore + ?Sized>(&self, store: &mut S) -> Result<(), ConfigError> {
        debug!("writing configuration to store");
        let payload = self.to_json(false)?;
        store.set(CONFIG_STORE_KEY, payload.as_bytes())?;
        Ok(())
    }
}

fn masked(value: &str, hide: bool) -> &str {
    if hide {
        ""
    } else {
        value
    }
}

const CONFIG_KEYS: [&str; 19] = [
    "deviceId",
    "deviceUser",
    "devicePassword",
    "timeOffset",
    "netIp",
    "netGateway",
    "netSubnet",
    "netDns",
    "netDhcp",
    "netWifi",
    "netSsid",
    "netPassword",
    "mqttIp",
    "mqttPort",
    "mqttUser",
    "mqttPassword",
    "mqttBase",
    "mqttInterval",
    "inputs",
];

struct FieldReader<'a> {
    document: &'a Map<String, Value>,
}

impl<'a> FieldReader<'a> {
    fn new(document: &'a Map<String, Value>) -> Self {
        Self { document }
    }

    fn field(&self, key: &str) -> Option<&'a Value> {
        self.document.get(key).filter(|value| !value.is_null())
    }

    fn string(&self, key: &str) -> Option<String> {
        let value = self.field(key)?;
        match value {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => {
                warn!("{key} is not a string, ignored");
                None
            }
        }
    }

    fn integer(&self, key: &str) -> Option<i64> {
        let value = self.field(key)?;
        let parsed = match value {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().map(|float| float as i64)),
            Value::String(text) => text.trim().parse::<i64>().ok(),
            _ => None,
        };
        if parsed.is_none() {
            warn!("{key} is not an integer, ignored");
        }
        parsed
    }

    fn boolean(&self, key: &str) -> Option<bool> {
        let value = self.field(key)?;
        match value {
            Value::Bool(flag) => Some(*flag),
            Value::Number(number) => Some(number.as_i64() != Some(0)),
            Value::String(text) => match text.trim() {
                "true" | "1" | "on" => Some(true),
                "false" | "0" | "off" | "" => Some(false),
                _ => {
                    warn!("{key} is not a boolean, ignored");
                    None
                }
            },
            _ => {
                warn!("{key} is not a boolean, ignored");
                None
            }
        }
    }

    fn address(&self, key: &str) -> Option<Ipv4Addr> {
        let text = self.string(key)?;
        match text.trim().parse::<Ipv4Addr>() {
            Ok(address) => Some(address),
            Err(_) => {
                warn!("{key} `{text}` is not an IPv4 address, ignored");
                None
            }
        }
    }

    fn object(&self, key: &str) -> Option<&'a Map<String, Value>> {
        match self.field(key)? {
            Value::Object(object) => Some(object),
            _ => {
                warn!("{key} is not an object, ignored");
                None
            }
        }
    }

    fn report_missing(&self) {
        let missing: Vec<&str> = CONFIG_KEYS
            .iter()
            .copied()
            .filter(|key| self.document.get(*key).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            debug!("configuration JSON without {}", missing.join(", "));
        }
    }
}
