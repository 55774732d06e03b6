//! Hardware ports.
//!
//! Every peripheral the gateway touches is reached through one of these traits so the state
//! machines run unchanged on the controller, on a workstation simulation and in unit tests.
//! Implementations must never block longer than the timeout they are handed; anything slower
//! trips the hardware watchdog.

use std::net::Ipv4Addr;

use crate::{
    broker::BrokerError,
    config::{InputType, StoreError},
    flash::{FlashError, Partition},
    network::NetworkError,
    time::TimeError,
    types::{BoardType, NetworkMode, RadioStatus},
    web::TransportError,
};

pub trait Platform {
    /// Monotonic milliseconds since boot.
    fn now_ms(&mut self) -> u64;
    fn delay_ms(&mut self, ms: u32);
    fn board_identity(&mut self) -> Option<BoardType>;
    fn configure_serial_bus(&mut self, baud: u32) -> Result<(), TransportError>;
    /// Hardware reset. Does not return on real hardware.
    fn restart(&mut self);
}

pub trait Watchdog {
    /// (Re)starts the countdown with a new window.
    fn start(&mut self, timeout_ms: u32);
    fn kick(&mut self);
    fn max_timeout_ms(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    Green,
    Red,
    Blue,
}

pub trait StatusLeds {
    fn set(&mut self, led: Led, on: bool);
    fn get(&self, led: Led) -> bool;
}

pub trait UserButton {
    fn is_pressed(&mut self) -> bool;
}

pub trait IoPins {
    fn set_analog_resolution(&mut self, bits: u8);
    fn configure_input(&mut self, index: usize, kind: InputType);
    fn configure_output(&mut self, index: usize);
    fn read_digital(&mut self, index: usize) -> bool;
    fn read_analog(&mut self, index: usize) -> u32;
    fn write_output(&mut self, index: usize, on: bool);
    fn write_output_led(&mut self, index: usize, on: bool);
}

pub trait KvStore {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    /// Drops every record.
    fn reset(&mut self) -> Result<(), StoreError>;
}

pub trait FlashDevice {
    fn init(&mut self) -> Result<(), FlashError>;
    fn size(&self) -> u64;
    fn erase(&mut self, offset: u64, len: u64) -> Result<(), FlashError>;
    fn program(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError>;
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError>;
    /// Writes one MBR entry; `start..end` in bytes.
    fn define_partition(&mut self, slot: Partition, start: u64, end: u64)
        -> Result<(), FlashError>;
    fn mount(&mut self, slot: Partition) -> Result<(), FlashError>;
    fn reformat(&mut self, slot: Partition) -> Result<(), FlashError>;
    fn create_file(&mut self, slot: Partition, name: &str) -> Result<(), FlashError>;
    fn append_file(&mut self, slot: Partition, name: &str, chunk: &[u8])
        -> Result<(), FlashError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIp {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub dns: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAssignment {
    Dhcp,
    Static(StaticIp),
}

pub trait NetworkDriver {
    fn ethernet_present(&mut self) -> bool;
    fn ethernet_link_up(&mut self) -> bool;
    fn ethernet_begin(&mut self, ip: &IpAssignment, timeout_ms: u32) -> Result<(), NetworkError>;
    /// Renews the DHCP lease when one is held.
    fn ethernet_maintain(&mut self);
    fn wifi_present(&mut self) -> bool;
    fn wifi_begin(
        &mut self,
        ssid: &str,
        password: &str,
        ip: &IpAssignment,
        timeout_ms: u32,
    ) -> Result<(), NetworkError>;
    fn wifi_begin_access_point(
        &mut self,
        ssid: &str,
        password: &str,
        ip: Ipv4Addr,
    ) -> Result<(), NetworkError>;
    fn wifi_status(&mut self) -> RadioStatus;
    fn local_ip(&mut self, mode: NetworkMode) -> Ipv4Addr;
}

#[derive(Debug, Clone)]
pub struct BrokerOptions<'a> {
    pub client_id: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub user: &'a str,
    pub password: &'a str,
    pub timeout_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub trait BrokerClient {
    fn is_connected(&mut self) -> bool;
    fn connect(&mut self, options: &BrokerOptions<'_>) -> Result<(), BrokerError>;
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;
    /// Next pending message, if any. Never blocks.
    fn poll_message(&mut self) -> Option<BrokerMessage>;
}

pub trait WebConnection {
    fn is_connected(&mut self) -> bool;
    /// Next buffered byte, if any. Never blocks.
    fn read_byte(&mut self) -> Option<u8>;
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;
    fn close(&mut self);
}

pub trait WebListener {
    type Connection: WebConnection;

    fn begin(&mut self, port: u16, mode: NetworkMode) -> Result<(), TransportError>;
    fn accept(&mut self) -> Option<Self::Connection>;
}

pub trait SerialPort {
    fn begin(&mut self, baud: u32);
    fn read_byte(&mut self) -> Option<u8>;
}

pub trait TimeSource {
    /// UTC seconds since the epoch from `server`.
    fn fetch_epoch(&mut self, server: &str, timeout_ms: u32) -> Result<i64, TimeError>;
}

/// Ties one concrete implementation of every port together.
pub trait Board {
    type Platform: Platform;
    type Watchdog: Watchdog;
    type Leds: StatusLeds;
    type Button: UserButton;
    type Io: IoPins;
    type Store: KvStore;
    type Flash: FlashDevice;
    type Network: NetworkDriver;
    type Broker: BrokerClient;
    type Web: WebListener;
    type Serial: SerialPort;
    type Time: TimeSource;
}

/// Images staged into the radio partition during provisioning.
#[derive(Debug, Clone, Default)]
pub struct RadioBlobs {
    pub firmware: Vec<u8>,
    pub certificates: Vec<u8>,
}

pub struct Peripherals<B: Board> {
    pub platform: B::Platform,
    pub watchdog: B::Watchdog,
    pub leds: B::Leds,
    pub button: B::Button,
    pub io: B::Io,
    pub store: B::Store,
    pub flash: B::Flash,
    pub network: B::Network,
    pub broker: B::Broker,
    pub web: B::Web,
    pub serial: B::Serial,
    pub time: B::Time,
    pub blobs: RadioBlobs,
}
