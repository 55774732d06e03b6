//! In-memory board used by the unit tests.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    net::Ipv4Addr,
    rc::Rc,
};

use crate::{
    broker::BrokerError,
    config::{InputType, StoreError},
    device::Device,
    flash::{FlashError, Partition},
    hal::{
        Board, BrokerClient, BrokerMessage, BrokerOptions, FlashDevice, IoPins, IpAssignment,
        KvStore, Led, NetworkDriver, Peripherals, Platform, RadioBlobs, SerialPort, StatusLeds,
        TimeSource, UserButton, Watchdog, WebConnection, WebListener,
    },
    network::NetworkError,
    status::LedLevels,
    supervisor::Guard,
    time::TimeError,
    types::{BoardType, NetworkMode, RadioStatus, INPUT_COUNT, OUTPUT_COUNT},
    web::TransportError,
};

#[derive(Debug, Default)]
pub struct NullGuard {
    pub kicks: u32,
    pub freezes: u32,
    pub releases: u32,
}

impl Guard for NullGuard {
    fn kick(&mut self) {
        self.kicks += 1;
    }

    fn freeze(&mut self) {
        self.freezes += 1;
    }

    fn release(&mut self) {
        self.releases += 1;
    }
}

#[derive(Debug, Default)]
pub struct FakePlatform {
    pub now_ms: u64,
    pub board: Option<BoardType>,
    pub serial_bus: Option<u32>,
    pub restarts: u32,
}

impl Platform for FakePlatform {
    fn now_ms(&mut self) -> u64 {
        self.now_ms
    }

    fn delay_ms(&mut self, ms: u32) {
        self.now_ms += u64::from(ms);
    }

    fn board_identity(&mut self) -> Option<BoardType> {
        self.board
    }

    fn configure_serial_bus(&mut self, baud: u32) -> Result<(), TransportError> {
        self.serial_bus = Some(baud);
        Ok(())
    }

    fn restart(&mut self) {
        self.restarts += 1;
    }
}

#[derive(Debug, Default)]
pub struct FakeWatchdog {
    pub starts: Vec<u32>,
    pub kicks: u32,
}

impl Watchdog for FakeWatchdog {
    fn start(&mut self, timeout_ms: u32) {
        self.starts.push(timeout_ms);
    }

    fn kick(&mut self) {
        self.kicks += 1;
    }

    fn max_timeout_ms(&self) -> u32 {
        32_000
    }
}

#[derive(Debug, Default)]
pub struct FakeLeds(pub LedLevels);

impl StatusLeds for FakeLeds {
    fn set(&mut self, led: Led, on: bool) {
        match led {
            Led::Green => self.0.green = on,
            Led::Red => self.0.red = on,
            Led::Blue => self.0.blue = on,
        }
    }

    fn get(&self, led: Led) -> bool {
        match led {
            Led::Green => self.0.green,
            Led::Red => self.0.red,
            Led::Blue => self.0.blue,
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeButton {
    pub pressed: bool,
}

impl UserButton for FakeButton {
    fn is_pressed(&mut self) -> bool {
        self.pressed
    }
}

#[derive(Debug, Default)]
pub struct FakePins {
    pub resolution: Option<u8>,
    pub configured: [Option<InputType>; INPUT_COUNT],
    pub digital: [bool; INPUT_COUNT],
    pub analog: [u32; INPUT_COUNT],
    pub outputs: [bool; OUTPUT_COUNT],
    pub output_leds: [bool; OUTPUT_COUNT],
}

impl IoPins for FakePins {
    fn set_analog_resolution(&mut self, bits: u8) {
        self.resolution = Some(bits);
    }

    fn configure_input(&mut self, index: usize, kind: InputType) {
        self.configured[index] = Some(kind);
    }

    fn configure_output(&mut self, _index: usize) {}

    fn read_digital(&mut self, index: usize) -> bool {
        self.digital[index]
    }

    fn read_analog(&mut self, index: usize) -> u32 {
        self.analog[index]
    }

    fn write_output(&mut self, index: usize, on: bool) {
        self.outputs[index] = on;
    }

    fn write_output_led(&mut self, index: usize, on: bool) {
        self.output_leds[index] = on;
    }
}

#[derive(Debug, Default)]
pub struct FakeStore {
    pub records: HashMap<String, Vec<u8>>,
    pub resets: u32,
    pub writes: u32,
}

impl KvStore for FakeStore {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.writes += 1;
        self.records.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.resets += 1;
        self.records.clear();
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeFlash {
    pub init_ok: bool,
    pub erase_calls: u32,
    pub partitions: BTreeMap<Partition, (u64, u64)>,
    pub formatted: BTreeSet<Partition>,
    pub reformats: Vec<Partition>,
    pub files: HashMap<(Partition, String), Vec<u8>>,
    pub appends: usize,
    pub fail_append_after: Option<usize>,
    pub corrupt_reads: bool,
    pub mapped: BTreeMap<u64, u8>,
}

impl FakeFlash {
    pub fn blank() -> Self {
        Self {
            init_ok: true,
            erase_calls: 0,
            partitions: BTreeMap::new(),
            formatted: BTreeSet::new(),
            reformats: Vec::new(),
            files: HashMap::new(),
            appends: 0,
            fail_append_after: None,
            corrupt_reads: false,
            mapped: BTreeMap::new(),
        }
    }

    pub fn provisioned() -> Self {
        let mut flash = Self::blank();
        flash.formatted = [Partition::Wifi, Partition::Ota, Partition::User]
            .into_iter()
            .collect();
        flash
    }
}

impl FlashDevice for FakeFlash {
    fn init(&mut self) -> Result<(), FlashError> {
        if self.init_ok {
            Ok(())
        } else {
            Err(FlashError::Init("no response".into()))
        }
    }

    fn size(&self) -> u64 {
        16 * 1024 * 1024
    }

    fn erase(&mut self, _offset: u64, _len: u64) -> Result<(), FlashError> {
        self.erase_calls += 1;
        self.formatted.clear();
        self.files.clear();
        self.mapped.clear();
        Ok(())
    }

    fn program(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError> {
        for (i, byte) in data.iter().enumerate() {
            self.mapped.insert(offset + i as u64, *byte);
        }
        Ok(())
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self.mapped.get(&(offset + i as u64)).copied().unwrap_or(0xFF);
        }
        if self.corrupt_reads {
            if let Some(first) = buf.first_mut() {
                *first ^= 0xFF;
            }
        }
        Ok(())
    }

    fn define_partition(&mut self, slot: Partition, start: u64, end: u64) -> Result<(), FlashError> {
        self.partitions.insert(slot, (start, end));
        Ok(())
    }

    fn mount(&mut self, slot: Partition) -> Result<(), FlashError> {
        if self.formatted.contains(&slot) {
            Ok(())
        } else {
            Err(FlashError::Unmounted(slot))
        }
    }

    fn reformat(&mut self, slot: Partition) -> Result<(), FlashError> {
        self.reformats.push(slot);
        self.formatted.insert(slot);
        self.files.retain(|(partition, _), _| *partition != slot);
        Ok(())
    }

    fn create_file(&mut self, slot: Partition, name: &str) -> Result<(), FlashError> {
        self.files.insert((slot, name.to_string()), Vec::new());
        Ok(())
    }

    fn append_file(&mut self, slot: Partition, name: &str, chunk: &[u8]) -> Result<(), FlashError> {
        if self.fail_append_after.is_some_and(|limit| self.appends >= limit) {
            return Err(FlashError::Device("program failed".into()));
        }
        self.appends += 1;
        self.files
            .entry((slot, name.to_string()))
            .or_default()
            .extend_from_slice(chunk);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeNetwork {
    pub ethernet_present: bool,
    pub link_up: bool,
    pub ethernet_ok: bool,
    pub wifi_present: bool,
    pub wifi_ok: bool,
    pub access_point_ok: bool,
    pub radio_status: RadioStatus,
    pub ethernet_attempts: u32,
    pub wifi_attempts: u32,
    pub maintains: u32,
    pub access_point: Option<(String, String, Ipv4Addr)>,
    pub ip: Ipv4Addr,
}

impl Default for FakeNetwork {
    fn default() -> Self {
        Self {
            ethernet_present: true,
            link_up: false,
            ethernet_ok: true,
            wifi_present: true,
            wifi_ok: true,
            access_point_ok: true,
            radio_status: RadioStatus::Connected,
            ethernet_attempts: 0,
            wifi_attempts: 0,
            maintains: 0,
            access_point: None,
            ip: Ipv4Addr::new(10, 0, 0, 5),
        }
    }
}

impl NetworkDriver for FakeNetwork {
    fn ethernet_present(&mut self) -> bool {
        self.ethernet_present
    }

    fn ethernet_link_up(&mut self) -> bool {
        self.link_up
    }

    fn ethernet_begin(&mut self, _ip: &IpAssignment, _timeout_ms: u32) -> Result<(), NetworkError> {
        self.ethernet_attempts += 1;
        if self.link_up && self.ethernet_ok {
            Ok(())
        } else {
            Err(NetworkError::Negotiation("no lease".into()))
        }
    }

    fn ethernet_maintain(&mut self) {
        self.maintains += 1;
    }

    fn wifi_present(&mut self) -> bool {
        self.wifi_present
    }

    fn wifi_begin(
        &mut self,
        _ssid: &str,
        _password: &str,
        _ip: &IpAssignment,
        _timeout_ms: u32,
    ) -> Result<(), NetworkError> {
        self.wifi_attempts += 1;
        if self.wifi_ok {
            self.radio_status = RadioStatus::Connected;
            Ok(())
        } else {
            self.radio_status = RadioStatus::ConnectFailed;
            Err(NetworkError::Wifi("timeout".into()))
        }
    }

    fn wifi_begin_access_point(
        &mut self,
        ssid: &str,
        password: &str,
        ip: Ipv4Addr,
    ) -> Result<(), NetworkError> {
        if !self.access_point_ok {
            return Err(NetworkError::AccessPoint("radio busy".into()));
        }
        self.radio_status = RadioStatus::Listening;
        self.access_point = Some((ssid.to_string(), password.to_string(), ip));
        Ok(())
    }

    fn wifi_status(&mut self) -> RadioStatus {
        self.radio_status
    }

    fn local_ip(&mut self, _mode: NetworkMode) -> Ipv4Addr {
        self.ip
    }
}

#[derive(Debug)]
pub struct FakeBroker {
    pub connected: bool,
    pub accept: bool,
    pub connects: u32,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, String)>,
    pub inbox: VecDeque<BrokerMessage>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self {
            connected: false,
            accept: true,
            connects: 0,
            subscriptions: Vec::new(),
            published: Vec::new(),
            inbox: VecDeque::new(),
        }
    }
}

impl BrokerClient for FakeBroker {
    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn connect(&mut self, _options: &BrokerOptions<'_>) -> Result<(), BrokerError> {
        self.connects += 1;
        self.connected = self.accept;
        if self.accept {
            Ok(())
        } else {
            Err(BrokerError::Connect("refused".into()))
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    fn poll_message(&mut self) -> Option<BrokerMessage> {
        self.inbox.pop_front()
    }
}

#[derive(Debug)]
pub struct FakeConnection {
    pub incoming: VecDeque<u8>,
    pub open: bool,
    pub written: Vec<u8>,
    pub writes: Vec<Vec<u8>>,
    transcript: Option<Rc<RefCell<Vec<String>>>>,
}

impl Default for FakeConnection {
    fn default() -> Self {
        Self {
            incoming: VecDeque::new(),
            open: true,
            written: Vec::new(),
            writes: Vec::new(),
            transcript: None,
        }
    }
}

impl FakeConnection {
    pub fn with_request(raw: &[u8]) -> Self {
        Self {
            incoming: raw.iter().copied().collect(),
            ..Self::default()
        }
    }
}

impl WebConnection for FakeConnection {
    fn is_connected(&mut self) -> bool {
        self.open
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.incoming.pop_front()
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.written.extend_from_slice(data);
        self.writes.push(data.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        if let Some(transcript) = &self.transcript {
            transcript
                .borrow_mut()
                .push(String::from_utf8_lossy(&self.written).into_owned());
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeListener {
    pub port: Option<u16>,
    pub pending: VecDeque<FakeConnection>,
    pub accepts: u32,
    pub responses: Rc<RefCell<Vec<String>>>,
}

impl FakeListener {
    pub fn queue(&mut self, raw: &str) {
        self.pending
            .push_back(FakeConnection::with_request(raw.as_bytes()));
    }
}

impl WebListener for FakeListener {
    type Connection = FakeConnection;

    fn begin(&mut self, port: u16, _mode: NetworkMode) -> Result<(), TransportError> {
        self.port = Some(port);
        Ok(())
    }

    fn accept(&mut self) -> Option<FakeConnection> {
        self.accepts += 1;
        let mut conn = self.pending.pop_front()?;
        conn.transcript = Some(self.responses.clone());
        Some(conn)
    }
}

#[derive(Debug, Default)]
pub struct FakeSerial {
    pub baud: Option<u32>,
    pub input: VecDeque<u8>,
}

impl FakeSerial {
    pub fn with_input(input: &[u8]) -> Self {
        Self {
            baud: None,
            input: input.iter().copied().collect(),
        }
    }
}

impl SerialPort for FakeSerial {
    fn begin(&mut self, baud: u32) {
        self.baud = Some(baud);
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.input.pop_front()
    }
}

#[derive(Debug, Default)]
pub struct FakeTime {
    pub epoch: Option<i64>,
    pub requests: u32,
    pub servers: Vec<String>,
}

impl FakeTime {
    pub fn answering(epoch: i64) -> Self {
        Self {
            epoch: Some(epoch),
            ..Self::default()
        }
    }
}

impl TimeSource for FakeTime {
    fn fetch_epoch(&mut self, server: &str, _timeout_ms: u32) -> Result<i64, TimeError> {
        self.requests += 1;
        self.servers.push(server.to_owned());
        self.epoch.ok_or(TimeError::Timeout)
    }
}

/// Handle kept by a test while the device owns the other end.
pub struct Shared<T>(Rc<RefCell<T>>);

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    pub fn borrow(&self) -> std::cell::Ref<'_, T> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, T> {
        self.0.borrow_mut()
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T: Platform> Platform for Shared<T> {
    fn now_ms(&mut self) -> u64 {
        self.borrow_mut().now_ms()
    }

    fn delay_ms(&mut self, ms: u32) {
        self.borrow_mut().delay_ms(ms);
    }

    fn board_identity(&mut self) -> Option<BoardType> {
        self.borrow_mut().board_identity()
    }

    fn configure_serial_bus(&mut self, baud: u32) -> Result<(), TransportError> {
        self.borrow_mut().configure_serial_bus(baud)
    }

    fn restart(&mut self) {
        self.borrow_mut().restart();
    }
}

impl<T: Watchdog> Watchdog for Shared<T> {
    fn start(&mut self, timeout_ms: u32) {
        self.borrow_mut().start(timeout_ms);
    }

    fn kick(&mut self) {
        self.borrow_mut().kick();
    }

    fn max_timeout_ms(&self) -> u32 {
        self.borrow().max_timeout_ms()
    }
}

impl<T: StatusLeds> StatusLeds for Shared<T> {
    fn set(&mut self, led: Led, on: bool) {
        self.borrow_mut().set(led, on);
    }

    fn get(&self, led: Led) -> bool {
        self.borrow().get(led)
    }
}

impl<T: UserButton> UserButton for Shared<T> {
    fn is_pressed(&mut self) -> bool {
        self.borrow_mut().is_pressed()
    }
}

impl<T: IoPins> IoPins for Shared<T> {
    fn set_analog_resolution(&mut self, bits: u8) {
        self.borrow_mut().set_analog_resolution(bits);
    }

    fn configure_input(&mut self, index: usize, kind: InputType) {
        self.borrow_mut().configure_input(index, kind);
    }

    fn configure_output(&mut self, index: usize) {
        self.borrow_mut().configure_output(index);
    }

    fn read_digital(&mut self, index: usize) -> bool {
        self.borrow_mut().read_digital(index)
    }

    fn read_analog(&mut self, index: usize) -> u32 {
        self.borrow_mut().read_analog(index)
    }

    fn write_output(&mut self, index: usize, on: bool) {
        self.borrow_mut().write_output(index, on);
    }

    fn write_output_led(&mut self, index: usize, on: bool) {
        self.borrow_mut().write_output_led(index, on);
    }
}

impl<T: KvStore> KvStore for Shared<T> {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.borrow_mut().get(key)
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.borrow_mut().set(key, value)
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        self.borrow_mut().reset()
    }
}

impl<T: FlashDevice> FlashDevice for Shared<T> {
    fn init(&mut self) -> Result<(), FlashError> {
        self.borrow_mut().init()
    }

    fn size(&self) -> u64 {
        self.borrow().size()
    }

    fn erase(&mut self, offset: u64, len: u64) -> Result<(), FlashError> {
        self.borrow_mut().erase(offset, len)
    }

    fn program(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError> {
        self.borrow_mut().program(offset, data)
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        self.borrow_mut().read(offset, buf)
    }

    fn define_partition(&mut self, slot: Partition, start: u64, end: u64) -> Result<(), FlashError> {
        self.borrow_mut().define_partition(slot, start, end)
    }

    fn mount(&mut self, slot: Partition) -> Result<(), FlashError> {
        self.borrow_mut().mount(slot)
    }

    fn reformat(&mut self, slot: Partition) -> Result<(), FlashError> {
        self.borrow_mut().reformat(slot)
    }

    fn create_file(&mut self, slot: Partition, name: &str) -> Result<(), FlashError> {
        self.borrow_mut().create_file(slot, name)
    }

    fn append_file(&mut self, slot: Partition, name: &str, chunk: &[u8]) -> Result<(), FlashError> {
        self.borrow_mut().append_file(slot, name, chunk)
    }
}

impl<T: NetworkDriver> NetworkDriver for Shared<T> {
    fn ethernet_present(&mut self) -> bool {
        self.borrow_mut().ethernet_present()
    }

    fn ethernet_link_up(&mut self) -> bool {
        self.borrow_mut().ethernet_link_up()
    }

    fn ethernet_begin(&mut self, ip: &IpAssignment, timeout_ms: u32) -> Result<(), NetworkError> {
        self.borrow_mut().ethernet_begin(ip, timeout_ms)
    }

    fn ethernet_maintain(&mut self) {
        self.borrow_mut().ethernet_maintain();
    }

    fn wifi_present(&mut self) -> bool {
        self.borrow_mut().wifi_present()
    }

    fn wifi_begin(
        &mut self,
        ssid: &str,
        password: &str,
        ip: &IpAssignment,
        timeout_ms: u32,
    ) -> Result<(), NetworkError> {
        self.borrow_mut().wifi_begin(ssid, password, ip, timeout_ms)
    }

    fn wifi_begin_access_point(
        &mut self,
        ssid: &str,
        password: &str,
        ip: Ipv4Addr,
    ) -> Result<(), NetworkError> {
        self.borrow_mut().wifi_begin_access_point(ssid, password, ip)
    }

    fn wifi_status(&mut self) -> RadioStatus {
        self.borrow_mut().wifi_status()
    }

    fn local_ip(&mut self, mode: NetworkMode) -> Ipv4Addr {
        self.borrow_mut().local_ip(mode)
    }
}

impl<T: BrokerClient> BrokerClient for Shared<T> {
    fn is_connected(&mut self) -> bool {
        self.borrow_mut().is_connected()
    }

    fn connect(&mut self, options: &BrokerOptions<'_>) -> Result<(), BrokerError> {
        self.borrow_mut().connect(options)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.borrow_mut().subscribe(topic)
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.borrow_mut().publish(topic, payload)
    }

    fn poll_message(&mut self) -> Option<BrokerMessage> {
        self.borrow_mut().poll_message()
    }
}

impl<T: WebListener> WebListener for Shared<T> {
    type Connection = T::Connection;

    fn begin(&mut self, port: u16, mode: NetworkMode) -> Result<(), TransportError> {
        self.borrow_mut().begin(port, mode)
    }

    fn accept(&mut self) -> Option<Self::Connection> {
        self.borrow_mut().accept()
    }
}

impl<T: SerialPort> SerialPort for Shared<T> {
    fn begin(&mut self, baud: u32) {
        self.borrow_mut().begin(baud);
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.borrow_mut().read_byte()
    }
}

impl<T: TimeSource> TimeSource for Shared<T> {
    fn fetch_epoch(&mut self, server: &str, timeout_ms: u32) -> Result<i64, TimeError> {
        self.borrow_mut().fetch_epoch(server, timeout_ms)
    }
}

pub struct FakeBoard;

impl Board for FakeBoard {
    type Platform = Shared<FakePlatform>;
    type Watchdog = Shared<FakeWatchdog>;
    type Leds = Shared<FakeLeds>;
    type Button = Shared<FakeButton>;
    type Io = Shared<FakePins>;
    type Store = Shared<FakeStore>;
    type Flash = Shared<FakeFlash>;
    type Network = Shared<FakeNetwork>;
    type Broker = Shared<FakeBroker>;
    type Web = Shared<FakeListener>;
    type Serial = Shared<FakeSerial>;
    type Time = Shared<FakeTime>;
}

/// Test-side handles onto every fake peripheral of one device.
#[derive(Clone)]
pub struct Rig {
    pub platform: Shared<FakePlatform>,
    pub watchdog: Shared<FakeWatchdog>,
    pub leds: Shared<FakeLeds>,
    pub button: Shared<FakeButton>,
    pub io: Shared<FakePins>,
    pub store: Shared<FakeStore>,
    pub flash: Shared<FakeFlash>,
    pub network: Shared<FakeNetwork>,
    pub broker: Shared<FakeBroker>,
    pub web: Shared<FakeListener>,
    pub serial: Shared<FakeSerial>,
    pub time: Shared<FakeTime>,
}

impl Rig {
    /// A provisioned Lite board with its cable plugged in and a reachable broker.
    pub fn new() -> Self {
        Self {
            platform: Shared::new(FakePlatform {
                board: Some(BoardType::Lite),
                ..FakePlatform::default()
            }),
            watchdog: Shared::new(FakeWatchdog::default()),
            leds: Shared::new(FakeLeds::default()),
            button: Shared::new(FakeButton::default()),
            io: Shared::new(FakePins::default()),
            store: Shared::new(FakeStore::default()),
            flash: Shared::new(FakeFlash::provisioned()),
            network: Shared::new(FakeNetwork {
                link_up: true,
                ..FakeNetwork::default()
            }),
            broker: Shared::new(FakeBroker::default()),
            web: Shared::new(FakeListener::default()),
            serial: Shared::new(FakeSerial::default()),
            time: Shared::new(FakeTime::answering(1_700_000_000)),
        }
    }

    pub fn device(&self) -> Device<FakeBoard> {
        Device::new(Peripherals {
            platform: self.platform.clone(),
            watchdog: self.watchdog.clone(),
            leds: self.leds.clone(),
            button: self.button.clone(),
            io: self.io.clone(),
            store: self.store.clone(),
            flash: self.flash.clone(),
            network: self.network.clone(),
            broker: self.broker.clone(),
            web: self.web.clone(),
            serial: self.serial.clone(),
            time: self.time.clone(),
            blobs: RadioBlobs {
                firmware: vec![0x5A; 2_048],
                certificates: b"-----BEGIN CERTIFICATE-----\n".to_vec(),
            },
        })
    }

    pub fn advance(&self, ms: u64) {
        self.platform.borrow_mut().now_ms += ms;
    }
}
