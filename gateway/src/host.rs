//! Workstation build: the gateway pipelines run against a simulated Opta.
//!
//! State lives under `OPTA2IOT_DATA_DIR` (default `./.opta2iot`):
//! - `kv/` holds the configuration record
//! - `flash/` holds the external flash image, partition table and staged files
//! - `io.json` supplies input levels, e.g. `{"digital":[true,false,...],"analog":[0,...]}`
//! - the user button reads as pressed while a file named `button` exists
//! - the Ethernet cable reads as unplugged while a file named `unplugged` exists
//!
//! The serial console is stdin. Restarts exit the process.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    net::{Ipv4Addr, UdpSocket},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::Utc;
use rumqttc::{Client, Connection, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{console::StdinConsole, tcp::TcpWebListener};
use opta2iot_common::{
    broker::BrokerError,
    config::{InputType, StoreError},
    flash::{FlashError, Partition},
    hal::{
        BrokerClient, BrokerMessage, BrokerOptions, FlashDevice, IoPins, IpAssignment, KvStore,
        Led, NetworkDriver, Platform, StatusLeds, TimeSource, UserButton, Watchdog,
    },
    network::NetworkError,
    time::TimeError,
    types::{RadioStatus, INPUT_COUNT, OUTPUT_COUNT},
    web::TransportError,
    Board, BoardType, Device, NetworkMode, Peripherals, RadioBlobs,
};

const DEFAULT_HTTP_PORT: u16 = 8080;
const WATCHDOG_MAX_MS: u32 = 32_768;
const WATCHDOG_CHECK_MS: u64 = 100;
const SIMULATED_FLASH_BYTES: u64 = 16 * 1024 * 1024;
const INPUT_REFRESH_MS: u64 = 50;
const MQTT_KEEP_ALIVE_SECS: u64 = 15;
const PASS_SLEEP_MS: u64 = 1;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("OPTA2IOT_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.opta2iot"));
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let board = match std::env::var("OPTA2IOT_BOARD") {
        Ok(name) => parse_board(&name),
        Err(_) => Some(BoardType::Lite),
    };
    let port = std::env::var("OPTA2IOT_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT);
    let blobs = RadioBlobs {
        firmware: read_optional_blob("OPTA2IOT_WIFI_FIRMWARE")?,
        certificates: read_optional_blob("OPTA2IOT_CA_CERTS")?,
    };

    let peripherals = Peripherals::<HostBoard> {
        platform: HostPlatform { board },
        watchdog: HostWatchdog::default(),
        leds: HostLeds::default(),
        button: HostButton {
            marker: data_dir.join("button"),
        },
        io: HostPins::new(data_dir.join("io.json")),
        store: FileStore {
            dir: data_dir.join("kv"),
        },
        flash: FileFlash::new(data_dir.join("flash")),
        network: HostNetwork::new(
            board.is_some_and(BoardType::has_wifi),
            data_dir.join("unplugged"),
        ),
        broker: MqttBroker::default(),
        web: TcpWebListener::default(),
        serial: StdinConsole::spawn(),
        time: SystemClock,
        blobs,
    };

    info!("simulated gateway state in {}", data_dir.display());
    let mut device = Device::new(peripherals).with_web_port(port);
    if let Err(err) = device.setup() {
        error!("gateway stopped during setup: {err:#}");
    }

    loop {
        device.run_pass();
        thread::sleep(Duration::from_millis(PASS_SLEEP_MS));
    }
}

struct HostBoard;

impl Board for HostBoard {
    type Platform = HostPlatform;
    type Watchdog = HostWatchdog;
    type Leds = HostLeds;
    type Button = HostButton;
    type Io = HostPins;
    type Store = FileStore;
    type Flash = FileFlash;
    type Network = HostNetwork;
    type Broker = MqttBroker;
    type Web = TcpWebListener;
    type Serial = StdinConsole;
    type Time = SystemClock;
}

fn parse_board(name: &str) -> Option<BoardType> {
    match name.trim().to_ascii_lowercase().as_str() {
        "lite" | "afx00003" => Some(BoardType::Lite),
        "rs485" | "afx00001" => Some(BoardType::Rs485),
        "wifi" | "afx00002" => Some(BoardType::Wifi),
        other => {
            warn!("unknown board `{other}`");
            None
        }
    }
}

fn read_optional_blob(var: &str) -> anyhow::Result<Vec<u8>> {
    match std::env::var(var) {
        Ok(path) => fs::read(&path).with_context(|| format!("failed to read {var} from {path}")),
        Err(_) => Ok(Vec::new()),
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

struct HostPlatform {
    board: Option<BoardType>,
}

impl Platform for HostPlatform {
    fn now_ms(&mut self) -> u64 {
        monotonic_ms()
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn board_identity(&mut self) -> Option<BoardType> {
        self.board
    }

    fn configure_serial_bus(&mut self, baud: u32) -> Result<(), TransportError> {
        info!("RS485 bus simulated at {baud} baud");
        Ok(())
    }

    fn restart(&mut self) {
        warn!("restart requested, exiting");
        std::process::exit(0);
    }
}

/// Exits the process when the loop stops kicking, like the hardware reset would.
#[derive(Default)]
struct HostWatchdog {
    deadline_ms: Arc<AtomicU64>,
    timeout_ms: Arc<AtomicU32>,
    running: bool,
}

impl Watchdog for HostWatchdog {
    fn start(&mut self, timeout_ms: u32) {
        self.timeout_ms.store(timeout_ms, Ordering::SeqCst);
        self.kick();
        if self.running {
            return;
        }
        let deadline = self.deadline_ms.clone();
        let spawned = thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || loop {
                thread::sleep(Duration::from_millis(WATCHDOG_CHECK_MS));
                if monotonic_ms() > deadline.load(Ordering::SeqCst) {
                    error!("watchdog expired, resetting");
                    std::process::exit(1);
                }
            });
        match spawned {
            Ok(_) => self.running = true,
            Err(err) => warn!("watchdog thread unavailable: {err}"),
        }
    }

    fn kick(&mut self) {
        let timeout = u64::from(self.timeout_ms.load(Ordering::SeqCst));
        self.deadline_ms
            .store(monotonic_ms().saturating_add(timeout), Ordering::SeqCst);
    }

    fn max_timeout_ms(&self) -> u32 {
        WATCHDOG_MAX_MS
    }
}

#[derive(Default)]
struct HostLeds {
    lit: BTreeSet<&'static str>,
}

fn led_name(led: Led) -> &'static str {
    match led {
        Led::Green => "green",
        Led::Red => "red",
        Led::Blue => "blue",
    }
}

impl StatusLeds for HostLeds {
    fn set(&mut self, led: Led, on: bool) {
        let name = led_name(led);
        let changed = if on {
            self.lit.insert(name)
        } else {
            self.lit.remove(name)
        };
        if changed {
            tracing::trace!(led = name, on, "status led");
        }
    }

    fn get(&self, led: Led) -> bool {
        self.lit.contains(led_name(led))
    }
}

struct HostButton {
    marker: PathBuf,
}

impl UserButton for HostButton {
    fn is_pressed(&mut self) -> bool {
        self.marker.exists()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SimulatedInputs {
    digital: [bool; INPUT_COUNT],
    analog: [u32; INPUT_COUNT],
}

struct HostPins {
    path: PathBuf,
    inputs: SimulatedInputs,
    loaded_ms: Option<u64>,
    outputs: [bool; OUTPUT_COUNT],
}

impl HostPins {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            inputs: SimulatedInputs::default(),
            loaded_ms: None,
            outputs: [false; OUTPUT_COUNT],
        }
    }

    fn refresh(&mut self) {
        let now = monotonic_ms();
        if self
            .loaded_ms
            .is_some_and(|at| now.saturating_sub(at) < INPUT_REFRESH_MS)
        {
            return;
        }
        self.loaded_ms = Some(now);
        match fs::read(&self.path) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(inputs) => self.inputs = inputs,
                Err(err) => debug!("ignoring {}: {err}", self.path.display()),
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => debug!("cannot read {}: {err}", self.path.display()),
        }
    }
}

impl IoPins for HostPins {
    fn set_analog_resolution(&mut self, bits: u8) {
        debug!("analog resolution {bits} bits");
    }

    fn configure_input(&mut self, index: usize, kind: InputType) {
        debug!("I{} configured as {kind:?}", index + 1);
    }

    fn configure_output(&mut self, index: usize) {
        debug!("O{} configured", index + 1);
    }

    fn read_digital(&mut self, index: usize) -> bool {
        self.refresh();
        self.inputs.digital.get(index).copied().unwrap_or(false)
    }

    fn read_analog(&mut self, index: usize) -> u32 {
        self.refresh();
        self.inputs.analog.get(index).copied().unwrap_or(0)
    }

    fn write_output(&mut self, index: usize, on: bool) {
        if let Some(slot) = self.outputs.get_mut(index) {
            *slot = on;
            info!("relay O{} {}", index + 1, if on { "closed" } else { "open" });
        }
    }

    fn write_output_led(&mut self, _index: usize, _on: bool) {}
}

/// One file per key.
struct FileStore {
    dir: PathBuf,
}

impl KvStore for FileStore {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.dir.join(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(key), value)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PartitionTable {
    bounds: BTreeMap<u8, (u64, u64)>,
    formatted: BTreeSet<u8>,
}

/// External flash as an image file plus one directory per formatted partition.
struct FileFlash {
    root: PathBuf,
    image: Option<File>,
    table: PartitionTable,
}

impl FileFlash {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            image: None,
            table: PartitionTable::default(),
        }
    }

    fn table_path(&self) -> PathBuf {
        self.root.join("partitions.json")
    }

    fn partition_dir(&self, slot: Partition) -> PathBuf {
        self.root.join(format!("p{}", slot.slot()))
    }

    fn image(&mut self) -> Result<&mut File, FlashError> {
        self.image
            .as_mut()
            .ok_or_else(|| FlashError::Device("flash not initialized".into()))
    }

    fn save_table(&self) -> Result<(), FlashError> {
        let payload = serde_json::to_vec_pretty(&self.table)
            .map_err(|err| FlashError::Device(err.to_string()))?;
        fs::write(self.table_path(), payload)?;
        Ok(())
    }

    fn mounted_file(&self, slot: Partition, name: &str) -> Result<PathBuf, FlashError> {
        if !self.table.formatted.contains(&slot.slot()) {
            return Err(FlashError::Unmounted(slot));
        }
        Ok(self.partition_dir(slot).join(name))
    }
}

impl FlashDevice for FileFlash {
    fn init(&mut self) -> Result<(), FlashError> {
        fs::create_dir_all(&self.root).map_err(|err| FlashError::Init(err.to_string()))?;
        let image = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.root.join("flash.bin"))
            .map_err(|err| FlashError::Init(err.to_string()))?;
        if image.metadata()?.len() < SIMULATED_FLASH_BYTES {
            image.set_len(SIMULATED_FLASH_BYTES)?;
        }
        self.image = Some(image);

        self.table = match fs::read(self.table_path()) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!("partition table unreadable, treating flash as blank: {err}");
                PartitionTable::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => PartitionTable::default(),
            Err(err) => return Err(FlashError::Init(err.to_string())),
        };
        Ok(())
    }

    fn size(&self) -> u64 {
        SIMULATED_FLASH_BYTES
    }

    fn erase(&mut self, offset: u64, len: u64) -> Result<(), FlashError> {
        let blank = vec![0xFF_u8; 64 * 1024];
        let image = self.image()?;
        image.seek(SeekFrom::Start(offset))?;
        let mut left = len;
        while left > 0 {
            let step = left.min(blank.len() as u64) as usize;
            image.write_all(&blank[..step])?;
            left -= step as u64;
        }

        let end = offset.saturating_add(len);
        let touched: Vec<Partition> = Partition::ALL
            .into_iter()
            .filter(|slot| {
                let (start, stop) = slot.bounds();
                start < end && offset < stop
            })
            .collect();
        for slot in touched {
            self.table.formatted.remove(&slot.slot());
            let dir = self.partition_dir(slot);
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
        }
        self.save_table()
    }

    fn program(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError> {
        let image = self.image()?;
        image.seek(SeekFrom::Start(offset))?;
        image.write_all(data)?;
        Ok(())
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        let image = self.image()?;
        image.seek(SeekFrom::Start(offset))?;
        image.read_exact(buf)?;
        Ok(())
    }

    fn define_partition(&mut self, slot: Partition, start: u64, end: u64) -> Result<(), FlashError> {
        self.table.bounds.insert(slot.slot(), (start, end));
        self.save_table()
    }

    fn mount(&mut self, slot: Partition) -> Result<(), FlashError> {
        if self.table.formatted.contains(&slot.slot()) && self.partition_dir(slot).is_dir() {
            Ok(())
        } else {
            Err(FlashError::Unmounted(slot))
        }
    }

    fn reformat(&mut self, slot: Partition) -> Result<(), FlashError> {
        let dir = self.partition_dir(slot);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|err| FlashError::Format(slot, err.to_string()))?;
        }
        fs::create_dir_all(&dir).map_err(|err| FlashError::Format(slot, err.to_string()))?;
        self.table.formatted.insert(slot.slot());
        self.save_table()
    }

    fn create_file(&mut self, slot: Partition, name: &str) -> Result<(), FlashError> {
        let path = self.mounted_file(slot, name)?;
        File::create(path)?;
        Ok(())
    }

    fn append_file(&mut self, slot: Partition, name: &str, chunk: &[u8]) -> Result<(), FlashError> {
        let path = self.mounted_file(slot, name)?;
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(chunk)?;
        Ok(())
    }
}

struct HostNetwork {
    wifi_present: bool,
    unplugged_marker: PathBuf,
    radio: RadioStatus,
}

impl HostNetwork {
    fn new(wifi_present: bool, unplugged_marker: PathBuf) -> Self {
        Self {
            wifi_present,
            unplugged_marker,
            radio: if wifi_present {
                RadioStatus::Idle
            } else {
                RadioStatus::NoModule
            },
        }
    }
}

/// Address of the interface that routes outward. UDP connect sends nothing.
fn outbound_ip() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        std::net::IpAddr::V6(_) => None,
    }
}

impl NetworkDriver for HostNetwork {
    fn ethernet_present(&mut self) -> bool {
        true
    }

    fn ethernet_link_up(&mut self) -> bool {
        !self.unplugged_marker.exists()
    }

    fn ethernet_begin(&mut self, ip: &IpAssignment, _timeout_ms: u32) -> Result<(), NetworkError> {
        if !self.ethernet_link_up() {
            return Err(NetworkError::CableUnplugged);
        }
        match ip {
            IpAssignment::Dhcp => debug!("using host address in place of a DHCP lease"),
            IpAssignment::Static(settings) => {
                debug!("static address {} requested, using host address", settings.ip)
            }
        }
        Ok(())
    }

    fn ethernet_maintain(&mut self) {
        debug!("DHCP lease renewed");
    }

    fn wifi_present(&mut self) -> bool {
        self.wifi_present
    }

    fn wifi_begin(
        &mut self,
        ssid: &str,
        _password: &str,
        _ip: &IpAssignment,
        _timeout_ms: u32,
    ) -> Result<(), NetworkError> {
        if !self.wifi_present {
            return Err(NetworkError::Wifi("no radio".into()));
        }
        info!("joined simulated network `{ssid}`");
        self.radio = RadioStatus::Connected;
        Ok(())
    }

    fn wifi_begin_access_point(
        &mut self,
        ssid: &str,
        _password: &str,
        ip: Ipv4Addr,
    ) -> Result<(), NetworkError> {
        if !self.wifi_present {
            return Err(NetworkError::AccessPoint("no radio".into()));
        }
        info!("simulated access point `{ssid}` at {ip}");
        self.radio = RadioStatus::Listening;
        Ok(())
    }

    fn wifi_status(&mut self) -> RadioStatus {
        self.radio
    }

    fn local_ip(&mut self, _mode: NetworkMode) -> Ipv4Addr {
        outbound_ip().unwrap_or(Ipv4Addr::LOCALHOST)
    }
}

/// rumqttc's blocking client with its event loop on a helper thread.
#[derive(Default)]
struct MqttBroker {
    client: Option<Client>,
    connected: Arc<AtomicBool>,
    inbox: Option<mpsc::Receiver<BrokerMessage>>,
}

fn spawn_mqtt_loop(
    mut connection: Connection,
    connected: Arc<AtomicBool>,
    inbox: mpsc::Sender<BrokerMessage>,
    ack: mpsc::Sender<Result<(), String>>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .spawn(move || {
            let mut ack = Some(ack);
            for event in connection.iter() {
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        if let Some(ack) = ack.take() {
                            let _ = ack.send(Ok(()));
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        let message = BrokerMessage {
                            topic: message.topic,
                            payload: message.payload.to_vec(),
                        };
                        if inbox.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if let Some(ack) = ack.take() {
                            let _ = ack.send(Err(err.to_string()));
                        } else {
                            warn!("mqtt connection closed: {err}");
                        }
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        })?;
    Ok(())
}

impl BrokerClient for MqttBroker {
    fn is_connected(&mut self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connect(&mut self, options: &BrokerOptions<'_>) -> Result<(), BrokerError> {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect();
        }

        let mut mqtt_options = MqttOptions::new(options.client_id, options.host, options.port);
        mqtt_options.set_keep_alive(Duration::from_secs(MQTT_KEEP_ALIVE_SECS));
        if !options.user.is_empty() {
            mqtt_options.set_credentials(options.user, options.password);
        }
        let (client, connection) = Client::new(mqtt_options, 32);

        let connected = Arc::new(AtomicBool::new(false));
        let (inbox_tx, inbox_rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        spawn_mqtt_loop(connection, connected.clone(), inbox_tx, ack_tx)
            .map_err(|err| BrokerError::Connect(err.to_string()))?;

        match ack_rx.recv_timeout(Duration::from_millis(u64::from(options.timeout_ms))) {
            Ok(Ok(())) => {
                self.client = Some(client);
                self.connected = connected;
                self.inbox = Some(inbox_rx);
                Ok(())
            }
            Ok(Err(reason)) => Err(BrokerError::Connect(reason)),
            Err(_) => {
                let _ = client.disconnect();
                Err(BrokerError::Connect("timed out".into()))
            }
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let client = self.client.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| BrokerError::Request(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let client = self.client.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|err| BrokerError::Request(err.to_string()))
    }

    fn poll_message(&mut self) -> Option<BrokerMessage> {
        self.inbox.as_ref()?.try_recv().ok()
    }
}

/// The host clock is already NTP-disciplined.
struct SystemClock;

impl TimeSource for SystemClock {
    fn fetch_epoch(&mut self, server: &str, _timeout_ms: u32) -> Result<i64, TimeError> {
        debug!("reading system clock in place of {server}");
        Ok(Utc::now().timestamp())
    }
}
