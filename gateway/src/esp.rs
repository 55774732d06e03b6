//! ESP32-S3 build. The Wi-Fi radio is on-chip so no radio blobs are staged, and there is
//! no Ethernet PHY: configurations that ask for Ethernet stop with a hardware error.

use core::ffi::c_void;
use std::{
    collections::BTreeSet,
    ffi::CString,
    fs::{self, File, OpenOptions},
    io::Write,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::FreeRtos,
    gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals as ChipPeripherals,
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, RouterConfiguration, Subnet,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SntpConf, SyncStatus},
    sys::{self, esp, EspError},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::{console::StdinConsole, tcp::TcpWebListener};
use opta2iot_common::{
    broker::BrokerError,
    config::{InputType, StoreError, CONFIG_STORE_KEY},
    flash::{FlashError, Partition},
    hal::{
        BrokerClient, BrokerMessage, BrokerOptions, FlashDevice, IoPins, IpAssignment, KvStore,
        Led, NetworkDriver, Platform, StaticIp, StatusLeds, TimeSource, UserButton, Watchdog,
    },
    network::NetworkError,
    time::TimeError,
    types::{RadioStatus, INPUT_COUNT, OUTPUT_COUNT},
    web::TransportError,
    Board, BoardType, Device, NetworkMode, Peripherals, RadioBlobs,
};

const NVS_NAMESPACE: &str = "opta2iot";
const NVS_FLASH_NAMESPACE: &str = "flashmbr";
const NVS_FLASH_KEY: &str = "table";
const NVS_RECORD_BYTES: usize = 4096;

const STATUS_LED_GPIOS: [i32; 3] = [38, 39, 40];
const BUTTON_GPIO: i32 = 0;
// ADC1 channels 0..7 sit on GPIO1..GPIO8.
const INPUT_GPIOS: [i32; INPUT_COUNT] = [1, 2, 3, 4, 5, 6, 7, 8];
const RELAY_GPIOS: [i32; OUTPUT_COUNT] = [10, 11, 12, 13];
const RELAY_LED_GPIOS: [i32; OUTPUT_COUNT] = [14, 15, 16, 17];
const ADC_NATIVE_BITS: u8 = 12;

const RS485_UART: sys::uart_port_t = 1;
const RS485_RX_BUFFER: i32 = 256;

const WATCHDOG_MAX_MS: u32 = 60_000;
const RAW_FLASH_LABEL: &str = "extflash";
const FILES_LABEL: &str = "files";
const FILES_ROOT: &str = "/flash";
const ACCESS_POINT_PREFIX_BITS: u8 = 24;
const MQTT_RX_STACK: usize = 8 * 1024;
const SNTP_POLL_MS: u32 = 10;
const PASS_DELAY_MS: u32 = 10;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let ChipPeripherals { modem, .. } = ChipPeripherals::take()?;

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition.clone()))?;
    let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let peripherals = Peripherals::<EspBoard> {
        platform: EspPlatform,
        watchdog: TaskWatchdog::default(),
        leds: PinLeds::new(),
        button: BootButton::new(BUTTON_GPIO),
        io: GatewayPins::new()?,
        store: NvsStore::open(nvs_partition.clone())?,
        flash: PartitionFlash::new(nvs_partition),
        network: WifiNetwork::new(wifi),
        broker: EspBroker::default(),
        web: TcpWebListener::default(),
        serial: StdinConsole::spawn(),
        time: SntpClock::default(),
        blobs: RadioBlobs::default(),
    };

    let mut device = Device::new(peripherals);
    if let Err(err) = device.setup() {
        error!("gateway stopped during setup: {err:#}");
    }

    loop {
        device.run_pass();
        FreeRtos::delay_ms(PASS_DELAY_MS);
    }
}

struct EspBoard;

impl Board for EspBoard {
    type Platform = EspPlatform;
    type Watchdog = TaskWatchdog;
    type Leds = PinLeds;
    type Button = BootButton;
    type Io = GatewayPins;
    type Store = NvsStore;
    type Flash = PartitionFlash;
    type Network = WifiNetwork;
    type Broker = EspBroker;
    type Web = TcpWebListener;
    type Serial = StdinConsole;
    type Time = SntpClock;
}

struct EspPlatform;

impl Platform for EspPlatform {
    fn now_ms(&mut self) -> u64 {
        let micros = unsafe { sys::esp_timer_get_time() };
        u64::try_from(micros / 1000).unwrap_or(0)
    }

    fn delay_ms(&mut self, ms: u32) {
        FreeRtos::delay_ms(ms);
    }

    fn board_identity(&mut self) -> Option<BoardType> {
        Some(BoardType::Wifi)
    }

    fn configure_serial_bus(&mut self, baud: u32) -> Result<(), TransportError> {
        let serial_error = |err: EspError| TransportError::SerialBus(err.to_string());
        if !unsafe { sys::uart_is_driver_installed(RS485_UART) } {
            esp!(unsafe {
                sys::uart_driver_install(
                    RS485_UART,
                    RS485_RX_BUFFER,
                    0,
                    0,
                    core::ptr::null_mut(),
                    0,
                )
            })
            .map_err(serial_error)?;
        }
        esp!(unsafe { sys::uart_set_baudrate(RS485_UART, baud) }).map_err(serial_error)?;
        info!("RS485 on UART{RS485_UART} at {baud} baud");
        Ok(())
    }

    fn restart(&mut self) {
        unsafe { sys::esp_restart() };
    }
}

/// Task watchdog subscribed from the loop task.
#[derive(Default)]
struct TaskWatchdog {
    subscribed: bool,
}

impl Watchdog for TaskWatchdog {
    fn start(&mut self, timeout_ms: u32) {
        let config = sys::esp_task_wdt_config_t {
            timeout_ms,
            idle_core_mask: 0,
            trigger_panic: true,
        };
        let mut rc = unsafe { sys::esp_task_wdt_init(&config) };
        if rc == sys::ESP_ERR_INVALID_STATE {
            rc = unsafe { sys::esp_task_wdt_reconfigure(&config) };
        }
        if rc != sys::ESP_OK {
            warn!("watchdog configuration failed with code {rc}");
        }

        if !self.subscribed {
            let rc = unsafe { sys::esp_task_wdt_add(core::ptr::null_mut()) };
            if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_ARG {
                self.subscribed = true;
            } else {
                warn!("esp_task_wdt_add failed with code {rc}");
            }
        }
        self.kick();
    }

    fn kick(&mut self) {
        let _ = unsafe { sys::esp_task_wdt_reset() };
    }

    fn max_timeout_ms(&self) -> u32 {
        WATCHDOG_MAX_MS
    }
}

fn output_pin(gpio: i32) -> Option<PinDriver<'static, AnyOutputPin, Output>> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(gpio)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_low();
            Some(pin)
        }
        Err(err) => {
            warn!("GPIO{gpio} unavailable as output: {err}");
            None
        }
    }
}

fn drive(pin: &mut Option<PinDriver<'static, AnyOutputPin, Output>>, on: bool) {
    if let Some(pin) = pin.as_mut() {
        let _ = if on { pin.set_high() } else { pin.set_low() };
    }
}

struct PinLeds {
    pins: [Option<PinDriver<'static, AnyOutputPin, Output>>; 3],
    lit: [bool; 3],
}

impl PinLeds {
    fn new() -> Self {
        Self {
            pins: STATUS_LED_GPIOS.map(output_pin),
            lit: [false; 3],
        }
    }
}

fn led_index(led: Led) -> usize {
    match led {
        Led::Green => 0,
        Led::Red => 1,
        Led::Blue => 2,
    }
}

impl StatusLeds for PinLeds {
    fn set(&mut self, led: Led, on: bool) {
        let index = led_index(led);
        drive(&mut self.pins[index], on);
        self.lit[index] = on;
    }

    fn get(&self, led: Led) -> bool {
        self.lit[led_index(led)]
    }
}

struct BootButton {
    pin: Option<PinDriver<'static, AnyIOPin, Input>>,
}

impl BootButton {
    fn new(gpio: i32) -> Self {
        let pin = unsafe { PinDriver::input(AnyIOPin::new(gpio)) }
            .and_then(|mut pin| pin.set_pull(Pull::Up).map(|()| pin));
        match pin {
            Ok(pin) => Self { pin: Some(pin) },
            Err(err) => {
                warn!("user button unavailable on GPIO{gpio}: {err}");
                Self { pin: None }
            }
        }
    }
}

impl UserButton for BootButton {
    fn is_pressed(&mut self) -> bool {
        self.pin.as_ref().is_some_and(|pin| pin.is_low())
    }
}

/// Inputs go through raw GPIO and ADC oneshot calls so each terminal can switch mode
/// at runtime.
struct GatewayPins {
    adc: sys::adc_oneshot_unit_handle_t,
    resolution_bits: u8,
    relays: [Option<PinDriver<'static, AnyOutputPin, Output>>; OUTPUT_COUNT],
    relay_leds: [Option<PinDriver<'static, AnyOutputPin, Output>>; OUTPUT_COUNT],
}

impl GatewayPins {
    fn new() -> Result<Self, EspError> {
        let mut adc: sys::adc_oneshot_unit_handle_t = core::ptr::null_mut();
        let unit = sys::adc_oneshot_unit_init_cfg_t {
            unit_id: sys::adc_unit_t_ADC_UNIT_1,
            ..Default::default()
        };
        esp!(unsafe { sys::adc_oneshot_new_unit(&unit, &mut adc) })?;
        Ok(Self {
            adc,
            resolution_bits: ADC_NATIVE_BITS,
            relays: [None, None, None, None],
            relay_leds: [None, None, None, None],
        })
    }

    fn scale(&self, raw: u32) -> u32 {
        if self.resolution_bits >= ADC_NATIVE_BITS {
            raw << (self.resolution_bits - ADC_NATIVE_BITS)
        } else {
            raw >> (ADC_NATIVE_BITS - self.resolution_bits)
        }
    }
}

impl IoPins for GatewayPins {
    fn set_analog_resolution(&mut self, bits: u8) {
        self.resolution_bits = bits;
    }

    fn configure_input(&mut self, index: usize, kind: InputType) {
        let Some(&gpio) = INPUT_GPIOS.get(index) else {
            return;
        };
        let rc = if kind.is_analog() {
            let channel = sys::adc_oneshot_chan_cfg_t {
                atten: sys::adc_atten_t_ADC_ATTEN_DB_12,
                bitwidth: sys::adc_bitwidth_t_ADC_BITWIDTH_12,
            };
            unsafe { sys::adc_oneshot_config_channel(self.adc, index as sys::adc_channel_t, &channel) }
        } else {
            unsafe {
                sys::gpio_reset_pin(gpio);
                sys::gpio_set_direction(gpio, sys::gpio_mode_t_GPIO_MODE_INPUT)
            }
        };
        if rc != sys::ESP_OK {
            warn!("I{} ({kind:?}) on GPIO{gpio} failed with code {rc}", index + 1);
        }
    }

    fn configure_output(&mut self, index: usize) {
        if index >= OUTPUT_COUNT {
            return;
        }
        if self.relays[index].is_none() {
            self.relays[index] = output_pin(RELAY_GPIOS[index]);
        }
        if self.relay_leds[index].is_none() {
            self.relay_leds[index] = output_pin(RELAY_LED_GPIOS[index]);
        }
    }

    fn read_digital(&mut self, index: usize) -> bool {
        INPUT_GPIOS
            .get(index)
            .is_some_and(|&gpio| unsafe { sys::gpio_get_level(gpio) } != 0)
    }

    fn read_analog(&mut self, index: usize) -> u32 {
        if index >= INPUT_COUNT {
            return 0;
        }
        let mut raw = 0_i32;
        let rc = unsafe { sys::adc_oneshot_read(self.adc, index as sys::adc_channel_t, &mut raw) };
        if rc != sys::ESP_OK {
            debug!("I{} read failed with code {rc}", index + 1);
            return 0;
        }
        self.scale(u32::try_from(raw).unwrap_or(0))
    }

    fn write_output(&mut self, index: usize, on: bool) {
        if let Some(pin) = self.relays.get_mut(index) {
            drive(pin, on);
        }
    }

    fn write_output_led(&mut self, index: usize, on: bool) {
        if let Some(pin) = self.relay_leds.get_mut(index) {
            drive(pin, on);
        }
    }
}

fn backend(err: EspError) -> StoreError {
    StoreError::Backend(err.to_string())
}

struct NvsStore {
    nvs: EspNvs<NvsDefault>,
    written: BTreeSet<String>,
}

impl NvsStore {
    fn open(partition: EspDefaultNvsPartition) -> Result<Self, EspError> {
        Ok(Self {
            nvs: EspNvs::new(partition, NVS_NAMESPACE, true)?,
            written: BTreeSet::new(),
        })
    }
}

impl KvStore for NvsStore {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut buffer = vec![0_u8; NVS_RECORD_BYTES];
        let value = self.nvs.get_blob(key, &mut buffer).map_err(backend)?;
        Ok(value.map(<[u8]>::to_vec))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.nvs.set_blob(key, value).map_err(backend)?;
        self.written.insert(key.to_owned());
        Ok(())
    }

    fn reset(&mut self) -> Result<(), StoreError> {
        let mut keys = std::mem::take(&mut self.written);
        keys.insert(CONFIG_STORE_KEY.to_owned());
        for key in &keys {
            self.nvs.remove(key).map_err(backend)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FormattedSlots {
    slots: BTreeSet<u8>,
}

/// A raw data partition stands in for the external QSPI flash; partition files live
/// on a SPIFFS mount with one name prefix per slot.
struct PartitionFlash {
    nvs_partition: EspDefaultNvsPartition,
    raw: *const sys::esp_partition_t,
    formatted: FormattedSlots,
}

impl PartitionFlash {
    fn new(nvs_partition: EspDefaultNvsPartition) -> Self {
        Self {
            nvs_partition,
            raw: core::ptr::null(),
            formatted: FormattedSlots::default(),
        }
    }

    fn raw(&self) -> Result<*const sys::esp_partition_t, FlashError> {
        if self.raw.is_null() {
            return Err(FlashError::Device("flash not initialized".into()));
        }
        Ok(self.raw)
    }

    fn table(&self) -> Result<EspNvs<NvsDefault>, FlashError> {
        EspNvs::new(self.nvs_partition.clone(), NVS_FLASH_NAMESPACE, true)
            .map_err(|err| FlashError::Device(err.to_string()))
    }

    fn save(&self) -> Result<(), FlashError> {
        let payload = serde_json::to_vec(&self.formatted)
            .map_err(|err| FlashError::Device(err.to_string()))?;
        self.table()?
            .set_blob(NVS_FLASH_KEY, &payload)
            .map_err(|err| FlashError::Device(err.to_string()))
    }

    fn prefix(slot: Partition) -> String {
        format!("p{}-", slot.slot())
    }

    fn file_path(&self, slot: Partition, name: &str) -> Result<String, FlashError> {
        if !self.formatted.slots.contains(&slot.slot()) {
            return Err(FlashError::Unmounted(slot));
        }
        Ok(format!("{FILES_ROOT}/{}{name}", Self::prefix(slot)))
    }

    fn drop_files(slot: Partition) -> std::io::Result<()> {
        let prefix = Self::prefix(slot);
        for entry in fs::read_dir(FILES_ROOT)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

fn mount_files() -> Result<(), EspError> {
    let base_path = CString::new(FILES_ROOT).unwrap_or_default();
    let label = CString::new(FILES_LABEL).unwrap_or_default();
    let conf = sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: label.as_ptr(),
        max_files: 4,
        format_if_mount_failed: true,
    };
    esp!(unsafe { sys::esp_vfs_spiffs_register(&conf) })
}

impl FlashDevice for PartitionFlash {
    fn init(&mut self) -> Result<(), FlashError> {
        let label = CString::new(RAW_FLASH_LABEL).unwrap_or_default();
        let raw = unsafe {
            sys::esp_partition_find_first(
                sys::esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
                sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
                label.as_ptr(),
            )
        };
        if raw.is_null() {
            return Err(FlashError::Init(format!("no `{RAW_FLASH_LABEL}` partition")));
        }
        self.raw = raw;

        match mount_files() {
            Ok(()) => {}
            Err(err) if err.code() == sys::ESP_ERR_INVALID_STATE => {}
            Err(err) => return Err(FlashError::Init(err.to_string())),
        }

        let mut buffer = vec![0_u8; 256];
        let stored = self
            .table()?
            .get_blob(NVS_FLASH_KEY, &mut buffer)
            .map_err(|err| FlashError::Init(err.to_string()))?
            .map(<[u8]>::to_vec);
        self.formatted = stored
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default();
        Ok(())
    }

    fn size(&self) -> u64 {
        if self.raw.is_null() {
            return 0;
        }
        unsafe { (*self.raw).size as u64 }
    }

    fn erase(&mut self, offset: u64, len: u64) -> Result<(), FlashError> {
        let raw = self.raw()?;
        esp!(unsafe { sys::esp_partition_erase_range(raw, offset as usize, len as usize) })
            .map_err(|err| FlashError::Device(err.to_string()))?;

        let end = offset.saturating_add(len);
        for slot in Partition::ALL {
            let (start, stop) = slot.bounds();
            if start < end && offset < stop && self.formatted.slots.remove(&slot.slot()) {
                Self::drop_files(slot)?;
            }
        }
        self.save()
    }

    fn program(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError> {
        let raw = self.raw()?;
        esp!(unsafe {
            sys::esp_partition_write(
                raw,
                offset as usize,
                data.as_ptr().cast::<c_void>(),
                data.len(),
            )
        })
        .map_err(|err| FlashError::Device(err.to_string()))
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError> {
        let raw = self.raw()?;
        esp!(unsafe {
            sys::esp_partition_read(
                raw,
                offset as usize,
                buf.as_mut_ptr().cast::<c_void>(),
                buf.len(),
            )
        })
        .map_err(|err| FlashError::Device(err.to_string()))
    }

    fn define_partition(&mut self, slot: Partition, start: u64, end: u64) -> Result<(), FlashError> {
        debug!("{slot} partition spans {start:#x}..{end:#x}");
        Ok(())
    }

    fn mount(&mut self, slot: Partition) -> Result<(), FlashError> {
        if self.formatted.slots.contains(&slot.slot()) {
            Ok(())
        } else {
            Err(FlashError::Unmounted(slot))
        }
    }

    fn reformat(&mut self, slot: Partition) -> Result<(), FlashError> {
        Self::drop_files(slot).map_err(|err| FlashError::Format(slot, err.to_string()))?;
        self.formatted.slots.insert(slot.slot());
        self.save()
    }

    fn create_file(&mut self, slot: Partition, name: &str) -> Result<(), FlashError> {
        File::create(self.file_path(slot, name)?)?;
        Ok(())
    }

    fn append_file(&mut self, slot: Partition, name: &str, chunk: &[u8]) -> Result<(), FlashError> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.file_path(slot, name)?)?;
        file.write_all(chunk)?;
        Ok(())
    }
}

struct WifiNetwork {
    wifi: BlockingWifi<EspWifi<'static>>,
    mode: Option<NetworkMode>,
}

fn wifi_error(err: impl std::fmt::Display) -> NetworkError {
    NetworkError::Wifi(err.to_string())
}

fn access_point_error(err: impl std::fmt::Display) -> NetworkError {
    NetworkError::AccessPoint(err.to_string())
}

fn station_netif(settings: &StaticIp) -> anyhow::Result<EspNetif> {
    let mask = Mask::try_from(settings.subnet)
        .map_err(|_| anyhow!("invalid subnet mask: {}", settings.subnet))?;
    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: settings.ip,
                subnet: Subnet {
                    gateway: settings.gateway,
                    mask,
                },
                dns: Some(settings.dns),
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };
    Ok(EspNetif::new_with_conf(&conf)?)
}

fn router_netif(ip: Ipv4Addr) -> Result<EspNetif, EspError> {
    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Router(RouterConfiguration {
            subnet: Subnet {
                gateway: ip,
                mask: Mask(ACCESS_POINT_PREFIX_BITS),
            },
            dhcp_enabled: true,
            dns: Some(ip),
            secondary_dns: None,
        })),
        ..NetifConfiguration::wifi_default_router()
    };
    EspNetif::new_with_conf(&conf)
}

fn attached_stations() -> i32 {
    let mut stations = sys::wifi_sta_list_t::default();
    let rc = unsafe { sys::esp_wifi_ap_get_sta_list(&mut stations) };
    if rc == sys::ESP_OK {
        stations.num
    } else {
        0
    }
}

impl WifiNetwork {
    fn new(wifi: BlockingWifi<EspWifi<'static>>) -> Self {
        Self { wifi, mode: None }
    }
}

impl NetworkDriver for WifiNetwork {
    fn ethernet_present(&mut self) -> bool {
        false
    }

    fn ethernet_link_up(&mut self) -> bool {
        false
    }

    fn ethernet_begin(&mut self, _ip: &IpAssignment, _timeout_ms: u32) -> Result<(), NetworkError> {
        Err(NetworkError::NoHardware("ethernet"))
    }

    fn ethernet_maintain(&mut self) {}

    fn wifi_present(&mut self) -> bool {
        true
    }

    fn wifi_begin(
        &mut self,
        ssid: &str,
        password: &str,
        ip: &IpAssignment,
        _timeout_ms: u32,
    ) -> Result<(), NetworkError> {
        if let IpAssignment::Static(settings) = ip {
            let netif = station_netif(settings).map_err(wifi_error)?;
            self.wifi
                .wifi_mut()
                .swap_netif_sta(netif)
                .map_err(wifi_error)?;
        }

        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| wifi_error("ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| wifi_error("password too long"))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(wifi_error)?;

        self.mode = Some(NetworkMode::WifiStandard);
        self.wifi.start().map_err(wifi_error)?;
        info!("wifi started, connecting to `{ssid}`");
        self.wifi.connect().map_err(wifi_error)?;
        self.wifi.wait_netif_up().map_err(wifi_error)?;
        Ok(())
    }

    fn wifi_begin_access_point(
        &mut self,
        ssid: &str,
        password: &str,
        ip: Ipv4Addr,
    ) -> Result<(), NetworkError> {
        let netif = router_netif(ip).map_err(access_point_error)?;
        self.wifi
            .wifi_mut()
            .swap_netif_ap(netif)
            .map_err(access_point_error)?;
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| access_point_error("ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| access_point_error("password too long"))?,
                auth_method: AuthMethod::WPA2Personal,
                channel: 1,
                ..Default::default()
            }))
            .map_err(access_point_error)?;
        self.mode = Some(NetworkMode::WifiAccessPoint);
        self.wifi.start().map_err(access_point_error)?;
        self.wifi.wait_netif_up().map_err(access_point_error)?;
        info!("access point `{ssid}` up at {ip}");
        Ok(())
    }

    fn wifi_status(&mut self) -> RadioStatus {
        match self.mode {
            None => RadioStatus::Idle,
            Some(NetworkMode::WifiAccessPoint) if attached_stations() > 0 => {
                RadioStatus::ClientAttached
            }
            Some(NetworkMode::WifiAccessPoint) => RadioStatus::Listening,
            Some(_) if self.wifi.is_connected().unwrap_or(false) => RadioStatus::Connected,
            Some(_) => RadioStatus::Disconnected,
        }
    }

    fn local_ip(&mut self, mode: NetworkMode) -> Ipv4Addr {
        let netif = if mode.is_access_point() {
            self.wifi.wifi().ap_netif()
        } else {
            self.wifi.wifi().sta_netif()
        };
        netif
            .get_ip_info()
            .map(|info| info.ip)
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }
}

#[derive(Default)]
struct EspBroker {
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
    inbox: Option<mpsc::Receiver<BrokerMessage>>,
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    connected: Arc<AtomicBool>,
    inbox: mpsc::Sender<BrokerMessage>,
    ack: mpsc::Sender<()>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(MQTT_RX_STACK)
        .spawn(move || {
            let mut ack = Some(ack);
            while let Ok(event) = conn.next() {
                match event.payload() {
                    EventPayload::Connected(_) => {
                        connected.store(true, Ordering::SeqCst);
                        if let Some(ack) = ack.take() {
                            let _ = ack.send(());
                        }
                    }
                    EventPayload::Disconnected => connected.store(false, Ordering::SeqCst),
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        let message = BrokerMessage {
                            topic: topic.to_owned(),
                            payload: data.to_vec(),
                        };
                        if inbox.send(message).is_err() {
                            break;
                        }
                    }
                    EventPayload::Error(err) => warn!("mqtt error: {err:?}"),
                    _ => {}
                }
            }
            connected.store(false, Ordering::SeqCst);
        })?;
    Ok(())
}

impl BrokerClient for EspBroker {
    fn is_connected(&mut self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connect(&mut self, options: &BrokerOptions<'_>) -> Result<(), BrokerError> {
        self.client = None;
        self.inbox = None;

        let url = format!("mqtt://{}:{}", options.host, options.port);
        let conf = MqttClientConfiguration {
            client_id: Some(options.client_id),
            username: (!options.user.is_empty()).then_some(options.user),
            password: (!options.password.is_empty()).then_some(options.password),
            ..Default::default()
        };
        let (client, conn) = EspMqttClient::new(url.as_str(), &conf)
            .map_err(|err| BrokerError::Connect(err.to_string()))?;

        let connected = Arc::new(AtomicBool::new(false));
        let (inbox_tx, inbox_rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        spawn_mqtt_receiver(conn, connected.clone(), inbox_tx, ack_tx)
            .map_err(|err| BrokerError::Connect(err.to_string()))?;

        match ack_rx.recv_timeout(Duration::from_millis(u64::from(options.timeout_ms))) {
            Ok(()) => {
                self.client = Some(client);
                self.connected = connected;
                self.inbox = Some(inbox_rx);
                Ok(())
            }
            Err(_) => Err(BrokerError::Connect(format!("no answer from {url}"))),
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let client = self.client.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| BrokerError::Request(err.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let client = self.client.as_mut().ok_or(BrokerError::NotConnected)?;
        client
            .enqueue(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| BrokerError::Request(err.to_string()))
    }

    fn poll_message(&mut self) -> Option<BrokerMessage> {
        self.inbox.as_ref()?.try_recv().ok()
    }
}

/// SNTP runs in the background once started; each fetch waits for the first sync.
#[derive(Default)]
struct SntpClock {
    sntp: Option<EspSntp<'static>>,
    server: String,
}

impl TimeSource for SntpClock {
    fn fetch_epoch(&mut self, server: &str, timeout_ms: u32) -> Result<i64, TimeError> {
        if self.sntp.is_none() || self.server != server {
            // Only one SNTP client may run at a time.
            self.sntp = None;
            let mut conf = SntpConf::default();
            conf.servers[0] = server;
            let sntp = EspSntp::new(&conf).map_err(|err| TimeError::Unreachable(err.to_string()))?;
            info!("SNTP started against {server}");
            self.sntp = Some(sntp);
            self.server = server.to_owned();
        }
        let Some(sntp) = self.sntp.as_ref() else {
            return Err(TimeError::Unreachable(server.to_owned()));
        };

        let mut waited = 0;
        while sntp.get_sync_status() != SyncStatus::Completed {
            if waited >= timeout_ms {
                return Err(TimeError::Timeout);
            }
            FreeRtos::delay_ms(SNTP_POLL_MS);
            waited += SNTP_POLL_MS;
        }
        Ok(Utc::now().timestamp())
    }
}
