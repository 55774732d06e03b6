//! The gateway orchestrator.
//!
//! One [`Device`] owns every peripheral and every session. [`Device::setup`] runs the setup
//! pipeline once; [`Device::run_pass`] runs the loop pipeline once and is called forever by the
//! binary. Each pass reads the clock once and every step sees that same `now`.

use std::fmt::Display;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    broker::{BrokerCommand, BrokerError, BrokerSession, Uplink},
    button::{classify, ButtonAction, ButtonContext, ButtonDecoder, RESET_PRESS_MS},
    config::{ConfigError, DeviceConfig},
    flash::{provision, FlashError},
    hal::{
        Board, FlashDevice, KvStore, Led, NetworkDriver, Peripherals, Platform, RadioBlobs,
        SerialPort, UserButton, WebConnection, WebListener,
    },
    io::{IoSampler, ANALOG_RESOLUTION_BITS},
    network::{select_mode, NetworkError, NetworkSession},
    serial::{SerialCommand, SerialConsole, SERIAL_BAUD},
    status::{Connectivity, LedLevels, StatusSignal},
    supervisor::{Guard, Supervisor},
    time::{LoopBenchmark, TimeError, TimeKeeper},
    topics::Topics,
    types::{
        version_label, BoardType, DataPayload, InputStatus, NetworkMode, StatusEnvelope,
        FIRMWARE_REVISION,
    },
    watchdog::{WatchdogGuard, WATCHDOG_NORMAL_TIMEOUT_MS},
    web::{
        apply_form, expected_credentials, read_request, send, Response, Route, TransportError,
        WEB_PORT,
    },
};

pub const RS485_BAUD: u32 = 19_200;
const REBOOT_BLINKS: usize = 10;
const REBOOT_BLINK_MS: u32 = 100;
const RESET_WINDOW_ROUNDS: u32 = 3;
const RESET_WINDOW_TICKS: u32 = 20;
const RESET_WINDOW_TICK_MS: u32 = 50;
const RESET_HOLD_POLL_MS: u32 = 10;
const FORM_REBOOT_DELAY_MS: u32 = 1_000;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    Stopped(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Time(#[from] TimeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    Watchdog,
    Serial,
    Board,
    Flash,
    Led,
    Button,
    Config,
    Io,
    SerialBus,
    Network,
    Time,
    Broker,
    Web,
}

impl SetupStep {
    pub const ORDER: [SetupStep; 13] = [
        Self::Watchdog,
        Self::Serial,
        Self::Board,
        Self::Flash,
        Self::Led,
        Self::Button,
        Self::Config,
        Self::Io,
        Self::SerialBus,
        Self::Network,
        Self::Time,
        Self::Broker,
        Self::Web,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Watchdog => "watchdog",
            Self::Serial => "serial",
            Self::Board => "board",
            Self::Flash => "flash",
            Self::Led => "led",
            Self::Button => "button",
            Self::Config => "config",
            Self::Io => "io",
            Self::SerialBus => "serial bus",
            Self::Network => "network",
            Self::Time => "time",
            Self::Broker => "broker",
            Self::Web => "web",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStep {
    Serial,
    Led,
    Button,
    Io,
    Network,
    Time,
    Broker,
    Web,
}

impl LoopStep {
    pub const ORDER: [LoopStep; 8] = [
        Self::Serial,
        Self::Led,
        Self::Button,
        Self::Io,
        Self::Network,
        Self::Time,
        Self::Broker,
        Self::Web,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Led => "led",
            Self::Button => "button",
            Self::Io => "io",
            Self::Network => "network",
            Self::Time => "time",
            Self::Broker => "broker",
            Self::Web => "web",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Booting,
    Running,
    /// Setup failed; waits for a power cycle.
    Stopped,
    /// A restart was issued. Only observable where the platform restart returns.
    Restarting,
}

pub struct Device<B: Board> {
    platform: B::Platform,
    supervisor: Supervisor<B::Watchdog, B::Leds>,
    button: B::Button,
    io: B::Io,
    store: B::Store,
    flash: B::Flash,
    network: B::Network,
    broker: B::Broker,
    web: B::Web,
    serial: B::Serial,
    time: B::Time,
    blobs: RadioBlobs,

    state: RunState,
    stop_reason: Option<String>,
    now_ms: u64,
    odd_pass: bool,
    web_port: u16,
    board: Option<BoardType>,
    radio_ready: bool,
    config: DeviceConfig,
    topics: Topics,
    net: NetworkSession,
    session: BrokerSession,
    sampler: IoSampler,
    decoder: ButtonDecoder,
    console: SerialConsole,
    clock: TimeKeeper,
    benchmark: LoopBenchmark,
}

impl<B: Board> Device<B> {
    pub fn new(peripherals: Peripherals<B>) -> Self {
        let config = DeviceConfig::default();
        let topics = Topics::new(&config.broker.base, &config.device_id);
        Self {
            platform: peripherals.platform,
            supervisor: Supervisor::new(
                WatchdogGuard::new(peripherals.watchdog, WATCHDOG_NORMAL_TIMEOUT_MS),
                StatusSignal::new(peripherals.leds),
            ),
            button: peripherals.button,
            io: peripherals.io,
            store: peripherals.store,
            flash: peripherals.flash,
            network: peripherals.network,
            broker: peripherals.broker,
            web: peripherals.web,
            serial: peripherals.serial,
            time: peripherals.time,
            blobs: peripherals.blobs,
            state: RunState::Booting,
            stop_reason: None,
            now_ms: 0,
            odd_pass: false,
            web_port: WEB_PORT,
            board: None,
            radio_ready: false,
            config,
            topics,
            net: NetworkSession::new(NetworkMode::Ethernet),
            session: BrokerSession::new(),
            sampler: IoSampler::new(ANALOG_RESOLUTION_BITS),
            decoder: ButtonDecoder::new(),
            console: SerialConsole::new(),
            clock: TimeKeeper::new(),
            benchmark: LoopBenchmark::default(),
        }
    }

    pub fn with_web_port(mut self, port: u16) -> Self {
        self.web_port = port;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn board(&self) -> Option<BoardType> {
        self.board
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.net.mode()
    }

    pub fn leds(&self) -> LedLevels {
        self.supervisor.status.levels()
    }

    /// Runs the setup pipeline. The first failing step stops the device.
    pub fn setup(&mut self) -> Result<(), StepError> {
        let started_ms = self.platform.now_ms();
        for step in SetupStep::ORDER {
            self.now_ms = self.platform.now_ms();
            if let Err(err) = self.run_setup_step(step) {
                self.stop(&format!("{} setup failed: {err}", step.name()));
                return Err(err);
            }
            if self.state == RunState::Restarting {
                return Ok(());
            }
        }
        self.supervisor.watchdog.complete_setup();
        self.state = RunState::Running;
        let elapsed_s = self.platform.now_ms().saturating_sub(started_ms) / 1_000;
        info!("setup completed in {elapsed_s} seconds");
        Ok(())
    }

    fn run_setup_step(&mut self, step: SetupStep) -> Result<(), StepError> {
        match step {
            SetupStep::Watchdog => {
                info!("starting watchdog");
                self.supervisor.watchdog.arm(u32::MAX);
            }
            SetupStep::Serial => {
                self.serial.begin(SERIAL_BAUD);
                info!(
                    "Arduino Opta Industrial IoT gateway {}",
                    version_label(FIRMWARE_REVISION)
                );
            }
            SetupStep::Board => {
                info!("configuring board");
                let board = self
                    .platform
                    .board_identity()
                    .ok_or_else(|| StepError::Stopped("Failed to find board type".into()))?;
                debug!("board is {}", board.name());
                self.board = Some(board);
            }
            SetupStep::Flash => {
                info!("configuring flash memory");
                self.flash.init()?;
                match provision(&mut self.flash, &mut self.supervisor, &self.blobs, false) {
                    Ok(_) => self.radio_ready = true,
                    Err(err) => {
                        error!("flash provisioning failed, continuing without radio firmware: {err}");
                        self.radio_ready = false;
                    }
                }
            }
            SetupStep::Led => {
                info!("configuring user LEDs");
                self.supervisor.status.apply(LedLevels::default());
            }
            SetupStep::Button => {
                info!("configuring buttons");
                self.decoder = ButtonDecoder::new();
            }
            SetupStep::Config => {
                info!("configuring parameters");
                match DeviceConfig::load_from_store(&mut self.store) {
                    Ok(config) => {
                        self.config = config;
                        self.reset_window()?;
                    }
                    Err(err) => {
                        warn!("configuration not found: {err}");
                        self.reset()?;
                    }
                }
                self.topics = Topics::new(&self.config.broker.base, &self.config.device_id);
            }
            SetupStep::Io => {
                info!("configuring IO");
                self.sampler.setup(&mut self.io, self.config.input_types());
            }
            SetupStep::SerialBus => match self.board {
                Some(board) if board.has_rs485() => {
                    info!("configuring RS485 at {RS485_BAUD} baud");
                    self.platform.configure_serial_bus(RS485_BAUD)?;
                }
                _ => debug!("no serial bus on this board"),
            },
            SetupStep::Network => {
                info!("configuring network");
                let board = self
                    .board
                    .ok_or_else(|| StepError::Stopped("board type unknown".into()))?;
                let mode = select_mode(board, self.radio_ready, &self.config.network);
                self.net = NetworkSession::new(mode);
                self.net
                    .setup(self.now_ms, &mut self.network, &mut self.supervisor, &self.config)?;
            }
            SetupStep::Time => {
                info!("configuring time");
                if self.time_reachable() {
                    // Logged by the keeper; retried from the loop.
                    let _ = self.clock.update(
                        self.now_ms,
                        &mut self.time,
                        &mut self.supervisor,
                        self.config.time_offset(),
                    );
                }
            }
            SetupStep::Broker => {
                info!("configuring MQTT");
                self.broker_connect();
            }
            SetupStep::Web => {
                info!("configuring web server");
                self.web.begin(self.web_port, self.net.mode())?;
                debug!("web server listening on port {}", self.web_port);
            }
        }
        Ok(())
    }

    /// Runs the loop pipeline once. A stopped device only keeps the watchdog fed.
    pub fn run_pass(&mut self) {
        self.now_ms = self.platform.now_ms();
        self.supervisor.kick();
        if self.state != RunState::Running {
            return;
        }
        for step in LoopStep::ORDER {
            self.run_loop_step(step);
            if self.state != RunState::Running {
                debug!("pass ended after {} step", step.name());
                return;
            }
        }
        self.odd_pass = !self.odd_pass;
    }

    fn run_loop_step(&mut self, step: LoopStep) {
        match step {
            LoopStep::Serial => {
                if let Some(command) = self.console.poll(&mut self.serial) {
                    self.execute(command);
                }
            }
            LoopStep::Led => {
                let link = self.connectivity();
                if self.supervisor.status.update(self.now_ms, link) {
                    debug!("I'm alive at {}", self.clock.local_time(self.now_ms));
                }
            }
            LoopStep::Button => {
                let pressed = self.button.is_pressed();
                if let Some(duration) = self.decoder.update(pressed, self.now_ms) {
                    debug!("button was activated {duration} milliseconds");
                    self.on_button(duration);
                }
            }
            LoopStep::Io => {
                if !(self.net.is_connected() && self.session.is_connected()) {
                    return;
                }
                let changes = self
                    .sampler
                    .poll(self.now_ms, &mut self.io, self.config.input_types());
                for change in changes {
                    info!("[I{}] => {}", change.index + 1, change.value);
                    if let Err(err) =
                        self.session
                            .publish_input(&mut self.broker, &self.topics, &change)
                    {
                        warn!("input publish failed: {err}");
                    }
                }
            }
            LoopStep::Network => {
                self.net
                    .poll(self.now_ms, &mut self.network, &mut self.supervisor, &self.config);
            }
            LoopStep::Time => {
                if self.time_reachable() {
                    self.clock.poll(
                        self.now_ms,
                        &mut self.time,
                        &mut self.supervisor,
                        self.config.time_offset(),
                    );
                }
                self.benchmark.tick(self.now_ms);
            }
            LoopStep::Broker => {
                self.broker_connect();
                match self.session.poll_command(&mut self.broker, &self.topics) {
                    Some(BrokerCommand::PublishDevice) => self.publish_device(),
                    Some(BrokerCommand::SetOutput { index, on }) => {
                        self.sampler.set_output(&mut self.io, index, on);
                    }
                    None => {}
                }
                if self
                    .session
                    .periodic_due(self.now_ms, self.config.broker.interval_secs)
                {
                    self.publish_all();
                }
            }
            LoopStep::Web => self.serve_web(),
        }
    }

    /// Marks the device stopped and shows the fault pattern. Never restarts.
    pub fn stop(&mut self, reason: &str) {
        error!("{reason}");
        self.state = RunState::Stopped;
        self.stop_reason = Some(reason.to_string());
        self.supervisor.status.show_fault();
    }

    /// Drops the stored record and persists compiled-in defaults. Does not restart.
    pub fn reset(&mut self) -> Result<(), StepError> {
        info!("resetting device");
        self.store.reset().map_err(ConfigError::from)?;
        self.config = DeviceConfig::default();
        self.config.save_to_store(&mut self.store)?;
        Ok(())
    }

    /// Blinks red and green alternately, then restarts the board.
    pub fn reboot(&mut self) {
        info!("rebooting device");
        for step in 0..REBOOT_BLINKS {
            self.supervisor.status.reboot_blink(step);
            self.platform.delay_ms(REBOOT_BLINK_MS);
            self.supervisor.kick();
        }
        self.state = RunState::Restarting;
        self.platform.restart();
    }

    fn reset_and_reboot(&mut self) {
        if let Err(err) = self.reset() {
            error!("reset failed: {err}");
        }
        self.reboot();
    }

    fn persist(&mut self) {
        if let Err(err) = self.config.save_to_store(&mut self.store) {
            error!("failed to save configuration: {err}");
        }
    }

    /// Red blinks for a few seconds after boot; holding the button through it resets.
    fn reset_window(&mut self) -> Result<(), StepError> {
        warn!("hold the user button for 5 seconds to fully reset the device");
        let mut red = false;
        for round in (0..RESET_WINDOW_ROUNDS).rev() {
            for _ in 0..RESET_WINDOW_TICKS {
                self.platform.delay_ms(RESET_WINDOW_TICK_MS);
                self.supervisor.kick();
                red = !red;
                self.supervisor.status.set(Led::Red, red);
                if self.held_for_reset() {
                    self.reset()?;
                    self.reboot();
                    return Ok(());
                }
            }
            if round > 0 {
                debug!("{round}");
            }
        }
        self.supervisor.status.set(Led::Red, false);
        Ok(())
    }

    fn held_for_reset(&mut self) -> bool {
        let start = self.platform.now_ms();
        while self.button.is_pressed() {
            self.supervisor.status.set(Led::Red, true);
            self.platform.delay_ms(RESET_HOLD_POLL_MS);
            self.supervisor.kick();
            if self.platform.now_ms().saturating_sub(start) > RESET_PRESS_MS {
                return true;
            }
        }
        false
    }

    fn on_button(&mut self, duration_ms: u64) {
        let context = ButtonContext {
            network_connected: self.net.is_connected(),
            access_point: self.net.mode().is_access_point(),
            broker_connected: self.session.is_connected(),
        };
        match classify(duration_ms, context) {
            ButtonAction::ResetAndReboot => self.reset_and_reboot(),
            ButtonAction::ToggleDhcp => {
                self.config.network.dhcp = !self.config.network.dhcp;
                info!("DHCP {}", if self.config.network.dhcp { "enabled" } else { "disabled" });
                self.persist();
                self.reboot();
            }
            ButtonAction::ToggleWifi => {
                self.config.network.wifi = !self.config.network.wifi;
                info!("WiFi {}", if self.config.network.wifi { "enabled" } else { "disabled" });
                self.persist();
                self.reboot();
            }
            ButtonAction::PublishAll => self.publish_all(),
            ButtonAction::Ignore => {}
        }
    }

    fn execute(&mut self, command: SerialCommand) {
        match command {
            SerialCommand::Ip => {
                info!("local IP address {}", self.network.local_ip(self.net.mode()));
            }
            SerialCommand::Config => match self.config.to_json(false) {
                Ok(json) => info!("{json}"),
                Err(err) => warn!("{err}"),
            },
            SerialCommand::Time => info!("local time {}", self.clock.local_time(self.now_ms)),
            SerialCommand::UpdateTime => {
                if self.time_reachable() {
                    let _ = self.clock.update(
                        self.now_ms,
                        &mut self.time,
                        &mut self.supervisor,
                        self.config.time_offset(),
                    );
                } else {
                    warn!("no network to update time");
                }
            }
            SerialCommand::Version => info!("{}", version_label(FIRMWARE_REVISION)),
            SerialCommand::Format => {
                match provision(&mut self.flash, &mut self.supervisor, &self.blobs, true) {
                    Ok(_) => self.reboot(),
                    Err(err) => error!("format failed: {err}"),
                }
            }
            SerialCommand::Reset => {
                if let Err(err) = self.reset() {
                    error!("reset failed: {err}");
                }
                warn!("you should reboot device");
            }
            SerialCommand::Reboot => self.reboot(),
            SerialCommand::Dhcp => {
                self.config.network.dhcp = !self.config.network.dhcp;
                self.persist();
                warn!("you should reboot device");
            }
            SerialCommand::Wifi => {
                self.config.network.wifi = !self.config.network.wifi;
                self.persist();
                warn!("you should reboot device");
            }
            SerialCommand::Publish => self.publish_all(),
            SerialCommand::Loop => self.benchmark.start(self.now_ms),
            SerialCommand::Unknown(line) => debug!("unknown command {line:?}"),
        }
    }

    fn connectivity(&self) -> Connectivity {
        Connectivity {
            network_connected: self.net.is_connected(),
            broker_connected: self.session.is_connected(),
            mode: Some(self.net.mode()),
        }
    }

    fn time_reachable(&self) -> bool {
        self.net.is_connected() && !self.net.mode().is_access_point()
    }

    fn broker_connect(&mut self) {
        let uplink = Uplink {
            connected: self.net.is_connected(),
            mode: self.net.mode(),
        };
        let established = self.session.connect(
            self.now_ms,
            &mut self.broker,
            &mut self.supervisor,
            uplink,
            &self.config,
        );
        if established {
            self.publish_device();
        }
    }

    fn publish_device(&mut self) {
        let ip = self.network.local_ip(self.net.mode()).to_string();
        let name = self.board.map_or("unknown", BoardType::name);
        if let Err(err) = self
            .session
            .publish_device(&mut self.broker, &self.topics, name, &ip)
        {
            warn!("device publish failed: {err}");
        }
    }

    fn publish_all(&mut self) {
        self.publish_device();
        let samples = self.sampler.snapshot(&mut self.io, self.config.input_types());
        if let Err(err) = self
            .session
            .publish_inputs(&mut self.broker, &self.topics, &samples)
        {
            warn!("inputs publish failed: {err}");
        }
    }

    fn serve_web(&mut self) {
        if !(self.net.is_connected() && self.odd_pass) {
            return;
        }
        let Some(mut conn) = self.web.accept() else {
            return;
        };
        let reboot = self.serve(&mut conn);
        conn.close();
        if reboot {
            self.platform.delay_ms(FORM_REBOOT_DELAY_MS);
            self.supervisor.kick();
            self.reboot();
        }
    }

    /// Answers one request. Returns true when an accepted configuration needs a reboot.
    fn serve<C: WebConnection>(&mut self, conn: &mut C) -> bool {
        let credentials =
            expected_credentials(&self.config.device_user, &self.config.device_password);
        let Some(request) = read_request(conn, &mut self.platform, &mut self.supervisor, &credentials)
        else {
            debug!("web client went idle");
            return false;
        };
        if !request.authorized {
            send(conn, &Response::unauthorized());
            return false;
        }

        let response = match request.route {
            Route::Style => Response::style(),
            Route::Home => Response::home(),
            Route::Device => Response::device(),
            Route::Favicon => Response::favicon(),
            Route::NotFound => Response::not_found(),
            Route::Config => json_response(self.config.to_json(true)),
            Route::Data => json_response(serde_json::to_string(&self.data_payload())),
            Route::Publish => {
                self.publish_all();
                Response::envelope(&StatusEnvelope::success("Informations published"))
            }
            Route::Form => match apply_form(&self.config, &request.body) {
                Ok(updated) => {
                    send(
                        conn,
                        &Response::envelope(&StatusEnvelope::success("Configuration updated")),
                    );
                    self.config = updated;
                    self.persist();
                    return true;
                }
                Err(err) => {
                    warn!("failed to load configuration from request: {err}");
                    Response::forbidden(&StatusEnvelope::error("Configuration not updated"))
                }
            },
        };
        send(conn, &response);
        false
    }

    fn data_payload(&mut self) -> DataPayload {
        let inputs = self
            .config
            .input_types()
            .iter()
            .enumerate()
            .map(|(index, kind)| {
                let status = InputStatus {
                    kind: kind.code(),
                    value: self.sampler.reading(&mut self.io, index, *kind),
                };
                (format!("I{}", index + 1), status)
            })
            .collect();
        let outputs = self
            .sampler
            .outputs()
            .iter()
            .enumerate()
            .map(|(index, on)| (format!("O{}", index + 1), u8::from(*on)))
            .collect();

        DataPayload {
            device_id: self.config.device_id.clone(),
            version: version_label(FIRMWARE_REVISION),
            mqtt_connected: self.session.is_connected(),
            time: self.clock.local_time(self.now_ms),
            gmt: self.config.time_offset(),
            inputs,
            outputs,
        }
    }
}

fn json_response<E: Display>(body: Result<String, E>) -> Response {
    match body {
        Ok(json) => Response::json(json),
        Err(err) => {
            warn!("failed to encode response: {err}");
            Response::not_found()
        }
    }
}
