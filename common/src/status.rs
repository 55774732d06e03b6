use crate::{
    hal::{Led, StatusLeds},
    types::NetworkMode,
};

pub const CONNECTION_BLINK_MS: u64 = 750;
pub const HEARTBEAT_PERIOD_MS: u64 = 10_000;
const HEARTBEAT_FLASH_ON_MS: u64 = HEARTBEAT_PERIOD_MS + 150;
const HEARTBEAT_FLASH_OFF_MS: u64 = HEARTBEAT_PERIOD_MS + 200;
const HEARTBEAT_RESTORE_MS: u64 = HEARTBEAT_PERIOD_MS + 350;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedLevels {
    pub green: bool,
    pub red: bool,
    pub blue: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    pub network_connected: bool,
    pub broker_connected: bool,
    pub mode: Option<NetworkMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatPhase {
    Waiting,
    Dark,
    Flash,
    Settle,
}

pub struct StatusSignal<L: StatusLeds> {
    leds: L,
    blink_on: bool,
    blink_start_ms: u64,
    heartbeat: HeartbeatPhase,
    heartbeat_start_ms: u64,
    heartbeat_saved: LedLevels,
    frozen_saved: Option<LedLevels>,
}

impl<L: StatusLeds> StatusSignal<L> {
    pub fn new(leds: L) -> Self {
        Self {
            leds,
            blink_on: false,
            blink_start_ms: 0,
            heartbeat: HeartbeatPhase::Waiting,
            heartbeat_start_ms: 0,
            heartbeat_saved: LedLevels::default(),
            frozen_saved: None,
        }
    }

    pub fn levels(&self) -> LedLevels {
        LedLevels {
            green: self.leds.get(Led::Green),
            red: self.leds.get(Led::Red),
            blue: self.leds.get(Led::Blue),
        }
    }

    pub fn apply(&mut self, levels: LedLevels) {
        self.leds.set(Led::Green, levels.green);
        self.leds.set(Led::Red, levels.red);
        self.leds.set(Led::Blue, levels.blue);
    }

    pub fn set(&mut self, led: Led, on: bool) {
        self.leds.set(led, on);
    }

    /// One loop pass of connectivity blinking and heartbeat. Returns true when a heartbeat
    /// cycle has just completed.
    pub fn update(&mut self, now_ms: u64, link: Connectivity) -> bool {
        if now_ms.saturating_sub(self.blink_start_ms) > CONNECTION_BLINK_MS {
            self.blink_on = !self.blink_on;
            self.blink_start_ms = now_ms;

            let state = self.blink_on;
            self.leds
                .set(Led::Red, if link.network_connected { false } else { state });
            self.leds.set(
                Led::Green,
                link.network_connected && link.broker_connected && state,
            );
            match link.mode {
                Some(NetworkMode::WifiAccessPoint) => self.leds.set(Led::Blue, true),
                Some(NetworkMode::WifiStandard) => self
                    .leds
                    .set(Led::Blue, if link.network_connected { true } else { state }),
                Some(NetworkMode::Ethernet) | None => self.leds.set(Led::Blue, false),
            }
        }

        let elapsed = now_ms.saturating_sub(self.heartbeat_start_ms);
        if elapsed <= HEARTBEAT_PERIOD_MS {
            return false;
        }
        match self.heartbeat {
            HeartbeatPhase::Waiting => {
                self.heartbeat_saved = self.levels();
                self.leds.set(Led::Green, false);
                self.leds.set(Led::Red, false);
                self.heartbeat = HeartbeatPhase::Dark;
            }
            HeartbeatPhase::Dark if elapsed > HEARTBEAT_FLASH_ON_MS => {
                self.leds.set(Led::Green, true);
                self.leds.set(Led::Red, true);
                self.heartbeat = HeartbeatPhase::Flash;
            }
            HeartbeatPhase::Flash if elapsed > HEARTBEAT_FLASH_OFF_MS => {
                self.leds.set(Led::Green, false);
                self.leds.set(Led::Red, false);
                self.heartbeat = HeartbeatPhase::Settle;
            }
            HeartbeatPhase::Settle if elapsed > HEARTBEAT_RESTORE_MS => {
                self.leds.set(Led::Green, self.heartbeat_saved.green);
                self.leds.set(Led::Red, self.heartbeat_saved.red);
                self.heartbeat = HeartbeatPhase::Waiting;
                self.heartbeat_start_ms = now_ms;
                return true;
            }
            _ => {}
        }
        false
    }

    /// Saves the current levels and shows the busy pattern: green and red on, blue off.
    pub fn freeze(&mut self) {
        self.frozen_saved = Some(self.levels());
        self.apply(LedLevels {
            green: true,
            red: true,
            blue: false,
        });
    }

    pub fn thaw(&mut self) {
        if let Some(saved) = self.frozen_saved.take() {
            self.apply(saved);
        }
    }

    /// Steady red, used once the device has stopped.
    pub fn show_fault(&mut self) {
        self.frozen_saved = None;
        self.apply(LedLevels {
            green: false,
            red: true,
            blue: false,
        });
    }

    pub fn reboot_blink(&mut self, step: usize) {
        let red = step % 2 == 0;
        self.leds.set(Led::Red, red);
        self.leds.set(Led::Green, !red);
    }
}
