pub const RESET_PRESS_MS: u64 = 5_000;
pub const SHORT_PRESS_MS: u64 = 1_000;
pub const MEDIUM_PRESS_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    ResetAndReboot,
    ToggleDhcp,
    ToggleWifi,
    PublishAll,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonContext {
    pub network_connected: bool,
    pub access_point: bool,
    pub broker_connected: bool,
}

/// Tracks one press at a time.
#[derive(Debug, Default)]
pub struct ButtonDecoder {
    press_start_ms: Option<u64>,
    duration_ms: u64,
}

impl ButtonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the current level; returns the press duration once, on release.
    pub fn update(&mut self, pressed: bool, now_ms: u64) -> Option<u64> {
        if pressed {
            let start = *self.press_start_ms.get_or_insert(now_ms);
            self.duration_ms = now_ms.saturating_sub(start);
            return None;
        }
        let started = self.press_start_ms.take();
        let duration = std::mem::take(&mut self.duration_ms);
        (started.is_some() && duration > 0).then_some(duration)
    }

    /// Duration of the press in progress.
    pub fn held_ms(&self) -> u64 {
        self.duration_ms
    }
}

pub fn classify(duration_ms: u64, ctx: ButtonContext) -> ButtonAction {
    let offline = !ctx.network_connected || ctx.access_point;
    if duration_ms > RESET_PRESS_MS {
        ButtonAction::ResetAndReboot
    } else if offline && duration_ms < SHORT_PRESS_MS {
        ButtonAction::ToggleDhcp
    } else if offline && duration_ms < MEDIUM_PRESS_MS {
        ButtonAction::ToggleWifi
    } else if !offline && ctx.broker_connected && duration_ms < SHORT_PRESS_MS {
        ButtonAction::PublishAll
    } else {
        ButtonAction::Ignore
    }
}
