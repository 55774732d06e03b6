//! Hardware watchdog discipline.
//!
//! The window stays at its normal length while the loop runs and is raised to the hardware
//! maximum around calls that may block. It is only lowered back once the first setup pass has
//! completed, so slow first connects during setup never trip it.

use log::debug;

use crate::hal::Watchdog;

pub const WATCHDOG_NORMAL_TIMEOUT_MS: u32 = 5_000;

pub struct WatchdogGuard<W: Watchdog> {
    hw: W,
    normal_ms: u32,
    active_ms: Option<u32>,
    setup_complete: bool,
}

impl<W: Watchdog> WatchdogGuard<W> {
    pub fn new(hw: W, normal_ms: u32) -> Self {
        Self {
            hw,
            normal_ms,
            active_ms: None,
            setup_complete: false,
        }
    }

    pub fn arm(&mut self, timeout_ms: u32) {
        let timeout_ms = timeout_ms.min(self.hw.max_timeout_ms());
        debug!("watchdog armed for {timeout_ms} ms");
        self.hw.start(timeout_ms);
        self.active_ms = Some(timeout_ms);
    }

    pub fn kick(&mut self) {
        if self.active_ms.is_some() {
            self.hw.kick();
        }
    }

    pub fn raise_to_max(&mut self) {
        let max = self.hw.max_timeout_ms();
        if self.active_ms.is_some_and(|active| active != max) {
            self.arm(max);
        } else {
            self.kick();
        }
    }

    pub fn lower_to_normal(&mut self) {
        if !self.setup_complete {
            self.kick();
            return;
        }
        if self.active_ms.is_some_and(|active| active != self.normal_ms) {
            self.arm(self.normal_ms);
        } else {
            self.kick();
        }
    }

    /// Marks the first setup pass as done and drops to the normal window.
    pub fn complete_setup(&mut self) {
        self.setup_complete = true;
        self.lower_to_normal();
    }

    pub fn active_ms(&self) -> Option<u32> {
        self.active_ms
    }

    pub fn hardware(&self) -> &W {
        &self.hw
    }
}
