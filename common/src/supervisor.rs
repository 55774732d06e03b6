use crate::{
    hal::{StatusLeds, Watchdog},
    status::StatusSignal,
    watchdog::WatchdogGuard,
};

/// What a component needs to bracket a blocking call.
pub trait Guard {
    fn kick(&mut self);
    /// Busy LEDs plus maximum watchdog window. Nested calls are counted.
    fn freeze(&mut self);
    fn release(&mut self);
}

pub fn frozen<G: Guard + ?Sized, T>(guard: &mut G, f: impl FnOnce(&mut G) -> T) -> T {
    guard.freeze();
    let out = f(guard);
    guard.release();
    out
}

pub struct Supervisor<W: Watchdog, L: StatusLeds> {
    pub watchdog: WatchdogGuard<W>,
    pub status: StatusSignal<L>,
    depth: u32,
}

impl<W: Watchdog, L: StatusLeds> Supervisor<W, L> {
    pub fn new(watchdog: WatchdogGuard<W>, status: StatusSignal<L>) -> Self {
        Self {
            watchdog,
            status,
            depth: 0,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.depth > 0
    }
}

impl<W: Watchdog, L: StatusLeds> Guard for Supervisor<W, L> {
    fn kick(&mut self) {
        self.watchdog.kick();
    }

    fn freeze(&mut self) {
        if self.depth == 0 {
            self.status.freeze();
            self.watchdog.raise_to_max();
        }
        self.depth += 1;
    }

    fn release(&mut self) {
        match self.depth {
            0 => {}
            1 => {
                self.depth = 0;
                self.status.thaw();
                self.watchdog.lower_to_normal();
            }
            _ => self.depth -= 1,
        }
    }
}
