use std::{
    io::Read,
    sync::mpsc,
    thread,
};

use log::{debug, warn};
use opta2iot_common::hal::SerialPort;

/// Console bytes from stdin, read on a helper thread so polling never blocks.
pub struct StdinConsole {
    rx: mpsc::Receiver<u8>,
}

impl StdinConsole {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("console".into())
            .stack_size(8 * 1024)
            .spawn(move || {
                for byte in std::io::stdin().lock().bytes() {
                    let Ok(byte) = byte else { break };
                    if tx.send(byte).is_err() {
                        break;
                    }
                }
            });
        if let Err(err) = spawned {
            warn!("console unavailable: {err}");
        }
        Self { rx }
    }
}

impl SerialPort for StdinConsole {
    fn begin(&mut self, baud: u32) {
        debug!("console ready ({baud} baud)");
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.rx.try_recv().ok()
    }
}
