use log::info;

use crate::hal::SerialPort;

pub const SERIAL_BAUD: u32 = 115_200;
pub const COMMAND_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialCommand {
    Ip,
    Config,
    Time,
    UpdateTime,
    Version,
    Format,
    Reset,
    Reboot,
    Dhcp,
    Wifi,
    Publish,
    Loop,
    Unknown(String),
}

impl SerialCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim().to_lowercase();
        match line.as_str() {
            "ip" => Self::Ip,
            "config" => Self::Config,
            "time" => Self::Time,
            "update time" => Self::UpdateTime,
            "version" => Self::Version,
            "format" => Self::Format,
            "reset" => Self::Reset,
            "reboot" => Self::Reboot,
            "dhcp" => Self::Dhcp,
            "wifi" => Self::Wifi,
            "publish" => Self::Publish,
            "loop" => Self::Loop,
            _ => Self::Unknown(line),
        }
    }
}

/// Line assembler for the diagnostic console.
#[derive(Debug, Default)]
pub struct SerialConsole {
    buffer: Vec<u8>,
}

impl SerialConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains pending bytes up to the first newline. Bytes past the capacity are dropped.
    pub fn poll<S: SerialPort + ?Sized>(&mut self, port: &mut S) -> Option<SerialCommand> {
        while let Some(byte) = port.read_byte() {
            match byte {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.buffer).into_owned();
                    self.buffer.clear();
                    info!("receiving serial message: {}", line.trim_end());
                    return Some(SerialCommand::parse(&line));
                }
                _ if self.buffer.len() < COMMAND_CAPACITY => self.buffer.push(byte),
                _ => {}
            }
        }
        None
    }
}
