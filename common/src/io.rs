use log::{debug, info};

use crate::{
    config::InputType,
    hal::IoPins,
    types::{InputReading, INPUT_COUNT, OUTPUT_COUNT},
};

pub const IO_POLL_INTERVAL_MS: u64 = 50;
pub const ANALOG_RESOLUTION_BITS: u8 = 16;
const ANALOG_REFERENCE_VOLTS: f32 = 3.249;
const ANALOG_DIVIDER_RATIO: f32 = 0.3034;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSample {
    pub index: usize,
    pub kind: InputType,
    pub value: String,
}

/// Samples the input terminals and drives the relays.
pub struct IoSampler {
    resolution_bits: u8,
    last_poll_ms: Option<u64>,
    previous: [String; INPUT_COUNT],
    outputs: [bool; OUTPUT_COUNT],
}

impl IoSampler {
    pub fn new(resolution_bits: u8) -> Self {
        Self {
            resolution_bits: resolution_bits.clamp(1, 16),
            last_poll_ms: None,
            previous: Default::default(),
            outputs: [false; OUTPUT_COUNT],
        }
    }

    pub fn setup<P: IoPins + ?Sized>(&mut self, pins: &mut P, inputs: &[InputType; INPUT_COUNT]) {
        pins.set_analog_resolution(self.resolution_bits);
        for (index, kind) in inputs.iter().enumerate() {
            pins.configure_input(index, *kind);
            debug!("I{} configured as {kind:?}", index + 1);
        }
        for index in 0..OUTPUT_COUNT {
            pins.configure_output(index);
            pins.write_output(index, false);
            pins.write_output_led(index, false);
        }
        self.outputs = [false; OUTPUT_COUNT];
        self.last_poll_ms = None;
    }

    /// Terminal voltage for a raw conversion at the configured resolution.
    pub fn volts(&self, raw: u32) -> f32 {
        let full_scale = ((1_u32 << self.resolution_bits) - 1) as f32;
        raw as f32 * (ANALOG_REFERENCE_VOLTS / full_scale) / ANALOG_DIVIDER_RATIO
    }

    pub fn reading<P: IoPins + ?Sized>(
        &self,
        pins: &mut P,
        index: usize,
        kind: InputType,
    ) -> InputReading {
        if kind.is_analog() {
            InputReading::Volts(self.volts(pins.read_analog(index)))
        } else {
            InputReading::Level(u8::from(pins.read_digital(index)))
        }
    }

    pub fn read_text<P: IoPins + ?Sized>(&self, pins: &mut P, index: usize, kind: InputType) -> String {
        match self.reading(pins, index, kind) {
            InputReading::Volts(volts) => format!("{volts:.1}"),
            InputReading::Level(level) => level.to_string(),
        }
    }

    pub fn snapshot<P: IoPins + ?Sized>(
        &self,
        pins: &mut P,
        inputs: &[InputType; INPUT_COUNT],
    ) -> Vec<InputSample> {
        inputs
            .iter()
            .enumerate()
            .map(|(index, kind)| InputSample {
                index,
                kind: *kind,
                value: self.read_text(pins, index, *kind),
            })
            .collect()
    }

    /// Samples every input once the poll interval has elapsed and returns the ones worth
    /// publishing. The first sample after setup only seeds the history.
    pub fn poll<P: IoPins + ?Sized>(
        &mut self,
        now_ms: u64,
        pins: &mut P,
        inputs: &[InputType; INPUT_COUNT],
    ) -> Vec<InputSample> {
        let first = match self.last_poll_ms {
            Some(last) if now_ms.saturating_sub(last) <= IO_POLL_INTERVAL_MS => return Vec::new(),
            Some(_) => false,
            None => true,
        };
        self.last_poll_ms = Some(now_ms);

        let mut changes = Vec::new();
        for (index, kind) in inputs.iter().copied().enumerate() {
            let value = self.read_text(pins, index, kind);
            if value == self.previous[index] {
                continue;
            }
            let rising = value != "0";
            self.previous[index] = value.clone();
            // Pulse inputs only report the rising edge.
            if first || (kind == InputType::Pulse && !rising) {
                continue;
            }
            debug!("I{} changed to {value}", index + 1);
            changes.push(InputSample { index, kind, value });
        }
        changes
    }

    /// Drives a relay and its LED. Out of range indexes are ignored.
    pub fn set_output<P: IoPins + ?Sized>(&mut self, pins: &mut P, index: usize, on: bool) -> bool {
        let Some(state) = self.outputs.get_mut(index) else {
            return false;
        };
        pins.write_output(index, on);
        pins.write_output_led(index, on);
        *state = on;
        info!("O{} set to {}", index + 1, u8::from(on));
        true
    }

    pub fn output(&self, index: usize) -> bool {
        self.outputs.get(index).copied().unwrap_or(false)
    }

    pub fn outputs(&self) -> &[bool; OUTPUT_COUNT] {
        &self.outputs
    }
}
