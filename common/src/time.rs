use chrono::DateTime;
use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    hal::TimeSource,
    supervisor::{frozen, Guard},
};

pub const TIME_SERVER: &str = "pool.ntp.org";
pub const TIME_RETRY_INTERVAL_MS: u64 = 3_600_000;
pub const TIME_TIMEOUT_MS: u32 = 1_000;
const BENCHMARK_WINDOW_MS: u64 = 1_000;
const BENCHMARK_ROUNDS: u32 = 10;

#[derive(Debug, Error)]
pub enum TimeError {
    #[error("time server unreachable: {0}")]
    Unreachable(String),
    #[error("no answer from time server")]
    Timeout,
}

/// Wall clock derived from one NTP answer plus the monotonic clock.
#[derive(Debug, Default)]
pub struct TimeKeeper {
    synced: Option<(i64, u64)>,
    last_attempt_ms: Option<u64>,
}

impl TimeKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_synced(&self) -> bool {
        self.synced.is_some()
    }

    /// One bounded sync attempt. `offset_hours` is folded into the stored epoch.
    pub fn update<T, G>(
        &mut self,
        now_ms: u64,
        source: &mut T,
        guard: &mut G,
        offset_hours: i32,
    ) -> Result<(), TimeError>
    where
        T: TimeSource + ?Sized,
        G: Guard + ?Sized,
    {
        info!("updating local time");
        self.last_attempt_ms = Some(now_ms);
        let epoch = frozen(guard, |_| source.fetch_epoch(TIME_SERVER, TIME_TIMEOUT_MS))
            .inspect_err(|err| warn!("failed to update local time: {err}"))?;
        self.synced = Some((epoch + i64::from(offset_hours) * 3_600, now_ms));
        debug!("time set to {}", self.local_time(now_ms));
        Ok(())
    }

    /// Retries an unsynced clock once per [`TIME_RETRY_INTERVAL_MS`].
    pub fn poll<T, G>(&mut self, now_ms: u64, source: &mut T, guard: &mut G, offset_hours: i32)
    where
        T: TimeSource + ?Sized,
        G: Guard + ?Sized,
    {
        if self.synced.is_some() {
            return;
        }
        let due = self
            .last_attempt_ms
            .map_or(true, |at| now_ms.saturating_sub(at) >= TIME_RETRY_INTERVAL_MS);
        if due {
            // Failure is already logged; the next try is an hour away.
            let _ = self.update(now_ms, source, guard, offset_hours);
        }
    }

    /// Local seconds since the epoch, or uptime seconds before the first sync.
    pub fn local_epoch(&self, now_ms: u64) -> i64 {
        match self.synced {
            Some((epoch, at)) => epoch + (now_ms.saturating_sub(at) / 1_000) as i64,
            None => (now_ms / 1_000) as i64,
        }
    }

    pub fn local_time(&self, now_ms: u64) -> String {
        DateTime::from_timestamp(self.local_epoch(now_ms), 0)
            .map(|time| time.format("%k:%M:%S").to_string())
            .unwrap_or_default()
    }
}

/// Counts loop passes per second over ten one-second windows.
#[derive(Debug, Default)]
pub struct LoopBenchmark {
    window_start_ms: Option<u64>,
    count: u32,
    rounds: u32,
    sum: u32,
}

impl LoopBenchmark {
    pub fn start(&mut self, now_ms: u64) {
        info!("getting loop time");
        *self = Self {
            window_start_ms: Some(now_ms),
            ..Self::default()
        };
    }

    pub fn is_running(&self) -> bool {
        self.window_start_ms.is_some()
    }

    /// Counts one pass. Returns the average once all rounds are done.
    pub fn tick(&mut self, now_ms: u64) -> Option<u32> {
        let start = self.window_start_ms?;
        self.count += 1;
        if now_ms.saturating_sub(start) <= BENCHMARK_WINDOW_MS {
            return None;
        }
        debug!("{} loops per second", self.count);
        self.sum += self.count;
        self.count = 0;
        self.rounds += 1;
        if self.rounds < BENCHMARK_ROUNDS {
            self.window_start_ms = Some(now_ms);
            return None;
        }
        self.window_start_ms = None;
        let average = self.sum / BENCHMARK_ROUNDS;
        info!("average of {average} loops per second");
        Some(average)
    }
}
