//! Flash layout and one-time provisioning of the radio partition.
//!
//! ```text
//! 0 MiB ........ 1 MiB  wifi  (radio firmware + certificates)
//! 1 MiB ........ 6 MiB  ota
//! 6 MiB ........ 7 MiB  kv    (configuration record, never formatted here)
//! 7 MiB ....... 14 MiB  user
//! 15.5 MiB ... 16 MiB   memory mapped radio firmware, outside any filesystem
//! ```

use std::fmt;

use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    hal::{FlashDevice, RadioBlobs},
    supervisor::{frozen, Guard},
};

const MIB: u64 = 1024 * 1024;

pub const MAPPED_FIRMWARE_OFFSET: u64 = 15 * MIB + 512 * 1024;
pub const FIRMWARE_CHUNK_BYTES: usize = 1024;
pub const CERTIFICATE_CHUNK_BYTES: usize = 128;
pub const PROGRESS_STEP_PERCENT: u8 = 10;
pub const ERASE_STEP_BYTES: u64 = MIB;
pub const FIRMWARE_FILE: &str = "4343WA1.BIN";
pub const CERTIFICATE_FILE: &str = "cacert.pem";

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("block device initialization failed: {0}")]
    Init(String),
    #[error("{0} partition cannot be mounted")]
    Unmounted(Partition),
    #[error("error formatting {0} partition: {1}")]
    Format(Partition, String),
    #[error("error writing {what}: {reason}")]
    Write { what: &'static str, reason: String },
    #[error("memory mapped firmware does not match the embedded image")]
    Verify,
    #[error("block device error: {0}")]
    Device(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Partition {
    Wifi,
    Ota,
    KvStore,
    User,
}

impl Partition {
    pub const ALL: [Partition; 4] = [Self::Wifi, Self::Ota, Self::KvStore, Self::User];

    /// MBR slot number, 1-based.
    pub fn slot(self) -> u8 {
        match self {
            Self::Wifi => 1,
            Self::Ota => 2,
            Self::KvStore => 3,
            Self::User => 4,
        }
    }

    pub fn bounds(self) -> (u64, u64) {
        match self {
            Self::Wifi => (0, MIB),
            Self::Ota => (MIB, 6 * MIB),
            Self::KvStore => (6 * MIB, 7 * MIB),
            Self::User => (7 * MIB, 14 * MIB),
        }
    }

    pub fn is_managed(self) -> bool {
        !matches!(self, Self::KvStore)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Wifi => "WiFi",
            Self::Ota => "OTA",
            Self::KvStore => "KV store",
            Self::User => "user",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionPlan {
    pub wifi: bool,
    pub ota: bool,
    pub user: bool,
}

impl ProvisionPlan {
    pub fn any(&self) -> bool {
        self.wifi || self.ota || self.user
    }

    pub fn needs(&self, partition: Partition) -> bool {
        match partition {
            Partition::Wifi => self.wifi,
            Partition::Ota => self.ota,
            Partition::User => self.user,
            Partition::KvStore => false,
        }
    }

    fn mark(&mut self, partition: Partition) {
        match partition {
            Partition::Wifi => self.wifi = true,
            Partition::Ota => self.ota = true,
            Partition::User => self.user = true,
            Partition::KvStore => {}
        }
    }
}

/// Coarse percentage reporting for long writes.
#[derive(Debug, Clone)]
pub struct Progress {
    step: u8,
    reported: u8,
}

impl Progress {
    pub fn new(step: u8) -> Self {
        Self { step, reported: 0 }
    }

    /// Returns the new percentage once it moved by at least one step.
    pub fn advance(&mut self, done: usize, total: usize) -> Option<u8> {
        if total == 0 {
            return None;
        }
        let percent = (done.saturating_mul(100) / total).min(100) as u8;
        if percent >= self.reported.saturating_add(self.step) {
            self.reported = percent;
            Some(percent)
        } else {
            None
        }
    }
}

pub fn survey<F: FlashDevice + ?Sized>(flash: &mut F, force: bool) -> ProvisionPlan {
    let mut plan = ProvisionPlan::default();
    for partition in Partition::ALL.into_iter().filter(|p| p.is_managed()) {
        match flash.mount(partition) {
            Ok(()) => debug!("existing {partition} partition"),
            Err(err) => {
                debug!("missing {partition} partition: {err}");
                plan.mark(partition);
            }
        }
        if force {
            plan.mark(partition);
        }
    }
    plan
}

/// Mount-checks the managed partitions and rebuilds whatever is missing (everything when
/// `force` is set). Returns the plan that was carried out.
pub fn provision<F, G>(
    flash: &mut F,
    guard: &mut G,
    blobs: &RadioBlobs,
    force: bool,
) -> Result<ProvisionPlan, FlashError>
where
    F: FlashDevice + ?Sized,
    G: Guard + ?Sized,
{
    let plan = survey(flash, force);
    if !plan.any() {
        return Ok(plan);
    }

    frozen(guard, |guard| {
        info!("erasing partitions, please wait...");
        erase_device(flash, guard)?;
        debug!("erase completed");

        for partition in Partition::ALL {
            let (start, end) = partition.bounds();
            flash.define_partition(partition, start, end)?;
        }

        for partition in Partition::ALL.into_iter().filter(|p| plan.needs(*p)) {
            info!("formatting {partition} partition");
            flash
                .reformat(partition)
                .map_err(|err| FlashError::Format(partition, err.to_string()))?;
            if partition == Partition::Wifi {
                stage_radio_files(flash, guard, blobs)?;
                mirror_radio_firmware(flash, guard, &blobs.firmware)?;
            }
        }
        Ok(plan)
    })
    .inspect_err(|err| error!("flash provisioning aborted: {err}"))
}

fn erase_device<F, G>(flash: &mut F, guard: &mut G) -> Result<(), FlashError>
where
    F: FlashDevice + ?Sized,
    G: Guard + ?Sized,
{
    let size = flash.size();
    let mut offset = 0;
    while offset < size {
        let len = ERASE_STEP_BYTES.min(size - offset);
        flash.erase(offset, len)?;
        guard.kick();
        offset += len;
    }
    Ok(())
}

fn stage_radio_files<F, G>(flash: &mut F, guard: &mut G, blobs: &RadioBlobs) -> Result<(), FlashError>
where
    F: FlashDevice + ?Sized,
    G: Guard + ?Sized,
{
    info!("flashing WiFi firmware");
    stream_file(
        flash,
        guard,
        FIRMWARE_FILE,
        &blobs.firmware,
        FIRMWARE_CHUNK_BYTES,
        "firmware data",
    )?;

    info!("flashing certificates");
    stream_file(
        flash,
        guard,
        CERTIFICATE_FILE,
        &blobs.certificates,
        CERTIFICATE_CHUNK_BYTES,
        "certificates",
    )
}

fn stream_file<F, G>(
    flash: &mut F,
    guard: &mut G,
    name: &str,
    data: &[u8],
    chunk_bytes: usize,
    what: &'static str,
) -> Result<(), FlashError>
where
    F: FlashDevice + ?Sized,
    G: Guard + ?Sized,
{
    let write_error = |err: FlashError| FlashError::Write {
        what,
        reason: err.to_string(),
    };

    flash
        .create_file(Partition::Wifi, name)
        .map_err(write_error)?;

    let mut progress = Progress::new(PROGRESS_STEP_PERCENT);
    let mut written = 0;
    debug!("0%");
    for chunk in data.chunks(chunk_bytes) {
        flash
            .append_file(Partition::Wifi, name, chunk)
            .map_err(write_error)?;
        guard.kick();
        written += chunk.len();
        if let Some(percent) = progress.advance(written, data.len()) {
            debug!("{percent}%");
        }
    }
    Ok(())
}

fn mirror_radio_firmware<F, G>(flash: &mut F, guard: &mut G, image: &[u8]) -> Result<(), FlashError>
where
    F: FlashDevice + ?Sized,
    G: Guard + ?Sized,
{
    info!("flashing memory mapped WiFi firmware");

    let mut progress = Progress::new(PROGRESS_STEP_PERCENT);
    let mut written = 0;
    for chunk in image.chunks(FIRMWARE_CHUNK_BYTES) {
        flash
            .program(MAPPED_FIRMWARE_OFFSET + written as u64, chunk)
            .map_err(|err| FlashError::Write {
                what: "memory mapped firmware",
                reason: err.to_string(),
            })?;
        guard.kick();
        written += chunk.len();
        if let Some(percent) = progress.advance(written, image.len()) {
            debug!("{percent}%");
        }
    }

    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; FIRMWARE_CHUNK_BYTES];
    let mut offset = 0;
    while offset < image.len() {
        let len = FIRMWARE_CHUNK_BYTES.min(image.len() - offset);
        flash.read(MAPPED_FIRMWARE_OFFSET + offset as u64, &mut buffer[..len])?;
        hasher.update(&buffer[..len]);
        guard.kick();
        offset += len;
    }
    if hasher.finalize() != Sha256::digest(image) {
        warn!("memory mapped firmware digest mismatch");
        return Err(FlashError::Verify);
    }
    Ok(())
}
