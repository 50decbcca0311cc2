// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Image checksum verification.

use crate::config::AppId;
use crate::error::{Error, Result};
use crate::extflash::{Mode, SpiNorBus};
use crate::log::{debug, info, warn};
use crate::metadata::{AppMetadataEntry, MetadataManager};
use crate::region::RegionKind;
use crate::router::Router;
use consts::IMAGE_FOOTER_SIZE;
use crc::{Crc, CRC_32_ISCSI};
use embedded_storage::nor_flash::NorFlash;

pub const IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const READ_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageStatus {
    Valid,
    Invalid,
}

impl ImageStatus {
    pub fn is_valid(self) -> bool {
        self == ImageStatus::Valid
    }
}

/// Checksum of an image as stored in its footer.
pub fn image_checksum(image: &[u8]) -> u32 {
    IMAGE_CRC.checksum(image)
}

/// Validates the image `metadata` lists for `app`.
pub fn validate<I, E, X>(router: &mut Router<I, E, X>, metadata: &MetadataManager, app: AppId) -> Result<ImageStatus>
where
    I: NorFlash,
    E: NorFlash,
    X: SpiNorBus,
{
    let entry = metadata.entry(app)?;
    validate_entry(router, app, entry)
}

/// Validates the image described by `entry`, addresses are translated for `app`.
///
/// An empty entry is [`ImageStatus::Invalid`], a range outside every region is
/// [`Error::Address`]. The external flash mode is restored afterwards.
pub fn validate_entry<I, E, X>(router: &mut Router<I, E, X>, app: AppId, entry: AppMetadataEntry) -> Result<ImageStatus>
where
    I: NorFlash,
    E: NorFlash,
    X: SpiNorBus,
{
    if entry.is_empty() {
        debug!("app {} has no image", app.0);
        return Ok(ImageStatus::Invalid);
    }
    let start = router.translate(entry.start, app);
    let total = entry.length.checked_add(IMAGE_FOOTER_SIZE).ok_or(Error::Address)?;
    let region = router.regions().classify_range(start, total)?;

    let external = region.kind == RegionKind::ExternalXip;
    let previous = router.external_mode();
    if external {
        router.set_external_mode(Mode::MemoryMapped)?;
    }
    let result = checksum_range(router, start, entry.length);
    if external {
        router.set_external_mode(previous)?;
    }
    let (computed, stored) = result?;

    if computed == stored {
        info!("app {} valid, checksum {:#x}", app.0, computed);
        Ok(ImageStatus::Valid)
    } else {
        warn!("app {} invalid: computed {:#x}, footer {:#x}", app.0, computed, stored);
        Ok(ImageStatus::Invalid)
    }
}

fn checksum_range<I, E, X>(router: &mut Router<I, E, X>, start: u32, len: u32) -> Result<(u32, u32)>
where
    I: NorFlash,
    E: NorFlash,
    X: SpiNorBus,
{
    let mut digest = IMAGE_CRC.digest();
    let mut buf = [0u8; READ_CHUNK];
    let mut at = start;
    let end = start + len;
    while at < end {
        let n = core::cmp::min(READ_CHUNK as u32, end - at) as usize;
        router.read(at, &mut buf[..n])?;
        digest.update(&buf[..n]);
        at += n as u32;
    }

    let mut footer = [0u8; IMAGE_FOOTER_SIZE as usize];
    router.read(end, &mut footer)?;
    Ok((digest.finalize(), u32::from_le_bytes(footer)))
}
