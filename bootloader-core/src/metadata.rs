// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Redundant application directory.
//!
//! Row layout, little-endian:
//!
//! ```text
//! [start:4][length:4]   app 0
//! [start:4][length:4]   app 1
//! ...
//! [padding]
//! [crc32c:4]            covers every preceding byte of the row
//! ```
//!
//! The primary row (MD) is the row of record, the mirror row (MDC) follows it and is kept
//! byte-identical. Every update writes MD first and then mirrors it, so losing power during
//! any single row write leaves one of the two rows valid.

use crate::config::{AppId, BootloaderConfig};
use crate::copy::{copy_row, RowSource};
use crate::error::{Error, Result};
use crate::extflash::SpiNorBus;
use crate::log::{error, info, warn};
use crate::router::Router;
use consts::{IMAGE_FOOTER_SIZE, MAX_ROW_SIZE, METADATA_APP_COUNT};
use core::ops::Range;
use crc::{Crc, CRC_32_ISCSI};
use embedded_storage::nor_flash::NorFlash;

pub const ENTRY_SIZE: usize = 8;
pub const CHECKSUM_SIZE: usize = 4;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Where an application lives and how long it is, footer excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppMetadataEntry {
    pub start: u32,
    pub length: u32,
}

impl AppMetadataEntry {
    pub const fn new(start: u32, length: u32) -> Self {
        Self { start, length }
    }

    /// Slot never written or erased.
    pub fn is_empty(&self) -> bool {
        self.length == 0 || self.length == u32::MAX
    }

    pub fn footer_address(&self) -> u32 {
        self.start + self.length
    }

    /// Image bytes plus footer.
    pub fn span(&self) -> Range<u32> {
        self.start..self.start.saturating_add(self.length).saturating_add(IMAGE_FOOTER_SIZE)
    }
}

/// Checksum of a metadata row, computed over everything but its last four bytes.
pub fn row_checksum(row: &[u8]) -> u32 {
    CRC32C.checksum(&row[..row.len() - CHECKSUM_SIZE])
}

pub fn row_is_valid(row: &[u8]) -> bool {
    let stored = &row[row.len() - CHECKSUM_SIZE..];
    u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]) == row_checksum(row)
}

/// Stores the checksum in the last four bytes of the row.
pub fn seal_row(row: &mut [u8]) {
    let crc = row_checksum(row);
    let at = row.len() - CHECKSUM_SIZE;
    row[at..].copy_from_slice(&crc.to_le_bytes());
}

pub fn decode_entry(row: &[u8], app: AppId) -> AppMetadataEntry {
    let at = app.index() * ENTRY_SIZE;
    let word = |i: usize| u32::from_le_bytes([row[i], row[i + 1], row[i + 2], row[i + 3]]);
    AppMetadataEntry::new(word(at), word(at + 4))
}

pub fn encode_entry(row: &mut [u8], app: AppId, entry: AppMetadataEntry) {
    let at = app.index() * ENTRY_SIZE;
    row[at..at + 4].copy_from_slice(&entry.start.to_le_bytes());
    row[at + 4..at + 8].copy_from_slice(&entry.length.to_le_bytes());
}

/// What [`MetadataManager::ensure_consistent`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Repair {
    /// MD valid, MDC already identical
    None,
    /// MD valid, MDC rewritten from it
    MirrorRestored,
    /// MD invalid, rewritten from MDC
    PrimaryRestored,
    /// Both invalid, a minimal directory was synthesized
    Rebuilt,
}

pub struct MetadataManager {
    primary: u32,
    mirror: u32,
    row_size: u32,
    writable: bool,
    launcher: AppId,
    launcher_entry: AppMetadataEntry,
    entries: [AppMetadataEntry; METADATA_APP_COUNT],
}

impl MetadataManager {
    pub fn new(config: &BootloaderConfig) -> Self {
        let row_size = config.regions.internal.row_size;
        debug_assert!(row_size as usize <= MAX_ROW_SIZE);
        debug_assert!(METADATA_APP_COUNT * ENTRY_SIZE + CHECKSUM_SIZE <= row_size as usize);
        Self {
            primary: config.metadata_address,
            mirror: config.metadata_copy_address(),
            row_size,
            writable: config.metadata_writable,
            launcher: config.running_app,
            launcher_entry: config.launcher_entry,
            entries: [AppMetadataEntry::default(); METADATA_APP_COUNT],
        }
    }

    /// MD and MDC addresses.
    pub fn rows(&self) -> Range<u32> {
        self.primary..self.mirror + self.row_size
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Brings MD and MDC back to two valid, identical rows.
    ///
    /// Fails with [`Error::Verify`] when neither row is valid and the directory may not be
    /// rebuilt: no image location can be trusted after that.
    pub fn ensure_consistent<I, E, X>(&mut self, router: &mut Router<I, E, X>) -> Result<Repair>
    where
        I: NorFlash,
        E: NorFlash,
        X: SpiNorBus,
    {
        let row_size = self.row_size as usize;
        let mut row = [0u8; MAX_ROW_SIZE];
        let row = &mut row[..row_size];

        router.read(self.primary, row)?;
        let repair = if row_is_valid(row) {
            if copy_row(router, self.mirror, RowSource::Buffer(row), self.row_size)? {
                warn!("metadata mirror restored from primary");
                Repair::MirrorRestored
            } else {
                Repair::None
            }
        } else {
            router.read(self.mirror, row)?;
            if row_is_valid(row) {
                warn!("metadata primary restored from mirror");
                copy_row(router, self.primary, RowSource::Buffer(row), self.row_size)?;
                Repair::PrimaryRestored
            } else if self.writable {
                warn!("both metadata rows invalid, rebuilding directory");
                row.fill(0);
                encode_entry(row, self.launcher, self.launcher_entry);
                seal_row(row);
                router.write_rows(self.primary, row)?;
                copy_row(router, self.mirror, RowSource::Buffer(row), self.row_size)?;
                Repair::Rebuilt
            } else {
                error!("both metadata rows invalid and metadata is read-only");
                return Err(Error::Verify);
            }
        };

        self.load(row);
        info!("metadata consistent ({:?})", repair);
        Ok(repair)
    }

    pub fn entry(&self, app: AppId) -> Result<AppMetadataEntry> {
        self.entries.get(app.index()).copied().ok_or(Error::Address)
    }

    /// Rewrites one directory entry: MD first, then the mirror.
    pub fn set_entry<I, E, X>(
        &mut self,
        router: &mut Router<I, E, X>,
        app: AppId,
        entry: AppMetadataEntry,
    ) -> Result<()>
    where
        I: NorFlash,
        E: NorFlash,
        X: SpiNorBus,
    {
        if app.index() >= METADATA_APP_COUNT {
            return Err(Error::Address);
        }
        let mut row = [0u8; MAX_ROW_SIZE];
        let row = &mut row[..self.row_size as usize];
        router.read(self.primary, row)?;
        encode_entry(row, app, entry);
        seal_row(row);

        router.write_rows(self.primary, row)?;
        copy_row(router, self.mirror, RowSource::Buffer(row), self.row_size)?;
        self.entries[app.index()] = entry;
        info!(
            "app {} metadata set to {:#x} + {:#x}",
            app.0, entry.start, entry.length
        );
        Ok(())
    }

    fn load(&mut self, row: &[u8]) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            *entry = decode_entry(row, AppId(i as u8));
        }
    }
}
