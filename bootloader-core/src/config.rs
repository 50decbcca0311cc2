// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Run-time description of the platform and of the update policy.

use crate::metadata::AppMetadataEntry;
use crate::region::{MemoryRegion, RegionKind, RegionTable};
use consts::*;
use core::ops::Range;
use heapless::Vec;

/// Index of an application slot in the metadata row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AppId(pub u8);

impl AppId {
    pub const LAUNCHER: AppId = AppId(APP_ID_LAUNCHER);
    pub const APPLICATION: AppId = AppId(APP_ID_APPLICATION);
    pub const STAGING: AppId = AppId(APP_ID_STAGING);
    pub const GOLDEN: AppId = AppId(APP_ID_GOLDEN);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Address indirection of a virtual application.
///
/// Addresses of `app` inside `logical_start..logical_start + len` are stored in
/// `physical_start..`. Used for images that are linked for the execution slot but
/// staged somewhere else until they are relocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Remap {
    pub app: AppId,
    pub logical_start: u32,
    pub physical_start: u32,
    pub len: u32,
}

impl Remap {
    pub fn translate(&self, app: AppId, address: u32) -> Option<u32> {
        if app != self.app {
            return None;
        }
        let offset = address.checked_sub(self.logical_start)?;
        (offset < self.len).then(|| self.physical_start + offset)
    }
}

pub const MAX_REMAPS: usize = 4;
pub const MAX_GOLDEN: usize = 2;
pub const MAX_RESERVED: usize = 2;

#[derive(Debug, Clone)]
pub struct BootloaderConfig {
    /// Identifier the host must present to open a session
    pub product_id: u32,
    pub regions: RegionTable,
    /// Ranges inside the regions that belong to neither the bootloader nor an application
    /// (MBR, SoftDevice). Always protected.
    pub reserved: Vec<Range<u32>, MAX_RESERVED>,
    pub remaps: Vec<Remap, MAX_REMAPS>,
    /// Address of the metadata row, the mirror row follows it
    pub metadata_address: u32,
    /// Allows rewriting metadata from the host and synthesizing it when both rows are lost
    pub metadata_writable: bool,
    /// Directory entry of the always-resident launcher, used when metadata is rebuilt
    pub launcher_entry: AppMetadataEntry,
    /// Application currently executing (the bootloader itself)
    pub running_app: AppId,
    /// Execution slot
    pub app: AppId,
    /// Image relocated into `app` once it validates
    pub staging: Option<AppId>,
    /// Never-overwritten fallbacks, tried in this order
    pub golden: Vec<AppId, MAX_GOLDEN>,
    /// Ticks without a command before a started session is abandoned
    pub idle_timeout_ticks: u32,
    /// Ticks the bootloader waits for any session before giving up
    pub discovery_window_ticks: u32,
    /// Consecutive pressed ticks that request a manual switch-over
    pub button_hold_ticks: u32,
    /// Consecutive failing commands before the session is abandoned
    pub max_consecutive_failures: u8,
    /// Budget handed to `Transport::read` once per main-loop iteration
    pub transport_timeout_ms: u32,
}

impl BootloaderConfig {
    /// Configuration of the nRF52840 board.
    pub fn platform() -> Self {
        let mut remaps = Vec::new();
        // The staged image is linked for the execution slot and lives in external flash.
        let _ = remaps.push(Remap {
            app: AppId::STAGING,
            logical_start: BASE_APP_ADDR,
            physical_start: XIP_START,
            len: APP_SIZE,
        });
        let mut reserved = Vec::new();
        // MBR and SoftDevice
        let _ = reserved.push(INTERNAL_FLASH_START..BASE_APP_ADDR);
        let mut golden = Vec::new();
        if cfg!(feature = "golden-image") {
            let _ = golden.push(AppId::GOLDEN);
        }

        Self {
            product_id: PRODUCT_ID,
            regions: RegionTable {
                internal: MemoryRegion::new(
                    RegionKind::InternalFlash,
                    INTERNAL_FLASH_START,
                    INTERNAL_FLASH_END,
                    FLASH_ROW_SIZE,
                ),
                eeprom: MemoryRegion::new(RegionKind::EmulatedEeprom, EEPROM_START, EEPROM_END, EEPROM_ROW_SIZE),
                external: MemoryRegion::new(RegionKind::ExternalXip, XIP_START, XIP_END, EXTERNAL_ROW_SIZE),
            },
            reserved,
            remaps,
            metadata_address: METADATA_ADDR,
            metadata_writable: true,
            launcher_entry: AppMetadataEntry::new(BASE_BOOTLOADER_ADDR, BOOTLOADER_SIZE - IMAGE_FOOTER_SIZE),
            running_app: AppId::LAUNCHER,
            app: AppId::APPLICATION,
            staging: Some(AppId::STAGING),
            golden,
            idle_timeout_ticks: SESSION_IDLE_TIMEOUT_MS / TICK_MS,
            discovery_window_ticks: DISCOVERY_WINDOW_MS / TICK_MS,
            button_hold_ticks: BUTTON_HOLD_MS / TICK_MS,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            transport_timeout_ms: 0,
        }
    }

    pub fn is_golden(&self, app: AppId) -> bool {
        self.golden.contains(&app)
    }

    pub fn metadata_copy_address(&self) -> u32 {
        self.metadata_address + self.regions.internal.row_size
    }
}
