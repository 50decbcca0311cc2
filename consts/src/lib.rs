// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Platform constants shared by the bootloader core, the host protocol and the board binary.
//!
//! Internal flash map (nRF52840, 4 KiB pages):
//!
//! ```text
//! 0x0000_0000 - 0x0000_1000  MBR
//! 0x0000_1000 - 0x0002_7000  SoftDevice
//! 0x0002_7000 - 0x000C_0000  Application (execution slot, app 1)
//! 0x000C_0000 - 0x000D_8000  Golden image (app 3)
//! 0x000D_8000 - 0x000F_6000  Bootloader (launcher, app 0)
//! 0x000F_6000 - 0x000F_7000  Metadata row (MD)
//! 0x000F_7000 - 0x000F_8000  Metadata mirror row (MDC)
//! 0x000F_8000 - 0x0010_0000  Emulated EEPROM
//! ```
//!
//! External QSPI NOR is mapped at `0x1200_0000` and holds the staged image (app 2).

#![no_std]

/// Identifier the host must present in `EnterBootloader`.
pub const PRODUCT_ID: u32 = 0x5052_4D45;

/// Internal flash erase/program row.
pub const FLASH_ROW_SIZE: u32 = 4096;

/// Largest row of any region, sizes every row buffer.
pub const MAX_ROW_SIZE: usize = 4096;

/// Number of application slots described by the metadata row.
pub const METADATA_APP_COUNT: usize = 5;

/// Size of the checksum footer stored right after every image.
pub const IMAGE_FOOTER_SIZE: u32 = 4;

pub const INTERNAL_FLASH_START: u32 = 0x0000_0000;
pub const INTERNAL_FLASH_END: u32 = 0x000F_8000;

pub const EEPROM_START: u32 = 0x000F_8000;
pub const EEPROM_END: u32 = 0x0010_0000;
pub const EEPROM_ROW_SIZE: u32 = 4096;

/// Memory-mapped window of the external QSPI NOR.
pub const XIP_START: u32 = 0x1200_0000;
pub const XIP_SIZE: u32 = 0x0080_0000;
pub const XIP_END: u32 = XIP_START + XIP_SIZE;
pub const EXTERNAL_ROW_SIZE: u32 = 4096;
pub const EXTERNAL_PAGE_SIZE: u32 = 256;
pub const EXTERNAL_SECTOR_SIZE: u32 = 4096;

/// Status polls allowed for one external program/erase before giving up.
pub const EXTERNAL_MAX_POLLS: u32 = 2_000_000;

pub const BASE_APP_ADDR: u32 = 0x0002_7000;
pub const APP_SIZE: u32 = 0x0009_9000;

pub const BASE_GOLDEN_ADDR: u32 = 0x000C_0000;
pub const GOLDEN_SIZE: u32 = 0x0001_8000;

pub const BASE_BOOTLOADER_ADDR: u32 = 0x000D_8000;
pub const BOOTLOADER_SIZE: u32 = 0x0001_E000;

pub const METADATA_ADDR: u32 = 0x000F_6000;
pub const METADATA_COPY_ADDR: u32 = METADATA_ADDR + FLASH_ROW_SIZE;

/// Application ids, indexes into the metadata row.
pub const APP_ID_LAUNCHER: u8 = 0;
pub const APP_ID_APPLICATION: u8 = 1;
pub const APP_ID_STAGING: u8 = 2;
pub const APP_ID_GOLDEN: u8 = 3;

/// Main-loop tick period.
pub const TICK_MS: u32 = 100;

/// A started session with no command for this long is abandoned.
pub const SESSION_IDLE_TIMEOUT_MS: u32 = 30_000;

/// How long the bootloader stays discoverable waiting for a session.
pub const DISCOVERY_WINDOW_MS: u32 = 300_000;

/// Button hold time requesting a manual application switch-over.
pub const BUTTON_HOLD_MS: u32 = 2_000;

/// Consecutive failing commands tolerated before the session is reset.
pub const MAX_CONSECUTIVE_FAILURES: u8 = 8;
