// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Board wiring and the UICR words the bootloader owns.

use consts::BASE_BOOTLOADER_ADDR;

#[used]
/// Start address of the bootloader, read by the MBR at every reset (UICR NRFFW[0]).
#[link_section = ".mbr_uicr_bootloader_addr"]
pub static BOOTLOADER_ADDR: u32 = BASE_BOOTLOADER_ADDR;

#[cfg(feature = "no-dbg-access")]
#[used]
#[link_section = ".uicr_approtect"]
pub static APP_PROTECTION: u32 = 0xFFFF_FF00;

/// Where the SoftDevice expects the application vector table once the MBR hands over.
pub const SOFTDEVICE_BASE: u32 = 0x1000;

/// Internal flash behind the router, relative to the NVMC.
pub const INTERNAL_PARTITION: (u32, u32) = (consts::INTERNAL_FLASH_START, consts::INTERNAL_FLASH_END);

/// Emulated EEPROM pages at the top of the NVMC.
pub const EEPROM_PARTITION: (u32, u32) = (consts::EEPROM_START, consts::EEPROM_END);

/// Size of the byte pipes between the UART tasks and the state machine.
pub const UART_PIPE_SIZE: usize = 1024;

/// Word written to the QSPI status register to enable quad I/O.
pub const QSPI_STATUS_QE: u8 = 0x40;
