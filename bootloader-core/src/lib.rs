// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-field update manager.
//!
//! The bootloader keeps a redundant directory of application images, validates images by
//! checksum before executing them, routes reads and writes to internal flash, emulated EEPROM
//! or external NOR flash, relocates verified staged images into the execution slot and drives
//! all of it from a tick-governed state machine.
//!
//! Nothing in here touches hardware directly: internal flash and EEPROM are
//! [`embedded_storage::nor_flash::NorFlash`] implementations, external flash is reached through
//! [`extflash::SpiNorBus`] and the host link through [`transport::Transport`].

#![no_std]

#[cfg(test)]
extern crate std;

pub mod bootloader;
pub mod config;
pub mod copy;
pub mod error;
pub mod extflash;
pub mod metadata;
pub mod region;
pub mod router;
pub mod session;
pub mod transport;
pub mod validate;

#[cfg(test)]
mod tests;

pub use bootloader::{Action, Bootloader, Inputs};
pub use config::{AppId, BootloaderConfig, Remap};
pub use error::{Error, Result};
pub use extflash::{ExternalFlash, Mode, NorGeometry, SpiNorBus};
pub use metadata::{AppMetadataEntry, MetadataManager};
pub use region::{MemoryRegion, RegionKind};
pub use router::{Operation, Router};
pub use session::{SessionState, TransferSession};
pub use transport::{Transport, TransportError};
pub use validate::ImageStatus;

#[cfg(feature = "defmt")]
pub(crate) use defmt as log;

#[cfg(all(feature = "log", not(feature = "defmt")))]
pub(crate) use logger_crate as log;

#[cfg(not(any(feature = "log", feature = "defmt")))]
pub(crate) mod log {
    macro_rules! trace {
        ( $( $x:expr ),* $(,)? ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use trace;
    macro_rules! debug {
        ( $( $x:expr ),* $(,)? ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use debug;
    macro_rules! info {
        ( $( $x:expr ),* $(,)? ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use info;
    macro_rules! warner {
        ( $( $x:expr ),* $(,)? ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use warner as warn;
    macro_rules! error {
        ( $( $x:expr ),* $(,)? ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use error;
}
