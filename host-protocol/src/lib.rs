// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host to bootloader update protocol.
//! The host (phone or MPU) drives an in-field update of the nRF52x over a byte pipe.
//! Every message is serialized with `postcard` and framed with COBS.

#![no_std]
use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests;

/// Maximum supported message size to be serialized or deserialized by `postcard`.
/// Messages larger than this will be rejected.
pub const COBS_MAX_MSG_SIZE: usize = 512;

/// Largest payload returned by a single `ReadData`.
pub const READ_CHUNK: usize = 256;

/// Outcome of a bootloader command, sent back for every request.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    Success,
    /// Size is not a multiple of the destination write granularity
    ErrorLength,
    /// Address out of range or inside a protected image
    ErrorAddress,
    /// I/O, packet checksum or comparison failure
    ErrorData,
    /// Image or data verification mismatch
    ErrorVerify,
    /// No data within the session budget
    ErrorTimeout,
    /// Command not allowed in the current state
    ErrorUnknown,
}

/// Bootloader-specific messages for firmware updates and verification.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum Bootloader<'a> {
    /// Open an update session for application `app_id`
    EnterBootloader { product_id: u32, app_id: u8 },
    /// Session opened
    AckEnterBootloader { product_id: u32, version: &'a str },
    /// Drop any partially assembled request
    Sync,
    /// Append bytes to the request being assembled
    SendData { data: &'a [u8] },
    /// Program buffered bytes plus `data` at `address`, `crc` covers the whole request
    ProgramData { address: u32, crc: u32, data: &'a [u8] },
    /// Erase the row at `address`
    EraseData { address: u32 },
    /// Compare buffered bytes plus `data` with the media at `address`
    VerifyData { address: u32, crc: u32, data: &'a [u8] },
    /// Read `length` bytes at `address`
    ReadData { address: u32, length: u16 },
    /// Bytes read
    AckReadData { data: &'a [u8] },
    /// Check the image checksum of an application
    VerifyApplication { app_id: u8 },
    /// Result of application verification
    AckVerifyApplication { app_id: u8, valid: bool },
    /// Rewrite the directory entry of an application
    SetApplicationMetadata { app_id: u8, start: u32, length: u32 },
    /// Request the directory entry of an application
    GetMetadata { app_id: u8 },
    /// Directory entry of an application
    AckMetadata { app_id: u8, start: u32, length: u32 },
    /// Transfer complete, validate and boot the received image
    ExitBootloader,
    /// Request bootloader version
    BootloaderVersion,
    /// Response with bootloader version string
    AckBootloaderVersion { version: &'a str },
    /// Command result
    Status(Status),
}

/// Current state of the update session
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Waiting for a host to start a session
    Idle,
    /// Multi-packet transfer underway
    Bootloading,
    /// Transfer complete, image being validated
    Finished,
}

/// Top-level message types for host-target communication
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum HostProtocolMessage<'a> {
    /// Bootloader and firmware update messages
    Bootloader(#[serde(borrow)] Bootloader<'a>),
    /// Abandon the current session
    Reset,
    /// Query current session state
    GetState,
    /// Response with current state
    AckState(State),
}
