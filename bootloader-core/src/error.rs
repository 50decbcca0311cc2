// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use embedded_storage::nor_flash::NorFlashErrorKind;
use host_protocol::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Failure of a core operation. Success is `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Size is not a multiple of the destination row
    Length,
    /// Out of range, misaligned, or inside a protected image
    Address,
    /// Driver I/O, packet checksum or comparison failure
    Data,
    /// Checksum mismatch
    Verify,
    /// Hardware or session made no progress within its budget
    Timeout,
    /// Command not acceptable in the current state
    Unknown,
}

impl From<NorFlashErrorKind> for Error {
    fn from(kind: NorFlashErrorKind) -> Self {
        match kind {
            NorFlashErrorKind::NotAligned | NorFlashErrorKind::OutOfBounds => Error::Address,
            _ => Error::Data,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Length => Status::ErrorLength,
            Error::Address => Status::ErrorAddress,
            Error::Data => Status::ErrorData,
            Error::Verify => Status::ErrorVerify,
            Error::Timeout => Status::ErrorTimeout,
            Error::Unknown => Status::ErrorUnknown,
        }
    }
}

/// Maps a command result onto the wire status.
pub fn status_of(result: Result<()>) -> Status {
    match result {
        Ok(()) => Status::Success,
        Err(e) => e.into(),
    }
}
