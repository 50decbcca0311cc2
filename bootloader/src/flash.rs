// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Internal flash and the emulated EEPROM both sit behind the one NVMC. Each is handed to the
//! router as its own [`Partition`] sharing the controller through a blocking mutex.

use core::cell::RefCell;
use embassy_nrf::nvmc::{self, Nvmc, PAGE_SIZE};
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash};

pub type SharedNvmc = Mutex<ThreadModeRawMutex, RefCell<Nvmc<'static>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum PartitionError {
    OutOfBounds,
    Unaligned,
    Nvmc,
}

impl NorFlashError for PartitionError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            PartitionError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            PartitionError::Unaligned => NorFlashErrorKind::NotAligned,
            PartitionError::Nvmc => NorFlashErrorKind::Other,
        }
    }
}

impl From<nvmc::Error> for PartitionError {
    fn from(err: nvmc::Error) -> Self {
        match err {
            nvmc::Error::OutOfBounds => PartitionError::OutOfBounds,
            nvmc::Error::Unaligned => PartitionError::Unaligned,
        }
    }
}

/// Window `[start, end)` of the NVMC address space. Offsets are relative to `start`.
pub struct Partition<'a> {
    start: u32,
    end: u32,
    nvmc: &'a SharedNvmc,
}

impl<'a> Partition<'a> {
    pub fn new(nvmc: &'a SharedNvmc, (start, end): (u32, u32)) -> Self {
        Self { start, end, nvmc }
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.end - self.start
    }

    fn absolute(&self, offset: u32, len: usize) -> Result<u32, PartitionError> {
        match offset.checked_add(len as u32) {
            Some(end) if end <= self.size() => Ok(self.start + offset),
            _ => Err(PartitionError::OutOfBounds),
        }
    }
}

impl ErrorType for Partition<'_> {
    type Error = PartitionError;
}

impl ReadNorFlash for Partition<'_> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let address = self.absolute(offset, bytes.len())?;
        self.nvmc
            .lock(|nvmc| nvmc.borrow_mut().read(address, bytes))
            .map_err(PartitionError::from)
    }

    fn capacity(&self) -> usize {
        self.size() as usize
    }
}

impl NorFlash for Partition<'_> {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = PAGE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if to < from {
            return Err(PartitionError::OutOfBounds);
        }
        let start = self.absolute(from, (to - from) as usize)?;
        let end = start + (to - from);
        defmt::debug!("nvmc erase {:#x}..{:#x}", start, end);
        self.nvmc
            .lock(|nvmc| nvmc.borrow_mut().erase(start, end))
            .map_err(PartitionError::from)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let address = self.absolute(offset, bytes.len())?;
        self.nvmc
            .lock(|nvmc| nvmc.borrow_mut().write(address, bytes))
            .map_err(PartitionError::from)
    }
}
