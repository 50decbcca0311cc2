// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Static description of the memories the bootloader can reach.

use crate::error::{Error, Result};
use core::ops::Range;

/// Memory technology behind an address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegionKind {
    InternalFlash,
    EmulatedEeprom,
    ExternalXip,
}

/// `[start, end)` of one memory technology and its row size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemoryRegion {
    pub kind: RegionKind,
    pub start: u32,
    pub end: u32,
    /// Minimum erase/program unit, every write is a multiple of it
    pub row_size: u32,
}

impl MemoryRegion {
    pub const fn new(kind: RegionKind, start: u32, end: u32, row_size: u32) -> Self {
        Self {
            kind,
            start,
            end,
            row_size,
        }
    }

    #[inline]
    pub fn contains(&self, address: u32) -> bool {
        (self.start..self.end).contains(&address)
    }

    /// True when `[address, address + len)` lies entirely in the region.
    pub fn contains_range(&self, address: u32, len: u32) -> bool {
        match address.checked_add(len) {
            Some(end) => self.contains(address) && end <= self.end,
            None => false,
        }
    }

    /// Offset of `address` from the region start, as seen by the backing device.
    #[inline]
    pub fn offset(&self, address: u32) -> u32 {
        address - self.start
    }

    #[inline]
    pub fn is_row_aligned(&self, address: u32) -> bool {
        (address - self.start) % self.row_size == 0
    }
}

/// The three regions of the platform, one per [`RegionKind`].
#[derive(Debug, Clone, Copy)]
pub struct RegionTable {
    pub internal: MemoryRegion,
    pub eeprom: MemoryRegion,
    pub external: MemoryRegion,
}

impl RegionTable {
    pub fn classify(&self, address: u32) -> Result<MemoryRegion> {
        [self.internal, self.eeprom, self.external]
            .into_iter()
            .find(|r| r.contains(address))
            .ok_or(Error::Address)
    }

    /// Classifies a whole range, which must not straddle two regions.
    pub fn classify_range(&self, address: u32, len: u32) -> Result<MemoryRegion> {
        let region = self.classify(address)?;
        if region.contains_range(address, len) {
            Ok(region)
        } else {
            Err(Error::Address)
        }
    }
}

/// True when the two half-open ranges share at least one address.
#[inline]
pub(crate) fn overlaps(a: &Range<u32>, b: &Range<u32>) -> bool {
    a.start < b.end && b.start < a.end
}
