// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Routes every access to internal flash, emulated EEPROM or external flash.
//!
//! Requests coming from the host go through [`Router::check`] first: bounds, row granularity
//! and the protected ranges (reserved ranges, running image, golden images, metadata rows). Internal callers
//! (metadata repair, relocation) use the row primitives directly.

use crate::config::{AppId, Remap, MAX_REMAPS};
use crate::error::{Error, Result};
use crate::extflash::{ExternalFlash, Mode, SpiNorBus};
use crate::log::{debug, warn};
use crate::region::{overlaps, MemoryRegion, RegionKind, RegionTable};
use core::ops::Range;
use embedded_storage::nor_flash::{NorFlash, NorFlashError};
use heapless::Vec;

pub const MAX_PROTECTED: usize = 8;

/// What a host request wants to do with an address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Operation {
    Read,
    Program,
    Erase,
    Compare,
}

pub struct Router<I, E, X> {
    internal: I,
    eeprom: E,
    external: ExternalFlash<X>,
    regions: RegionTable,
    remaps: Vec<Remap, MAX_REMAPS>,
    protected: Vec<Range<u32>, MAX_PROTECTED>,
}

impl<I, E, X> Router<I, E, X>
where
    I: NorFlash,
    E: NorFlash,
    X: SpiNorBus,
{
    pub fn new(
        internal: I,
        eeprom: E,
        external: ExternalFlash<X>,
        regions: RegionTable,
        remaps: Vec<Remap, MAX_REMAPS>,
    ) -> Self {
        Self {
            internal,
            eeprom,
            external,
            regions,
            remaps,
            protected: Vec::new(),
        }
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub fn classify(&self, address: u32) -> Result<MemoryRegion> {
        self.regions.classify(address)
    }

    /// Physical address of `address` as written for `app`.
    pub fn translate(&self, address: u32, app: AppId) -> u32 {
        self.remaps
            .iter()
            .find_map(|r| r.translate(app, address))
            .unwrap_or(address)
    }

    /// Replaces the set of ranges no host request may write.
    pub fn set_protected(&mut self, ranges: &[Range<u32>]) {
        self.protected.clear();
        for range in ranges {
            if self.protected.push(range.clone()).is_err() {
                warn!("protection table full, dropping {:#x}", range.start);
            }
        }
    }

    pub fn protected(&self) -> &[Range<u32>] {
        &self.protected
    }

    pub fn is_protected(&self, range: &Range<u32>) -> bool {
        self.protected.iter().any(|p| overlaps(p, range))
    }

    /// Validates a host request against bounds, granularity and protection.
    ///
    /// Every operation is refused inside a protected range. Anything but a read must be
    /// whole rows, except a zero-length erase which targets the row at `address`.
    pub fn check(&self, address: u32, len: u32, op: Operation) -> Result<MemoryRegion> {
        let region = self.classify(address)?;

        let len = if op == Operation::Read {
            if !region.contains_range(address, len) {
                return Err(Error::Address);
            }
            len.max(1)
        } else if op == Operation::Erase && len == 0 {
            region.row_size
        } else {
            if len == 0 || len % region.row_size != 0 {
                debug!("{:?} of {} bytes rejected: row is {}", op, len, region.row_size);
                return Err(Error::Length);
            }
            len
        };

        if op != Operation::Read && (!region.is_row_aligned(address) || !region.contains_range(address, len)) {
            return Err(Error::Address);
        }
        if self.is_protected(&(address..address + len)) {
            warn!("{:?} at {:#x} hits a protected image", op, address);
            return Err(Error::Address);
        }
        Ok(region)
    }

    /// Reads from any region, the range may not straddle two regions.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let region = self.regions.classify_range(address, buf.len() as u32)?;
        let offset = region.offset(address);
        match region.kind {
            RegionKind::InternalFlash => self.internal.read(offset, buf).map_err(|e| e.kind().into()),
            RegionKind::EmulatedEeprom => self.eeprom.read(offset, buf).map_err(|e| e.kind().into()),
            RegionKind::ExternalXip => self.external.read_bytes(offset, buf),
        }
    }

    /// Erases and programs whole rows starting at `address`.
    ///
    /// On external flash, rows are smaller than a sector: the sector is erased when
    /// the write reaches its first row.
    pub fn write_rows(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let region = self.classify(address)?;
        let row = region.row_size;
        if data.is_empty() || data.len() as u32 % row != 0 {
            return Err(Error::Length);
        }
        if !region.is_row_aligned(address) || !region.contains_range(address, data.len() as u32) {
            return Err(Error::Address);
        }

        for (i, chunk) in data.chunks(row as usize).enumerate() {
            let offset = region.offset(address) + i as u32 * row;
            match region.kind {
                RegionKind::InternalFlash => {
                    rewrite_row(&mut self.internal, offset, chunk)?;
                }
                RegionKind::EmulatedEeprom => {
                    rewrite_row(&mut self.eeprom, offset, chunk)?;
                }
                RegionKind::ExternalXip => {
                    if offset % self.external.geometry().sector_size == 0 {
                        self.external.erase_sector(offset)?;
                    }
                    self.external.program(offset, chunk)?;
                }
            }
        }
        Ok(())
    }

    /// Erases `len` bytes of rows at `address`, `len == 0` erases one row.
    pub fn erase(&mut self, address: u32, len: u32) -> Result<()> {
        let region = self.classify(address)?;
        let len = if len == 0 { region.row_size } else { len };
        if len % region.row_size != 0 {
            return Err(Error::Length);
        }
        if !region.is_row_aligned(address) || !region.contains_range(address, len) {
            return Err(Error::Address);
        }

        let from = region.offset(address);
        match region.kind {
            RegionKind::InternalFlash => self.internal.erase(from, from + len).map_err(|e| e.kind().into()),
            RegionKind::EmulatedEeprom => self.eeprom.erase(from, from + len).map_err(|e| e.kind().into()),
            RegionKind::ExternalXip => {
                let sector = self.external.geometry().sector_size;
                let mut at = from - from % sector;
                while at < from + len {
                    self.external.erase_sector(at)?;
                    at += sector;
                }
                Ok(())
            }
        }
    }

    pub fn external_mode(&self) -> Mode {
        self.external.mode()
    }

    pub fn set_external_mode(&mut self, mode: Mode) -> Result<()> {
        self.external.set_mode(mode)
    }

    pub fn internal(&self) -> &I {
        &self.internal
    }

    pub fn eeprom(&self) -> &E {
        &self.eeprom
    }

    pub fn external(&self) -> &ExternalFlash<X> {
        &self.external
    }
}

fn rewrite_row<F: NorFlash>(flash: &mut F, offset: u32, data: &[u8]) -> Result<()> {
    flash
        .erase(offset, offset + data.len() as u32)
        .map_err(|e| Error::from(e.kind()))?;
    flash.write(offset, data).map_err(|e| Error::from(e.kind()))
}
