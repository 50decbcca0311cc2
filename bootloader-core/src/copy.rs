// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Row-granular compare-then-write, for metadata mirroring and image relocation.

use crate::config::AppId;
use crate::error::{Error, Result};
use crate::extflash::{Mode, SpiNorBus};
use crate::log::{debug, info, warn};
use crate::metadata::{AppMetadataEntry, MetadataManager};
use crate::region::RegionKind;
use crate::router::{Operation, Router};
use consts::{IMAGE_FOOTER_SIZE, MAX_ROW_SIZE};
use embedded_storage::nor_flash::NorFlash;

const COMPARE_CHUNK: usize = 256;

/// Where the bytes of a row come from.
#[derive(Debug, Clone, Copy)]
pub enum RowSource<'a> {
    /// A row readable through the router
    Address(u32),
    /// A row already in RAM
    Buffer(&'a [u8]),
}

/// Writes one row at `dest` unless it already holds the source bytes.
///
/// Returns whether a write happened. The written row is read back and compared.
pub fn copy_row<I, E, X>(router: &mut Router<I, E, X>, dest: u32, src: RowSource<'_>, row_size: u32) -> Result<bool>
where
    I: NorFlash,
    E: NorFlash,
    X: SpiNorBus,
{
    let row_size = row_size as usize;
    if row_size > MAX_ROW_SIZE {
        return Err(Error::Length);
    }
    let mut staged = [0u8; MAX_ROW_SIZE];
    let data: &[u8] = match src {
        RowSource::Buffer(buf) if buf.len() == row_size => buf,
        RowSource::Buffer(_) => return Err(Error::Length),
        RowSource::Address(address) => {
            router.read(address, &mut staged[..row_size])?;
            &staged[..row_size]
        }
    };

    if row_matches(router, dest, data)? {
        return Ok(false);
    }
    router.write_rows(dest, data)?;
    if !row_matches(router, dest, data)? {
        warn!("row at {:#x} differs after write", dest);
        return Err(Error::Data);
    }
    Ok(true)
}

fn row_matches<I, E, X>(router: &mut Router<I, E, X>, dest: u32, expected: &[u8]) -> Result<bool>
where
    I: NorFlash,
    E: NorFlash,
    X: SpiNorBus,
{
    let mut chunk = [0u8; COMPARE_CHUNK];
    let mut at = dest;
    for part in expected.chunks(COMPARE_CHUNK) {
        let buf = &mut chunk[..part.len()];
        router.read(at, buf)?;
        if buf != part {
            return Ok(false);
        }
        at += part.len() as u32;
    }
    Ok(true)
}

/// Relocation of one image, row by row in increasing address order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CopyOperation {
    pub source: u32,
    pub destination: u32,
    pub remaining: u32,
    pub row_size: u32,
}

impl CopyOperation {
    pub fn new(source: u32, destination: u32, len: u32, row_size: u32) -> Self {
        Self {
            source,
            destination,
            remaining: len,
            row_size,
        }
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Copies the next row. Destination rows must be writable by a host request.
    pub fn step<I, E, X>(&mut self, router: &mut Router<I, E, X>) -> Result<()>
    where
        I: NorFlash,
        E: NorFlash,
        X: SpiNorBus,
    {
        router.check(self.destination, self.row_size, Operation::Program)?;
        copy_row(router, self.destination, RowSource::Address(self.source), self.row_size)?;
        self.source += self.row_size;
        self.destination += self.row_size;
        self.remaining = self.remaining.saturating_sub(self.row_size);
        Ok(())
    }
}

/// Moves the validated image of `src` to the address it was linked for and points
/// `dest` at the copy.
///
/// `src` must be a remapped application: its directory entry holds the logical (execution)
/// address, its bytes live at the translated one. Any row failure aborts the copy with
/// [`Error::Data`] and leaves the destination partially written, the caller validates the
/// destination before trusting it.
pub fn copy_image<I, E, X>(
    router: &mut Router<I, E, X>,
    metadata: &mut MetadataManager,
    src: AppId,
    dest: AppId,
) -> Result<()>
where
    I: NorFlash,
    E: NorFlash,
    X: SpiNorBus,
{
    let entry = metadata.entry(src)?;
    if entry.is_empty() {
        return Err(Error::Verify);
    }
    let source = router.translate(entry.start, src);
    let destination = entry.start;
    if source == destination {
        return Err(Error::Address);
    }
    let row_size = router.classify(destination)?.row_size;
    let mut op = CopyOperation::new(source, destination, entry.length + IMAGE_FOOTER_SIZE, row_size);
    info!(
        "relocating app {} from {:#x} to {:#x}, {} bytes",
        src.0, source, destination, op.remaining
    );

    let external = router.classify(source)?.kind == RegionKind::ExternalXip;
    let previous = router.external_mode();
    if external {
        router.set_external_mode(Mode::MemoryMapped)?;
    }
    let mut result = Ok(());
    while !op.is_done() {
        if let Err(e) = op.step(router) {
            warn!("relocation aborted at {:#x}: {:?}", op.destination, e);
            result = Err(match e {
                Error::Address | Error::Length => e,
                _ => Error::Data,
            });
            break;
        }
        debug!("relocated row, {} bytes left", op.remaining);
    }
    if external {
        router.set_external_mode(previous)?;
    }
    result?;

    metadata.set_entry(router, dest, AppMetadataEntry::new(destination, entry.length))
}
