// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! RAM-backed stand-ins for the board and a small platform to run them on.

use crate::config::{AppId, BootloaderConfig, Remap};
use crate::extflash::{ExternalFlash, NorGeometry, SpiNorBus, *};
use crate::metadata::{encode_entry, seal_row, AppMetadataEntry};
use crate::region::{MemoryRegion, RegionKind, RegionTable};
use crate::router::Router;
use crate::transport::{Transport, TransportError};
use crate::validate::image_checksum;
use crate::{Action, Bootloader, Inputs};
use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};
use host_protocol::{Bootloader as Cmd, HostProtocolMessage, State, Status, COBS_MAX_MSG_SIZE};
use postcard::accumulator::{CobsAccumulator, FeedResult};
use postcard::to_slice_cobs;
use std::collections::VecDeque;
use std::vec::Vec;

mod router;

pub const INTERNAL_SIZE: u32 = 0x2_0000;
pub const INTERNAL_ROW: u32 = 512;
pub const EEPROM_START: u32 = 0x4_0000;
pub const EEPROM_SIZE: u32 = 0x2000;
pub const EEPROM_ROW: u32 = 256;
pub const EXTERNAL_START: u32 = 0x1000_0000;
pub const EXTERNAL_SIZE: u32 = 0x4_0000;
pub const EXTERNAL_ROW: u32 = 4096;

pub const APP_START: u32 = 0x2000;
pub const APP_SIZE: u32 = 0x1_0000;
pub const GOLDEN_START: u32 = 0x1_4000;
pub const LAUNCHER_START: u32 = 0x1_8000;
pub const METADATA: u32 = 0x1_F000;
pub const PRODUCT: u32 = 0x1234_5678;

pub const LAUNCHER: AppMetadataEntry = AppMetadataEntry::new(LAUNCHER_START, 0x4000 - 4);

pub type TestRouter = Router<RamFlash<512>, RamFlash<256>, MockNorBus>;
pub type TestBootloader = Bootloader<RamFlash<512>, RamFlash<256>, MockNorBus, MockTransport>;

pub fn init_logger() {
    let _ = pretty_env_logger::try_init();
}

/// Internal flash with NOR semantics: erase sets bytes to 0xFF, programming only clears bits.
pub struct RamFlash<const ERASE: usize> {
    pub data: Vec<u8>,
    pub erases: usize,
    pub writes: usize,
}

impl<const ERASE: usize> RamFlash<ERASE> {
    pub fn new(size: u32) -> Self {
        Self {
            data: std::vec![0xFF; size as usize],
            erases: 0,
            writes: 0,
        }
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, NorFlashErrorKind> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(NorFlashErrorKind::OutOfBounds),
        }
    }
}

impl<const ERASE: usize> ErrorType for RamFlash<ERASE> {
    type Error = NorFlashErrorKind;
}

impl<const ERASE: usize> ReadNorFlash for RamFlash<ERASE> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl<const ERASE: usize> NorFlash for RamFlash<ERASE> {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = ERASE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from as usize % ERASE != 0 || to as usize % ERASE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if to < from {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        let range = self.range(from, (to - from) as usize)?;
        self.data[range].fill(0xFF);
        self.erases += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = self.range(offset, bytes.len())?;
        for (cell, byte) in self.data[range].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        self.writes += 1;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct BusError;

/// Serial NOR chip behind a controller with a cached memory-mapped window.
///
/// Commands are refused while mapped, the cache is a snapshot taken on invalidation.
pub struct MockNorBus {
    pub mem: Vec<u8>,
    cache: Vec<u8>,
    pub mapped: bool,
    wel: bool,
    busy: u32,
    page_size: usize,
    sector_size: usize,
    /// Status polls reporting busy after each program or erase
    pub busy_polls: u32,
    pub never_ready: bool,
    pub refuse_write_enable: bool,
    pub invalidations: usize,
    pub programs: usize,
    pub sector_erases: usize,
}

impl MockNorBus {
    pub fn new(geometry: &NorGeometry) -> Self {
        let mem = std::vec![0xFF; geometry.capacity as usize];
        Self {
            cache: mem.clone(),
            mem,
            mapped: false,
            wel: false,
            busy: 0,
            page_size: geometry.page_size as usize,
            sector_size: geometry.sector_size as usize,
            busy_polls: 3,
            never_ready: false,
            refuse_write_enable: false,
            invalidations: 0,
            programs: 0,
            sector_erases: 0,
        }
    }

    fn command_mode(&self) -> Result<(), BusError> {
        if self.mapped || self.busy > 0 {
            return Err(BusError);
        }
        Ok(())
    }

    fn take_wel(&mut self) -> Result<(), BusError> {
        if !self.wel {
            return Err(BusError);
        }
        self.wel = false;
        Ok(())
    }
}

impl SpiNorBus for MockNorBus {
    type Error = BusError;

    fn command(&mut self, opcode: u8) -> Result<(), BusError> {
        self.command_mode()?;
        match opcode {
            CMD_WRITE_ENABLE => {
                self.wel = !self.refuse_write_enable;
                Ok(())
            }
            CMD_CHIP_ERASE => {
                self.take_wel()?;
                self.mem.fill(0xFF);
                self.busy = self.busy_polls;
                Ok(())
            }
            _ => Err(BusError),
        }
    }

    fn command_with_address(&mut self, opcode: u8, address: u32) -> Result<(), BusError> {
        self.command_mode()?;
        if opcode != CMD_SECTOR_ERASE {
            return Err(BusError);
        }
        self.take_wel()?;
        let start = address as usize - address as usize % self.sector_size;
        self.mem[start..start + self.sector_size].fill(0xFF);
        self.sector_erases += 1;
        self.busy = self.busy_polls;
        Ok(())
    }

    fn read_register(&mut self, opcode: u8) -> Result<u8, BusError> {
        if self.mapped || opcode != CMD_READ_STATUS {
            return Err(BusError);
        }
        let mut status = if self.wel { STATUS_WEL } else { 0 };
        if self.never_ready || self.busy > 0 {
            self.busy = self.busy.saturating_sub(1);
            status |= STATUS_WIP;
        }
        Ok(status)
    }

    fn write_data(&mut self, opcode: u8, address: u32, data: &[u8]) -> Result<(), BusError> {
        self.command_mode()?;
        if opcode != CMD_PAGE_PROGRAM {
            return Err(BusError);
        }
        self.take_wel()?;
        let start = address as usize;
        if start % self.page_size + data.len() > self.page_size {
            return Err(BusError);
        }
        for (cell, byte) in self.mem[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.programs += 1;
        self.busy = self.busy_polls;
        Ok(())
    }

    fn read_data(&mut self, opcode: u8, address: u32, buf: &mut [u8]) -> Result<(), BusError> {
        self.command_mode()?;
        if opcode != CMD_READ {
            return Err(BusError);
        }
        let start = address as usize;
        buf.copy_from_slice(&self.mem[start..start + buf.len()]);
        Ok(())
    }

    fn set_memory_mapped(&mut self, enabled: bool) -> Result<(), BusError> {
        self.mapped = enabled;
        Ok(())
    }

    fn invalidate_cache(&mut self) {
        self.cache.copy_from_slice(&self.mem);
        self.invalidations += 1;
    }

    fn read_mapped(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), BusError> {
        if !self.mapped {
            return Err(BusError);
        }
        let start = offset as usize;
        buf.copy_from_slice(&self.cache[start..start + buf.len()]);
        Ok(())
    }
}

/// Host side of the pipe: frames queued by the test, replies captured as bytes.
#[derive(Default)]
pub struct MockTransport {
    inbound: VecDeque<u8>,
    pub outbound: Vec<u8>,
    pub started: bool,
    pub stopped: bool,
    pub resets: usize,
}

impl MockTransport {
    pub fn push(&mut self, msg: &HostProtocolMessage<'_>) {
        let mut buf = [0u8; COBS_MAX_MSG_SIZE];
        let frame = to_slice_cobs(msg, &mut buf).unwrap();
        self.inbound.extend(frame.iter().copied());
    }

    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }

    pub fn has_pending(&self) -> bool {
        !self.inbound.is_empty()
    }

    /// Decodes and drains everything the bootloader sent.
    pub fn take_replies(&mut self) -> Vec<Reply> {
        let bytes = core::mem::take(&mut self.outbound);
        let mut acc: CobsAccumulator<COBS_MAX_MSG_SIZE> = CobsAccumulator::new();
        let mut replies = Vec::new();
        let mut window = &bytes[..];
        while !window.is_empty() {
            window = match acc.feed_ref::<HostProtocolMessage>(window) {
                FeedResult::Consumed => break,
                FeedResult::Success { data, remaining } => {
                    replies.push(Reply::from(data));
                    remaining
                }
                _ => panic!("bootloader sent a malformed frame"),
            };
        }
        replies
    }

    pub fn statuses(&mut self) -> Vec<Status> {
        self.take_replies()
            .into_iter()
            .filter_map(|r| match r {
                Reply::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

impl Transport for MockTransport {
    fn start(&mut self) -> Result<(), TransportError> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn reset(&mut self) {
        self.inbound.clear();
        self.resets += 1;
    }

    fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, TransportError> {
        if self.inbound.is_empty() {
            return Err(TransportError::Timeout);
        }
        let n = buf.len().min(self.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Owned copy of a reply, so tests can keep it after the frame buffer is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(Status),
    AckEnter { product_id: u32 },
    AckRead(Vec<u8>),
    AckVerify { app_id: u8, valid: bool },
    AckMetadata { app_id: u8, start: u32, length: u32 },
    AckState(State),
    Version,
    Other,
}

impl From<HostProtocolMessage<'_>> for Reply {
    fn from(msg: HostProtocolMessage<'_>) -> Self {
        match msg {
            HostProtocolMessage::Bootloader(Cmd::Status(s)) => Reply::Status(s),
            HostProtocolMessage::Bootloader(Cmd::AckEnterBootloader { product_id, .. }) => {
                Reply::AckEnter { product_id }
            }
            HostProtocolMessage::Bootloader(Cmd::AckReadData { data }) => Reply::AckRead(data.to_vec()),
            HostProtocolMessage::Bootloader(Cmd::AckVerifyApplication { app_id, valid }) => {
                Reply::AckVerify { app_id, valid }
            }
            HostProtocolMessage::Bootloader(Cmd::AckMetadata { app_id, start, length }) => {
                Reply::AckMetadata { app_id, start, length }
            }
            HostProtocolMessage::Bootloader(Cmd::AckBootloaderVersion { .. }) => Reply::Version,
            HostProtocolMessage::AckState(state) => Reply::AckState(state),
            _ => Reply::Other,
        }
    }
}

pub fn geometry() -> NorGeometry {
    NorGeometry {
        page_size: 256,
        sector_size: EXTERNAL_ROW,
        capacity: EXTERNAL_SIZE,
        max_polls: 64,
    }
}

pub fn test_config() -> BootloaderConfig {
    let mut remaps = heapless::Vec::new();
    remaps
        .push(Remap {
            app: AppId::STAGING,
            logical_start: APP_START,
            physical_start: EXTERNAL_START,
            len: APP_SIZE,
        })
        .unwrap();
    let mut golden = heapless::Vec::new();
    golden.push(AppId::GOLDEN).unwrap();

    BootloaderConfig {
        product_id: PRODUCT,
        regions: RegionTable {
            internal: MemoryRegion::new(RegionKind::InternalFlash, 0, INTERNAL_SIZE, INTERNAL_ROW),
            eeprom: MemoryRegion::new(
                RegionKind::EmulatedEeprom,
                EEPROM_START,
                EEPROM_START + EEPROM_SIZE,
                EEPROM_ROW,
            ),
            external: MemoryRegion::new(
                RegionKind::ExternalXip,
                EXTERNAL_START,
                EXTERNAL_START + EXTERNAL_SIZE,
                EXTERNAL_ROW,
            ),
        },
        reserved: heapless::Vec::new(),
        remaps,
        metadata_address: METADATA,
        metadata_writable: true,
        launcher_entry: LAUNCHER,
        running_app: AppId::LAUNCHER,
        app: AppId::APPLICATION,
        staging: Some(AppId::STAGING),
        golden,
        idle_timeout_ticks: 5,
        discovery_window_ticks: 50,
        button_hold_ticks: 3,
        max_consecutive_failures: 3,
        transport_timeout_ms: 0,
    }
}

pub fn test_router(config: &BootloaderConfig) -> TestRouter {
    let geometry = geometry();
    Router::new(
        RamFlash::new(INTERNAL_SIZE),
        RamFlash::new(EEPROM_SIZE),
        ExternalFlash::new(MockNorBus::new(&geometry), geometry),
        config.regions,
        config.remaps.clone(),
    )
}

/// Deterministic, non-repeating test image.
pub fn image(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32 * 7) as u8 ^ (i >> 8) as u8)
        .collect()
}

/// Image followed by its footer, padded with erased bytes to whole rows.
pub fn stored_form(image: &[u8], row: u32) -> Vec<u8> {
    let mut bytes = image.to_vec();
    bytes.extend_from_slice(&image_checksum(image).to_le_bytes());
    let row = row as usize;
    let padded = bytes.len().div_ceil(row) * row;
    bytes.resize(padded, 0xFF);
    bytes
}

pub fn store_image(router: &mut TestRouter, physical: u32, image: &[u8]) {
    let row = router.classify(physical).unwrap().row_size;
    router.write_rows(physical, &stored_form(image, row)).unwrap();
}

pub fn metadata_row(entries: &[(AppId, AppMetadataEntry)]) -> Vec<u8> {
    let mut row = std::vec![0u8; INTERNAL_ROW as usize];
    for (app, entry) in entries {
        encode_entry(&mut row, *app, *entry);
    }
    seal_row(&mut row);
    row
}

/// Writes the same valid directory to both metadata rows.
pub fn seed_metadata(router: &mut TestRouter, entries: &[(AppId, AppMetadataEntry)]) {
    let row = metadata_row(entries);
    router.write_rows(METADATA, &row).unwrap();
    router.write_rows(METADATA + INTERNAL_ROW, &row).unwrap();
}

pub fn read_vec(router: &mut TestRouter, address: u32, len: u32) -> Vec<u8> {
    let mut buf = std::vec![0u8; len as usize];
    router.read(address, &mut buf).unwrap();
    buf
}

pub fn boot(config: BootloaderConfig, router: TestRouter) -> TestBootloader {
    init_logger();
    let bl = Bootloader::new(config, router, MockTransport::default()).unwrap();
    assert!(bl.transport().started);
    bl
}

/// Polls until everything queued was consumed. Returns the first action that is not `Continue`.
pub fn drain(bl: &mut TestBootloader) -> Action {
    loop {
        let pending = bl.transport().has_pending();
        let action = bl.poll(Inputs::default());
        if action != Action::Continue || !pending {
            return action;
        }
    }
}

pub fn tick(bl: &mut TestBootloader, inputs: Inputs) -> Action {
    bl.poll(Inputs { tick: true, ..inputs })
}
