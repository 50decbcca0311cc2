// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Serial NOR flash reached either by commands or through the memory-mapped (XIP) window.
//!
//! All program/erase operations block until the chip reports ready, polling the status
//! register at most [`NorGeometry::max_polls`] times. A chip that never becomes ready is
//! reported as [`Error::Timeout`] instead of hanging the bootloader.

use crate::error::{Error, Result};
use crate::log::{debug, warn};

pub const CMD_WRITE_ENABLE: u8 = 0x06;
pub const CMD_READ_STATUS: u8 = 0x05;
pub const CMD_READ: u8 = 0x03;
pub const CMD_PAGE_PROGRAM: u8 = 0x02;
pub const CMD_SECTOR_ERASE: u8 = 0x20;
pub const CMD_CHIP_ERASE: u8 = 0xC7;

/// Write in progress
pub const STATUS_WIP: u8 = 0x01;
/// Write enable latch
pub const STATUS_WEL: u8 = 0x02;

/// Raw command interface of the external memory controller.
///
/// Addresses are offsets into the chip. Implementations do not wait for the chip,
/// [`ExternalFlash`] does.
pub trait SpiNorBus {
    type Error;

    /// Instruction without address or data phase.
    fn command(&mut self, opcode: u8) -> core::result::Result<(), Self::Error>;

    /// Instruction with an address phase only (sector erase).
    fn command_with_address(&mut self, opcode: u8, address: u32) -> core::result::Result<(), Self::Error>;

    /// Instruction returning one register byte.
    fn read_register(&mut self, opcode: u8) -> core::result::Result<u8, Self::Error>;

    /// Instruction with address and data out phase (page program).
    fn write_data(&mut self, opcode: u8, address: u32, data: &[u8]) -> core::result::Result<(), Self::Error>;

    /// Instruction with address and data in phase.
    fn read_data(&mut self, opcode: u8, address: u32, buf: &mut [u8]) -> core::result::Result<(), Self::Error>;

    /// Switches the controller between command mode and the memory-mapped window.
    fn set_memory_mapped(&mut self, enabled: bool) -> core::result::Result<(), Self::Error>;

    /// Drops anything cached from the memory-mapped window.
    fn invalidate_cache(&mut self);

    /// Reads through the memory-mapped window.
    fn read_mapped(&mut self, offset: u32, buf: &mut [u8]) -> core::result::Result<(), Self::Error>;
}

/// Interface mode of the external memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    Normal,
    MemoryMapped,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NorGeometry {
    pub page_size: u32,
    pub sector_size: u32,
    pub capacity: u32,
    /// Status polls allowed for one operation
    pub max_polls: u32,
}

impl NorGeometry {
    pub fn platform() -> Self {
        Self {
            page_size: consts::EXTERNAL_PAGE_SIZE,
            sector_size: consts::EXTERNAL_SECTOR_SIZE,
            capacity: consts::XIP_SIZE,
            max_polls: consts::EXTERNAL_MAX_POLLS,
        }
    }
}

pub struct ExternalFlash<B> {
    bus: B,
    geometry: NorGeometry,
    mode: Mode,
}

impl<B: SpiNorBus> ExternalFlash<B> {
    /// The controller is expected in command mode.
    pub fn new(bus: B, geometry: NorGeometry) -> Self {
        Self {
            bus,
            geometry,
            mode: Mode::Normal,
        }
    }

    pub fn geometry(&self) -> &NorGeometry {
        &self.geometry
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Switches mode. The read cache is invalidated on every call so mapped reads
    /// always observe what was last programmed.
    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        if mode != self.mode {
            self.bus
                .set_memory_mapped(mode == Mode::MemoryMapped)
                .map_err(|_| Error::Data)?;
            debug!("external flash mode {:?}", mode);
            self.mode = mode;
        }
        self.bus.invalidate_cache();
        Ok(())
    }

    /// Programs bytes that stay inside one page.
    pub fn program_page(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        let page = self.geometry.page_size;
        if bytes.is_empty() || bytes.len() as u32 > page {
            return Err(Error::Length);
        }
        if address % page + bytes.len() as u32 > page {
            return Err(Error::Address);
        }
        self.check_bounds(address, bytes.len() as u32)?;

        self.in_command_mode(|flash| {
            flash.write_enable()?;
            flash
                .bus
                .write_data(CMD_PAGE_PROGRAM, address, bytes)
                .map_err(|_| Error::Data)?;
            flash.wait_ready()
        })
    }

    /// Programs any number of bytes, split on page boundaries.
    pub fn program(&mut self, mut address: u32, mut bytes: &[u8]) -> Result<()> {
        self.check_bounds(address, bytes.len() as u32)?;
        let page = self.geometry.page_size;
        while !bytes.is_empty() {
            let room = (page - address % page) as usize;
            let (chunk, rest) = bytes.split_at(room.min(bytes.len()));
            self.program_page(address, chunk)?;
            address += chunk.len() as u32;
            bytes = rest;
        }
        Ok(())
    }

    /// Reads through whichever interface is currently active.
    pub fn read_bytes(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(address, buf.len() as u32)?;
        match self.mode {
            Mode::MemoryMapped => self.bus.read_mapped(address, buf).map_err(|_| Error::Data),
            Mode::Normal => {
                self.wait_ready()?;
                self.bus.read_data(CMD_READ, address, buf).map_err(|_| Error::Data)
            }
        }
    }

    /// Erases the sector holding `address`.
    pub fn erase_sector(&mut self, address: u32) -> Result<()> {
        self.check_bounds(address, 0)?;
        let sector = address - address % self.geometry.sector_size;
        self.in_command_mode(|flash| {
            flash.write_enable()?;
            flash
                .bus
                .command_with_address(CMD_SECTOR_ERASE, sector)
                .map_err(|_| Error::Data)?;
            flash.wait_ready()
        })
    }

    pub fn erase_chip(&mut self) -> Result<()> {
        self.in_command_mode(|flash| {
            flash.write_enable()?;
            flash.bus.command(CMD_CHIP_ERASE).map_err(|_| Error::Data)?;
            flash.wait_ready()
        })
    }

    fn check_bounds(&self, address: u32, len: u32) -> Result<()> {
        match address.checked_add(len) {
            Some(end) if address < self.geometry.capacity && end <= self.geometry.capacity => Ok(()),
            _ => Err(Error::Address),
        }
    }

    /// Program and erase need command mode; the previous mode is restored afterwards.
    fn in_command_mode<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let previous = self.mode;
        if previous == Mode::MemoryMapped {
            self.set_mode(Mode::Normal)?;
        }
        let result = f(self);
        if previous == Mode::MemoryMapped {
            self.set_mode(Mode::MemoryMapped)?;
        }
        result
    }

    fn write_enable(&mut self) -> Result<()> {
        self.wait_ready()?;
        self.bus.command(CMD_WRITE_ENABLE).map_err(|_| Error::Data)?;
        let status = self.bus.read_register(CMD_READ_STATUS).map_err(|_| Error::Data)?;
        if status & STATUS_WEL == 0 {
            warn!("external flash refused write enable, status {:#x}", status);
            return Err(Error::Data);
        }
        Ok(())
    }

    fn wait_ready(&mut self) -> Result<()> {
        for _ in 0..self.geometry.max_polls {
            let status = self.bus.read_register(CMD_READ_STATUS).map_err(|_| Error::Data)?;
            if status & STATUS_WIP == 0 {
                return Ok(());
            }
        }
        warn!("external flash busy after {} polls", self.geometry.max_polls);
        Err(Error::Timeout)
    }
}
