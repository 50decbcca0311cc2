// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! QSPI controller as the raw bus of the external NOR.
//!
//! The peripheral issues its own write enable before program and erase tasks, the core still
//! sends one and checks WEL, which is harmless. Reads and programs go through a word aligned
//! bounce buffer since EasyDMA only moves whole words.

use crate::board::QSPI_STATUS_QE;
use bootloader_core::extflash::{CMD_PAGE_PROGRAM, CMD_READ, CMD_READ_STATUS, CMD_SECTOR_ERASE, CMD_WRITE_ENABLE};
use bootloader_core::SpiNorBus;
use consts::{XIP_SIZE, XIP_START};
use core::cmp::min;
use embassy_nrf::peripherals::QSPI;
use embassy_nrf::qspi::{self, Qspi};

const BOUNCE_SIZE: usize = 256;

/// Write status register
const CMD_WRITE_STATUS: u8 = 0x01;

#[derive(Debug, Clone, Copy, defmt::Format)]
pub enum BusError {
    Qspi(qspi::Error),
    /// The controller has no task for this opcode
    Unsupported(u8),
    /// Access through the interface that is not currently selected
    WrongMode,
}

impl From<qspi::Error> for BusError {
    fn from(err: qspi::Error) -> Self {
        BusError::Qspi(err)
    }
}

#[repr(C, align(4))]
struct Bounce([u8; BOUNCE_SIZE]);

pub struct QspiBus {
    qspi: Qspi<'static, QSPI>,
    mapped: bool,
    bounce: Bounce,
}

/// Controller settings for the 8 MiB quad NOR on the board.
pub fn config() -> qspi::Config {
    let mut config = qspi::Config::default();
    config.capacity = XIP_SIZE;
    config.frequency = qspi::Frequency::M32;
    config.read_opcode = qspi::ReadOpcode::READ4IO;
    config.write_opcode = qspi::WriteOpcode::PP4IO;
    config.write_page_size = qspi::WritePageSize::_256BYTES;
    config
}

impl QspiBus {
    /// Takes the controller and switches the chip to quad I/O.
    pub fn new(mut qspi: Qspi<'static, QSPI>) -> Result<Self, BusError> {
        let mut status = [0u8; 1];
        qspi.blocking_custom_instruction(CMD_READ_STATUS, &[], &mut status)?;
        if status[0] & QSPI_STATUS_QE == 0 {
            qspi.blocking_custom_instruction(CMD_WRITE_ENABLE, &[], &mut [])?;
            qspi.blocking_custom_instruction(CMD_WRITE_STATUS, &[QSPI_STATUS_QE], &mut [])?;
            defmt::info!("qspi quad mode enabled");
        }
        Ok(Self {
            qspi,
            mapped: false,
            bounce: Bounce([0; BOUNCE_SIZE]),
        })
    }

    fn command_mode(&self) -> Result<(), BusError> {
        if self.mapped {
            return Err(BusError::WrongMode);
        }
        Ok(())
    }
}

impl SpiNorBus for QspiBus {
    type Error = BusError;

    fn command(&mut self, opcode: u8) -> Result<(), BusError> {
        self.command_mode()?;
        self.qspi.blocking_custom_instruction(opcode, &[], &mut [])?;
        Ok(())
    }

    fn command_with_address(&mut self, opcode: u8, address: u32) -> Result<(), BusError> {
        self.command_mode()?;
        match opcode {
            CMD_SECTOR_ERASE => Ok(self.qspi.blocking_erase(address)?),
            _ => {
                let [_, a2, a1, a0] = address.to_be_bytes();
                self.qspi.blocking_custom_instruction(opcode, &[a2, a1, a0], &mut [])?;
                Ok(())
            }
        }
    }

    fn read_register(&mut self, opcode: u8) -> Result<u8, BusError> {
        self.command_mode()?;
        let mut value = [0u8; 1];
        self.qspi.blocking_custom_instruction(opcode, &[], &mut value)?;
        Ok(value[0])
    }

    fn write_data(&mut self, opcode: u8, mut address: u32, mut data: &[u8]) -> Result<(), BusError> {
        self.command_mode()?;
        if opcode != CMD_PAGE_PROGRAM {
            return Err(BusError::Unsupported(opcode));
        }
        // Padding with 0xFF leaves the neighbouring NOR cells untouched.
        while !data.is_empty() {
            let base = address & !3;
            let skip = (address - base) as usize;
            let n = min(data.len(), BOUNCE_SIZE - skip);
            let len = (skip + n + 3) & !3;
            let bounce = &mut self.bounce.0[..len];
            bounce.fill(0xFF);
            bounce[skip..skip + n].copy_from_slice(&data[..n]);
            self.qspi.blocking_write(base, bounce)?;
            address += n as u32;
            data = &data[n..];
        }
        Ok(())
    }

    fn read_data(&mut self, opcode: u8, mut address: u32, mut buf: &mut [u8]) -> Result<(), BusError> {
        self.command_mode()?;
        if opcode != CMD_READ {
            return Err(BusError::Unsupported(opcode));
        }
        while !buf.is_empty() {
            let base = address & !3;
            let skip = (address - base) as usize;
            let n = min(buf.len(), BOUNCE_SIZE - skip);
            let len = (skip + n + 3) & !3;
            self.qspi.blocking_read(base, &mut self.bounce.0[..len])?;
            let (head, rest) = buf.split_at_mut(n);
            head.copy_from_slice(&self.bounce.0[skip..skip + n]);
            address += n as u32;
            buf = rest;
        }
        Ok(())
    }

    fn set_memory_mapped(&mut self, enabled: bool) -> Result<(), BusError> {
        // XIP is always live while no task runs, only the bookkeeping changes.
        self.mapped = enabled;
        Ok(())
    }

    fn invalidate_cache(&mut self) {
        // The instruction cache also fronts the XIP window.
        let nvmc = unsafe { &*nrf52840_pac::NVMC::ptr() };
        let enabled = nvmc.icachecnf.read().cacheen().is_enabled();
        nvmc.icachecnf.modify(|_, w| w.cacheen().disabled());
        if enabled {
            nvmc.icachecnf.modify(|_, w| w.cacheen().enabled());
        }
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    fn read_mapped(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), BusError> {
        if !self.mapped {
            return Err(BusError::WrongMode);
        }
        match offset.checked_add(buf.len() as u32) {
            Some(end) if end <= XIP_SIZE => {}
            _ => return Err(BusError::Qspi(qspi::Error::OutOfBounds)),
        }
        unsafe {
            core::ptr::copy_nonoverlapping((XIP_START + offset) as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }
}
