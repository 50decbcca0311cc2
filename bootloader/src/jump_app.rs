// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later
#[cfg(feature = "s140")]
use crate::board::SOFTDEVICE_BASE;
use cortex_m::peripheral::NVIC;
use defmt::info;
use embassy_nrf::interrupt::Interrupt;
use nrf_softdevice_mbr as mbr;

fn mbr_forward_irqs(address: u32) -> u32 {
    let mut cmd = mbr::sd_mbr_command_t {
        command: mbr::NRF_MBR_COMMANDS_SD_MBR_COMMAND_IRQ_FORWARD_ADDRESS_SET,
        params: mbr::sd_mbr_command_t__bindgen_ty_1 {
            irq_forward_address_set: mbr::sd_mbr_command_irq_forward_address_set_t { address },
        },
    };
    unsafe { mbr::sd_mbr_command(&mut cmd) }
}

/// Boots the image whose vector table sits at `address`.
///
/// With the SoftDevice present the MBR initialises it and interrupts are forwarded
/// MBR -> SoftDevice -> image; without it the MBR forwards straight to the image.
///
/// # Safety
///
/// This modifies the stack pointer and reset vector and will run code placed at `address`.
/// The caller must have validated the image.
pub unsafe fn jump_to_app(address: u32) -> ! {
    #[cfg(feature = "s140")]
    {
        let mut cmd = mbr::sd_mbr_command_t {
            command: mbr::NRF_MBR_COMMANDS_SD_MBR_COMMAND_INIT_SD,
            params: mbr::sd_mbr_command_t__bindgen_ty_1 {
                irq_forward_address_set: mbr::sd_mbr_command_irq_forward_address_set_t { address },
            },
        };
        let ret = mbr::sd_mbr_command(&mut cmd);
        info!("ret SD init result {}", ret);
    }

    // Disable active interrupts
    NVIC::mask(Interrupt::UARTE0_UART0);
    NVIC::mask(Interrupt::QSPI);
    NVIC::mask(Interrupt::TIMER0);

    // Probably this critical section is redundant, but keeping it for the SoftDevice.
    critical_section::with(|_| {
        #[cfg(feature = "s140")]
        {
            let ret = nrf_softdevice_s140::sd_softdevice_vector_table_base_set(address);
            info!("ret val base set {}", ret);
            let ret = mbr_forward_irqs(SOFTDEVICE_BASE);
            info!("ret forward irq mbr result {}", ret);
        }
        #[cfg(not(feature = "s140"))]
        {
            let ret = mbr_forward_irqs(address);
            info!("ret forward irq mbr result {}", ret);
        }

        let msp = *(address as *const u32);
        let rv = *((address + 4) as *const u32);

        info!("msp = {=u32:x}, rv = {=u32:x}", msp, rv);

        // These instructions perform the following operations:
        //
        // * Modify control register to use MSP as stack pointer (clear spsel bit)
        // * Synchronize instruction barrier
        // * Initialize stack pointer from the image header
        // * Set link register to not return (0xFF)
        // * Jump to the image reset vector
        core::arch::asm!(
            "mrs {tmp}, CONTROL",
            "bics {tmp}, {spsel}",
            "msr CONTROL, {tmp}",
            "isb",
            "msr MSP, {msp}",
            "mov lr, {new_lr}",
            "bx {rv}",
            // `out(reg) _` is not permitted in a `noreturn` asm! call,
            // so instead use `in(reg) 0` and don't restore it afterwards.
            tmp = in(reg) 0,
            spsel = in(reg) 2,
            new_lr = in(reg) 0xFFFFFFFFu32,
            msp = in(reg) msp,
            rv = in(reg) rv,
            options(noreturn),
        );
    })
}

/// Drops into System OFF; only a reset or the wake-up pin brings the chip back.
pub fn hibernate() -> ! {
    info!("entering system off");
    let power = unsafe { &*nrf52840_pac::POWER::ptr() };
    power.systemoff.write(|w| w.systemoff().enter());
    loop {
        cortex_m::asm::wfe();
    }
}

/// Write-protects the bootloader and metadata pages until the next reset.
#[cfg(feature = "flash-protect")]
pub fn protect_bootloader() {
    let acl = unsafe { &*nrf52840_pac::ACL::ptr() };
    acl.acl[0].addr.write(|w| unsafe { w.bits(consts::BASE_BOOTLOADER_ADDR) });
    acl.acl[0]
        .size
        .write(|w| unsafe { w.bits(consts::EEPROM_START - consts::BASE_BOOTLOADER_ADDR) });
    acl.acl[0].perm.write(|w| w.write().disable());
    info!("bootloader flash write protected");
}
