// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]
#![no_main]
mod board;
mod flash;
mod jump_app;
mod qspi;
mod uart;

use defmt_rtt as _;
// global logger
use embassy_nrf as _;
// time driver
use panic_probe as _;

use bootloader_core::{Action, Bootloader, BootloaderConfig, ExternalFlash, Inputs, NorGeometry, Router};
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
use defmt::{error, info, unwrap};
use embassy_executor::Spawner;
use embassy_nrf::gpio::{Input, Pull};
use embassy_nrf::nvmc::Nvmc;
use embassy_nrf::{bind_interrupts, peripherals, qspi as nrf_qspi, uarte};
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Ticker, Timer};
use flash::{Partition, SharedNvmc};
use jump_app::{hibernate, jump_to_app};
use qspi::QspiBus;
use uart::UartTransport;

bind_interrupts!(struct Irqs {
    UARTE0_UART0 => uarte::InterruptHandler<peripherals::UARTE0>;
    QSPI => nrf_qspi::InterruptHandler<peripherals::QSPI>;
});

/// Set by the tick task, consumed by the main loop.
static TICK: AtomicBool = AtomicBool::new(false);

/// Switch-over button, also the wake-up source out of System OFF.
const BUTTON_PIN: usize = 11;

#[embassy_executor::task]
async fn tick_task() {
    let mut ticker = Ticker::every(Duration::from_millis(consts::TICK_MS as u64));
    loop {
        ticker.next().await;
        TICK.store(true, Ordering::Relaxed);
    }
}

fn halt() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_nrf::init(Default::default());

    let mut config_uart = uarte::Config::default();
    config_uart.parity = uarte::Parity::EXCLUDED;
    config_uart.baudrate = uarte::Baudrate::BAUD115200;

    // Uarte config
    let uart = uarte::Uarte::new(p.UARTE0, Irqs, p.P0_16, p.P0_18, config_uart);
    let (tx, rx) = uart.split_with_idle(p.TIMER0, p.PPI_CH0, p.PPI_CH1);
    unwrap!(spawner.spawn(uart::rx_task(rx)), "Spawning uart rx failed");
    unwrap!(spawner.spawn(uart::tx_task(tx)), "Spawning uart tx failed");
    unwrap!(spawner.spawn(tick_task()), "Spawning tick failed");

    // External NOR
    let qspi = nrf_qspi::Qspi::new(
        p.QSPI,
        Irqs,
        p.P0_19,
        p.P0_17,
        p.P0_20,
        p.P0_21,
        p.P0_22,
        p.P0_23,
        qspi::config(),
    );
    let bus = match QspiBus::new(qspi) {
        Ok(bus) => bus,
        Err(e) => {
            error!("external flash init failed: {}", e);
            halt();
        }
    };

    // FLASH
    let nvmc: SharedNvmc = Mutex::new(RefCell::new(Nvmc::new(p.NVMC)));

    let mut config = BootloaderConfig::platform();
    config.metadata_writable = cfg!(feature = "metadata-writable");
    let router = Router::new(
        Partition::new(&nvmc, board::INTERNAL_PARTITION),
        Partition::new(&nvmc, board::EEPROM_PARTITION),
        ExternalFlash::new(bus, NorGeometry::platform()),
        config.regions,
        config.remaps.clone(),
    );

    let mut bootloader = match Bootloader::new(config, router, UartTransport) {
        Ok(bootloader) => bootloader,
        Err(e) => {
            error!("bootloader halted: {}", e);
            halt();
        }
    };

    // Inputs to leave the bootloader by hand
    let button = Input::new(p.P0_11, Pull::Up);
    let alert = Input::new(p.P0_12, Pull::Up);

    loop {
        let inputs = Inputs {
            tick: TICK.swap(false, Ordering::Relaxed),
            button_pressed: button.is_low(),
            alert: alert.is_low(),
        };
        match bootloader.poll(inputs) {
            Action::Continue => Timer::after_millis(1).await,
            Action::Execute { app_id, address } => {
                info!("booting app {} at {:#x}", app_id, address);
                // Let the tx task flush the last reply
                Timer::after_millis(10).await;
                #[cfg(feature = "flash-protect")]
                jump_app::protect_bootloader();
                unsafe { jump_to_app(address) }
            }
            Action::Hibernate => {
                let p0 = unsafe { &*nrf52840_pac::P0::ptr() };
                p0.pin_cnf[BUTTON_PIN].modify(|_, w| w.sense().low());
                hibernate();
            }
        }
    }
}
