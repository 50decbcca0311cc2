// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host link over UARTE0.
//!
//! Two tasks shuttle bytes between the peripheral and a pair of pipes; the state machine polls
//! the pipes synchronously from the main loop through [`UartTransport`].

use crate::board::UART_PIPE_SIZE;
use bootloader_core::{Transport, TransportError};
use core::sync::atomic::{AtomicBool, Ordering};
use defmt::{debug, error};
use embassy_nrf::peripherals::{TIMER0, UARTE0};
use embassy_nrf::uarte::{UarteRxWithIdle, UarteTx};
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::pipe::Pipe;

static RX_PIPE: Pipe<ThreadModeRawMutex, UART_PIPE_SIZE> = Pipe::new();
static TX_PIPE: Pipe<ThreadModeRawMutex, UART_PIPE_SIZE> = Pipe::new();

/// Bytes arriving while the link is stopped are dropped.
static LINK_UP: AtomicBool = AtomicBool::new(false);

#[embassy_executor::task]
pub async fn rx_task(mut rx: UarteRxWithIdle<'static, UARTE0, TIMER0>) {
    // Raw buffer, must be in SRAM for EasyDMA
    let mut raw_buf = [0u8; 64];
    loop {
        match rx.read_until_idle(&mut raw_buf).await {
            Ok(0) => {}
            Ok(n) => {
                if LINK_UP.load(Ordering::Relaxed) {
                    RX_PIPE.write_all(&raw_buf[..n]).await;
                }
            }
            Err(e) => error!("uart rx {}", e),
        }
    }
}

#[embassy_executor::task]
pub async fn tx_task(mut tx: UarteTx<'static, UARTE0>) {
    let mut buf = [0u8; 64];
    loop {
        let n = TX_PIPE.read(&mut buf).await;
        if let Err(e) = tx.write(&buf[..n]).await {
            error!("uart tx {}", e);
        }
    }
}

/// Handle the state machine owns; the tasks own the peripheral.
pub struct UartTransport;

impl Transport for UartTransport {
    fn start(&mut self) -> Result<(), TransportError> {
        RX_PIPE.clear();
        LINK_UP.store(true, Ordering::Relaxed);
        debug!("uart link up");
        Ok(())
    }

    fn stop(&mut self) {
        LINK_UP.store(false, Ordering::Relaxed);
        debug!("uart link down");
    }

    fn reset(&mut self) {
        RX_PIPE.clear();
    }

    fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, TransportError> {
        if !LINK_UP.load(Ordering::Relaxed) {
            return Err(TransportError::Disconnected);
        }
        // The main loop yields between polls, waiting here would stall the tick.
        RX_PIPE.try_read(buf).map_err(|_| TransportError::Timeout)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        if !LINK_UP.load(Ordering::Relaxed) {
            return Err(TransportError::Disconnected);
        }
        TX_PIPE.try_write(buf).map_err(|_| TransportError::Busy)
    }
}
