// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Byte pipe to the host. Framing is COBS over `postcard`, the pipe itself knows nothing about it.

use crate::error::Error;
use crate::log::warn;
use host_protocol::{HostProtocolMessage, COBS_MAX_MSG_SIZE};
use postcard::to_slice_cobs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Nothing arrived within the read budget
    Timeout,
    /// No host connected
    Disconnected,
    /// Outbound queue full
    Busy,
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Error::Timeout,
            _ => Error::Data,
        }
    }
}

pub trait Transport {
    /// Makes the device reachable by a host.
    fn start(&mut self) -> Result<(), TransportError>;

    fn stop(&mut self);

    /// Drops any partially received data, called when a session is abandoned.
    fn reset(&mut self);

    /// Reads whatever arrived, waiting at most `timeout_ms`. A zero budget only polls.
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, TransportError>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;
}

/// Serializes and frames `msg`, then writes it.
pub fn send_cobs<T: Transport + ?Sized>(transport: &mut T, msg: &HostProtocolMessage<'_>) -> Result<(), TransportError> {
    let mut buf = [0u8; COBS_MAX_MSG_SIZE];
    let Ok(frame) = to_slice_cobs(msg, &mut buf) else {
        warn!("reply does not fit a frame");
        return Err(TransportError::Busy);
    };
    let mut sent = 0;
    while sent < frame.len() {
        match transport.write(&frame[sent..])? {
            0 => return Err(TransportError::Busy),
            n => sent += n,
        }
    }
    Ok(())
}
