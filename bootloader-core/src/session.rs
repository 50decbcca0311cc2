// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::AppId;
use crate::error::{Error, Result};
use consts::MAX_ROW_SIZE;
use heapless::Vec;
use host_protocol::State;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    /// Nothing received yet
    None,
    /// Multi-packet exchange underway
    Bootloading,
    /// Host signalled the image is complete
    Finished,
}

impl From<SessionState> for State {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::None => State::Idle,
            SessionState::Bootloading => State::Bootloading,
            SessionState::Finished => State::Finished,
        }
    }
}

/// State of one update session, owned by the state machine.
///
/// The inbound frame buffer lives with the transport side of the state machine, this only
/// holds the request being assembled from `SendData` chunks.
#[derive(Debug)]
pub struct TransferSession {
    pub state: SessionState,
    /// Application the host said it is sending
    pub app_id: Option<AppId>,
    pub data_buffer: Vec<u8, MAX_ROW_SIZE>,
    /// Ticks since the last decoded command
    pub idle_ticks: u32,
    /// Consecutive commands that failed
    pub failures: u8,
}

impl Default for TransferSession {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferSession {
    pub const fn new() -> Self {
        Self {
            state: SessionState::None,
            app_id: None,
            data_buffer: Vec::new(),
            idle_ticks: 0,
            failures: 0,
        }
    }

    pub fn begin(&mut self, app: AppId) {
        self.reset();
        self.state = SessionState::Bootloading;
        self.app_id = Some(app);
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_active(&self) -> bool {
        self.state != SessionState::None
    }

    /// Appends to the request being assembled.
    pub fn buffer(&mut self, data: &[u8]) -> Result<()> {
        self.data_buffer.extend_from_slice(data).map_err(|_| Error::Length)
    }

    /// Counts a command outcome, returns the consecutive failure count.
    pub fn record(&mut self, ok: bool) -> u8 {
        self.failures = if ok { 0 } else { self.failures.saturating_add(1) };
        self.failures
    }
}
