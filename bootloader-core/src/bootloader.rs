// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bootload state machine.
//!
//! `None -> Bootloading -> Finished -> None`. The board calls [`Bootloader::poll`] once per
//! main-loop iteration with the flags its timer and button interrupts set; the returned
//! [`Action`] tells it whether to keep looping, jump to an application or power down.

use crate::config::{AppId, BootloaderConfig};
use crate::copy::copy_image;
use crate::error::{status_of, Error, Result};
use crate::extflash::SpiNorBus;
use crate::log::{debug, error, info, warn};
use crate::metadata::{AppMetadataEntry, MetadataManager};
use crate::region::overlaps;
use crate::router::{Operation, Router, MAX_PROTECTED};
use crate::session::{SessionState, TransferSession};
use crate::transport::{send_cobs, Transport, TransportError};
use crate::validate::{validate, validate_entry, IMAGE_CRC};
use consts::{IMAGE_FOOTER_SIZE, METADATA_APP_COUNT};
use core::ops::Range;
use embedded_storage::nor_flash::NorFlash;
use heapless::Vec;
use host_protocol::Bootloader as Cmd;
use host_protocol::{HostProtocolMessage, Status, COBS_MAX_MSG_SIZE, READ_CHUNK};
use postcard::accumulator::{CobsAccumulator, FeedResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Flags sampled by the board once per main-loop iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Inputs {
    /// The tick timer fired since the last iteration
    pub tick: bool,
    /// Level of the switch-over button
    pub button_pressed: bool,
    /// Out-of-band request to leave the bootloader
    pub alert: bool,
}

/// What the board has to do after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    Continue,
    /// Hand over to the image whose vector table is at `address`
    Execute { app_id: AppId, address: u32 },
    /// Nothing bootable and nobody came: lowest power mode until a physical reset
    Hibernate,
}

/// What the command handler wants done on the transport side.
enum Response<'a> {
    Reply(HostProtocolMessage<'a>),
    ResetLink,
}

/// Transport side: the pipe, the inbound frame buffer and the COBS accumulator.
struct Link<T> {
    transport: T,
    accumulator: CobsAccumulator<COBS_MAX_MSG_SIZE>,
    rx: [u8; COBS_MAX_MSG_SIZE],
}

impl<T: Transport> Link<T> {
    fn reply(&mut self, msg: &HostProtocolMessage<'_>) {
        if let Err(e) = send_cobs(&mut self.transport, msg) {
            warn!("reply dropped: {:?}", e);
        }
    }

    fn reset(&mut self) {
        self.accumulator = CobsAccumulator::new();
        self.transport.reset();
    }
}

/// Storage side: everything a command touches.
struct Engine<I, E, X> {
    config: BootloaderConfig,
    router: Router<I, E, X>,
    metadata: MetadataManager,
    session: TransferSession,
    /// Ticks spent without a session
    discovery_ticks: u32,
    /// Consecutive ticks the button was seen pressed
    held_ticks: u32,
}

pub struct Bootloader<I, E, X, T> {
    engine: Engine<I, E, X>,
    link: Link<T>,
}

impl<I, E, X, T> Bootloader<I, E, X, T>
where
    I: NorFlash,
    E: NorFlash,
    X: SpiNorBus,
    T: Transport,
{
    /// Repairs the metadata directory, protects the running and golden images and starts
    /// the transport.
    ///
    /// Fails when no consistent directory can be produced: nothing may be booted then.
    pub fn new(config: BootloaderConfig, mut router: Router<I, E, X>, mut transport: T) -> Result<Self> {
        let mut metadata = MetadataManager::new(&config);
        if let Err(e) = metadata.ensure_consistent(&mut router) {
            error!("metadata unrecoverable: {:?}", e);
            return Err(e);
        }
        transport.start()?;

        let mut engine = Engine {
            config,
            router,
            metadata,
            session: TransferSession::new(),
            discovery_ticks: 0,
            held_ticks: 0,
        };
        engine.refresh_protection();
        info!("bootloader {} ready", VERSION);

        Ok(Self {
            engine,
            link: Link {
                transport,
                accumulator: CobsAccumulator::new(),
                rx: [0; COBS_MAX_MSG_SIZE],
            },
        })
    }

    /// Runs one main-loop iteration.
    pub fn poll(&mut self, inputs: Inputs) -> Action {
        let engine = &mut self.engine;
        if inputs.tick {
            engine.tick(inputs.button_pressed);
        }

        self.service_link();

        let engine = &mut self.engine;
        let budget = engine.config.max_consecutive_failures;
        if engine.session.is_active() && budget > 0 && engine.session.failures >= budget {
            warn!("{} failed commands in a row, abandoning session", engine.session.failures);
            engine.abandon();
            self.link.reset();
            return Action::Continue;
        }

        if engine.session.state == SessionState::Bootloading
            && engine.session.idle_ticks >= engine.config.idle_timeout_ticks
        {
            warn!("session idle for {} ticks, abandoning", engine.session.idle_ticks);
            engine.abandon();
            self.link.reset();
            return Action::Continue;
        }

        if engine.session.state == SessionState::Finished {
            return match engine.finish() {
                Ok(Some(action)) => {
                    self.link.transport.stop();
                    action
                }
                Ok(None) => Action::Continue,
                Err(e) => {
                    self.notify(e.into());
                    Action::Continue
                }
            };
        }

        if engine.session.state == SessionState::None {
            let held = engine.config.button_hold_ticks > 0 && engine.held_ticks >= engine.config.button_hold_ticks;
            if inputs.alert || held {
                info!("manual switch-over requested");
                engine.held_ticks = 0;
                if let Some((app_id, address)) = engine.select_bootable() {
                    self.link.transport.stop();
                    return Action::Execute { app_id, address };
                }
                warn!("nothing bootable, staying in bootloader");
            }

            if engine.discovery_ticks >= engine.config.discovery_window_ticks {
                info!("discovery window closed");
                self.link.transport.stop();
                return match engine.select_bootable() {
                    Some((app_id, address)) => Action::Execute { app_id, address },
                    None => {
                        warn!("no valid application anywhere, hibernating");
                        Action::Hibernate
                    }
                };
            }
        }
        Action::Continue
    }

    /// Reads what the transport has and answers every complete frame.
    fn service_link(&mut self) {
        let link = &mut self.link;
        let n = match link.transport.read(&mut link.rx, self.engine.config.transport_timeout_ms) {
            Ok(n) => n,
            Err(TransportError::Timeout) => 0,
            Err(e) => {
                debug!("transport read: {:?}", e);
                0
            }
        };

        let mut window: &[u8] = &link.rx[..n];
        while !window.is_empty() {
            window = match link.accumulator.feed_ref::<HostProtocolMessage>(window) {
                FeedResult::Consumed => break,
                FeedResult::OverFull(rest) => {
                    warn!("frame larger than {} bytes dropped", COBS_MAX_MSG_SIZE);
                    self.engine.note_failure();
                    send_status(&mut link.transport, Status::ErrorLength);
                    rest
                }
                FeedResult::DeserError(rest) => {
                    warn!("undecodable frame dropped");
                    self.engine.note_failure();
                    send_status(&mut link.transport, Status::ErrorData);
                    rest
                }
                FeedResult::Success { data, remaining } => {
                    let mut read = [0u8; READ_CHUNK];
                    match self.engine.handle(data, &mut read) {
                        Response::Reply(reply) => {
                            if let Err(e) = send_cobs(&mut link.transport, &reply) {
                                warn!("reply dropped: {:?}", e);
                            }
                        }
                        Response::ResetLink => {
                            link.accumulator = CobsAccumulator::new();
                            link.transport.reset();
                            break;
                        }
                    }
                    remaining
                }
            };
        }
    }

    pub fn config(&self) -> &BootloaderConfig {
        &self.engine.config
    }

    pub fn session(&self) -> &TransferSession {
        &self.engine.session
    }

    pub fn metadata(&self) -> &MetadataManager {
        &self.engine.metadata
    }

    pub fn router(&self) -> &Router<I, E, X> {
        &self.engine.router
    }

    pub fn router_mut(&mut self) -> &mut Router<I, E, X> {
        &mut self.engine.router
    }

    pub fn transport(&self) -> &T {
        &self.link.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.link.transport
    }

    /// Boot target the bootloader would pick right now, relocating a staged image if needed.
    pub fn select_bootable(&mut self) -> Option<(AppId, u32)> {
        self.engine.select_bootable()
    }

    /// Sends a status outside of a command exchange.
    pub fn notify(&mut self, status: Status) {
        self.link.reply(&HostProtocolMessage::Bootloader(Cmd::Status(status)));
    }
}

fn send_status<T: Transport>(transport: &mut T, status: Status) {
    if let Err(e) = send_cobs(transport, &HostProtocolMessage::Bootloader(Cmd::Status(status))) {
        warn!("status dropped: {:?}", e);
    }
}

fn physical_span<I, E, X>(router: &Router<I, E, X>, app: AppId, entry: AppMetadataEntry) -> Range<u32>
where
    I: NorFlash,
    E: NorFlash,
    X: SpiNorBus,
{
    let start = router.translate(entry.start, app);
    start..start.saturating_add(entry.length).saturating_add(IMAGE_FOOTER_SIZE)
}

impl<I, E, X> Engine<I, E, X>
where
    I: NorFlash,
    E: NorFlash,
    X: SpiNorBus,
{
    fn tick(&mut self, button_pressed: bool) {
        self.held_ticks = if button_pressed { self.held_ticks.saturating_add(1) } else { 0 };
        match self.session.state {
            SessionState::None => self.discovery_ticks = self.discovery_ticks.saturating_add(1),
            _ => self.session.idle_ticks = self.session.idle_ticks.saturating_add(1),
        }
    }

    fn abandon(&mut self) {
        self.session.reset();
        self.discovery_ticks = 0;
    }

    fn note_failure(&mut self) {
        if self.session.is_active() {
            self.session.record(false);
        }
    }

    /// Reserved ranges, running image, metadata rows and every golden image that validates.
    fn refresh_protection(&mut self) {
        let mut ranges: Vec<Range<u32>, MAX_PROTECTED> = Vec::new();

        let running = match self.metadata.entry(self.config.running_app) {
            Ok(entry) if !entry.is_empty() => entry,
            _ => self.config.launcher_entry,
        };
        let fixed = self
            .config
            .reserved
            .iter()
            .cloned()
            .chain([physical_span(&self.router, self.config.running_app, running), self.metadata.rows()]);
        for range in fixed {
            if ranges.push(range.clone()).is_err() {
                error!("protection table full, {:#x}..{:#x} left writable", range.start, range.end);
            }
        }

        for &golden in self.config.golden.iter() {
            let Ok(entry) = self.metadata.entry(golden) else {
                continue;
            };
            match validate_entry(&mut self.router, golden, entry) {
                Ok(status) if status.is_valid() => {
                    if ranges.push(physical_span(&self.router, golden, entry)).is_err() {
                        warn!("no room to protect golden app {}", golden.0);
                    }
                }
                _ => warn!("golden app {} does not validate, left unprotected", golden.0),
            }
        }
        self.router.set_protected(&ranges);
    }

    /// A golden slot may start validating once the host rewrote it.
    fn reprotect_if_golden(&mut self, range: Range<u32>) {
        let touches_golden = self.config.golden.iter().any(|&golden| match self.metadata.entry(golden) {
            Ok(entry) if !entry.is_empty() => overlaps(&physical_span(&self.router, golden, entry), &range),
            _ => false,
        });
        if touches_golden {
            self.refresh_protection();
        }
    }

    fn handle<'m>(&mut self, msg: HostProtocolMessage<'_>, read: &'m mut [u8; READ_CHUNK]) -> Response<'m> {
        self.session.idle_ticks = 0;
        let cmd = match msg {
            HostProtocolMessage::Bootloader(cmd) => cmd,
            HostProtocolMessage::GetState => {
                return Response::Reply(HostProtocolMessage::AckState(self.session.state.into()));
            }
            HostProtocolMessage::Reset => {
                info!("host reset");
                self.abandon();
                return Response::ResetLink;
            }
            HostProtocolMessage::AckState(_) => return self.status(Err(Error::Unknown)),
        };

        match cmd {
            Cmd::EnterBootloader { product_id, app_id } => self.enter(product_id, app_id),
            Cmd::BootloaderVersion => Response::Reply(HostProtocolMessage::Bootloader(Cmd::AckBootloaderVersion {
                version: VERSION,
            })),
            _ if self.session.state == SessionState::None => {
                debug!("command outside of a session");
                Response::Reply(HostProtocolMessage::Bootloader(Cmd::Status(Status::ErrorUnknown)))
            }
            Cmd::Sync => {
                self.session.data_buffer.clear();
                self.status(Ok(()))
            }
            Cmd::SendData { data } => {
                let result = self.session.buffer(data);
                if result.is_err() {
                    self.session.data_buffer.clear();
                }
                self.status(result)
            }
            Cmd::ProgramData { address, crc, data } => {
                let result = self.program(address, crc, data);
                self.session.data_buffer.clear();
                self.status(result)
            }
            Cmd::EraseData { address } => {
                let result = self.erase(address);
                self.status(result)
            }
            Cmd::VerifyData { address, crc, data } => {
                let result = self.verify_data(address, crc, data);
                self.session.data_buffer.clear();
                self.status(result)
            }
            Cmd::ReadData { address, length } => match self.read(address, length, read) {
                Ok(data) => {
                    self.session.record(true);
                    Response::Reply(HostProtocolMessage::Bootloader(Cmd::AckReadData { data }))
                }
                Err(e) => self.status(Err(e)),
            },
            Cmd::VerifyApplication { app_id } => {
                let app = AppId(app_id);
                match validate(&mut self.router, &self.metadata, app) {
                    Ok(status) => {
                        self.session.record(true);
                        Response::Reply(HostProtocolMessage::Bootloader(Cmd::AckVerifyApplication {
                            app_id,
                            valid: status.is_valid(),
                        }))
                    }
                    Err(e) => self.status(Err(e)),
                }
            }
            Cmd::SetApplicationMetadata { app_id, start, length } => {
                let result = self.set_metadata(AppId(app_id), AppMetadataEntry::new(start, length));
                self.status(result)
            }
            Cmd::GetMetadata { app_id } => match self.metadata.entry(AppId(app_id)) {
                Ok(entry) => {
                    self.session.record(true);
                    Response::Reply(HostProtocolMessage::Bootloader(Cmd::AckMetadata {
                        app_id,
                        start: entry.start,
                        length: entry.length,
                    }))
                }
                Err(e) => self.status(Err(e)),
            },
            Cmd::ExitBootloader => {
                info!("transfer finished");
                self.session.state = SessionState::Finished;
                self.status(Ok(()))
            }
            _ => self.status(Err(Error::Unknown)),
        }
    }

    fn status<'m>(&mut self, result: Result<()>) -> Response<'m> {
        if self.session.is_active() {
            self.session.record(result.is_ok());
        }
        Response::Reply(HostProtocolMessage::Bootloader(Cmd::Status(status_of(result))))
    }

    fn enter<'m>(&mut self, product_id: u32, app_id: u8) -> Response<'m> {
        if product_id != self.config.product_id {
            warn!("wrong product id {:#x}", product_id);
            return self.status(Err(Error::Data));
        }
        if app_id as usize >= METADATA_APP_COUNT {
            return self.status(Err(Error::Address));
        }
        info!("session opened for app {}", app_id);
        self.session.begin(AppId(app_id));
        self.discovery_ticks = 0;
        Response::Reply(HostProtocolMessage::Bootloader(Cmd::AckEnterBootloader {
            product_id,
            version: VERSION,
        }))
    }

    fn session_app(&self) -> AppId {
        self.session.app_id.unwrap_or(self.config.app)
    }

    /// Buffered bytes plus `data`, checked against the packet checksum.
    fn assemble(&mut self, crc: u32, data: &[u8]) -> Result<()> {
        self.session.buffer(data)?;
        let computed = IMAGE_CRC.checksum(&self.session.data_buffer);
        if computed != crc {
            warn!("packet checksum {:#x}, expected {:#x}", computed, crc);
            return Err(Error::Data);
        }
        Ok(())
    }

    fn program(&mut self, address: u32, crc: u32, data: &[u8]) -> Result<()> {
        self.assemble(crc, data)?;
        let physical = self.router.translate(address, self.session_app());
        let len = self.session.data_buffer.len() as u32;
        self.router.check(physical, len, Operation::Program)?;
        debug!("programming {} bytes at {:#x}", len, physical);
        self.router.write_rows(physical, &self.session.data_buffer)?;
        self.reprotect_if_golden(physical..physical + len);
        Ok(())
    }

    fn erase(&mut self, address: u32) -> Result<()> {
        let physical = self.router.translate(address, self.session_app());
        let region = self.router.check(physical, 0, Operation::Erase)?;
        self.router.erase(physical, 0)?;
        self.reprotect_if_golden(physical..physical + region.row_size);
        Ok(())
    }

    fn verify_data(&mut self, address: u32, crc: u32, data: &[u8]) -> Result<()> {
        self.assemble(crc, data)?;
        let physical = self.router.translate(address, self.session_app());
        let expected = &self.session.data_buffer;
        self.router.check(physical, expected.len() as u32, Operation::Compare)?;

        let mut chunk = [0u8; READ_CHUNK];
        let mut at = physical;
        for part in expected.chunks(READ_CHUNK) {
            let buf = &mut chunk[..part.len()];
            self.router.read(at, buf)?;
            if buf != part {
                debug!("media differs near {:#x}", at);
                return Err(Error::Verify);
            }
            at += part.len() as u32;
        }
        Ok(())
    }

    fn read<'m>(&mut self, address: u32, length: u16, buf: &'m mut [u8; READ_CHUNK]) -> Result<&'m [u8]> {
        let len = length as usize;
        if len > READ_CHUNK {
            return Err(Error::Length);
        }
        let physical = self.router.translate(address, self.session_app());
        self.router.check(physical, len as u32, Operation::Read)?;
        self.router.read(physical, &mut buf[..len])?;
        Ok(&buf[..len])
    }

    fn set_metadata(&mut self, app: AppId, entry: AppMetadataEntry) -> Result<()> {
        if app == self.config.running_app || app == AppId::LAUNCHER || self.config.is_golden(app) {
            warn!("metadata of app {} is not host writable", app.0);
            return Err(Error::Address);
        }
        if !self.metadata.is_writable() {
            return Err(Error::Unknown);
        }
        self.metadata.set_entry(&mut self.router, app, entry)?;
        self.refresh_protection();
        Ok(())
    }

    /// Post-processing of a complete transfer. Returns the hand-off when the new image
    /// is ready to run, `None` when it was only stored. On error the attempt is discarded
    /// and the session starts over.
    fn finish(&mut self) -> Result<Option<Action>> {
        let app = self.session_app();
        self.session.reset();
        self.discovery_ticks = 0;
        self.refresh_protection();

        match validate(&mut self.router, &self.metadata, app) {
            Ok(status) if status.is_valid() => {}
            Ok(_) => {
                warn!("received app {} does not validate, keeping the resident one", app.0);
                return Err(Error::Verify);
            }
            Err(e) => {
                warn!("received app {} cannot be validated: {:?}", app.0, e);
                return Err(e);
            }
        }

        let target = if self.config.staging == Some(app) {
            self.relocate(app)?
        } else if app == self.config.app {
            app
        } else {
            info!("app {} stored, nothing to execute", app.0);
            return Ok(None);
        };
        Ok(self.entry_point(target).map(|address| Action::Execute { app_id: target, address }))
    }

    /// Moves a validated staged image into the execution slot and validates the result.
    fn relocate(&mut self, staged: AppId) -> Result<AppId> {
        let dest = self.config.app;
        if let Err(e) = copy_image(&mut self.router, &mut self.metadata, staged, dest) {
            error!("relocation of app {} failed: {:?}", staged.0, e);
            return Err(e);
        }
        self.refresh_protection();
        match validate(&mut self.router, &self.metadata, dest) {
            Ok(status) if status.is_valid() => Ok(dest),
            _ => {
                error!("relocated image does not validate");
                Err(Error::Verify)
            }
        }
    }

    fn entry_point(&self, app: AppId) -> Option<u32> {
        let entry = self.metadata.entry(app).ok()?;
        Some(self.router.translate(entry.start, app))
    }

    fn is_valid(&mut self, app: AppId) -> bool {
        matches!(validate(&mut self.router, &self.metadata, app), Ok(status) if status.is_valid())
    }

    /// Resident app, then the staged one, then golden apps in configured order.
    fn select_bootable(&mut self) -> Option<(AppId, u32)> {
        let app = self.config.app;
        if self.is_valid(app) {
            return self.entry_point(app).map(|address| (app, address));
        }
        if let Some(staged) = self.config.staging {
            if self.is_valid(staged) {
                if let Ok(target) = self.relocate(staged) {
                    return self.entry_point(target).map(|address| (target, address));
                }
            }
        }
        let golden = self.config.golden.clone();
        for app in golden {
            if self.is_valid(app) {
                info!("falling back to golden app {}", app.0);
                return self.entry_point(app).map(|address| (app, address));
            }
        }
        None
    }
}
