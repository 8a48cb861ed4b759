//! Device context.
//!
//! All mutable state lives in one [`Core`] behind the fast lock
//! (`spin::Mutex`). Multi-step sequences (bring-up, teardown, every
//! command) additionally hold the sequencing lock, which may be held
//! across sleeps; the fast lock never is, except in
//! [`CommandWaitMode::HoldLock`].
//!
//! Upper-layer callbacks run after the fast lock is released.
//!
//! # Lock order
//! sequencing lock, then fast lock. The top half only takes the fast lock.

use alloc::vec::Vec;
use core::mem;

use spin::Mutex;

use crate::bus::{Bus, Reg};
use crate::command::{
    self, ChannelState, Command, CommandChannel, FirmwareRevision, FirmwareStatus, LengthTable,
    Parameter, IE_HEADER_LEN, MAILBOX_PARAM_SIZE,
};
use crate::config::{CommandWaitMode, DeviceConfig};
use crate::error::{BringUpError, CommandError, ConfigError, RingError, TxError};
use crate::irq::{DeferredJobs, Dispatcher, IrqReason, IrqState};
use crate::rate::{PeerRateState, RateController, RateMask};
use crate::reaper::{self, RxFrame};
use crate::ring::{ControlFlags, DescriptorRing, Rx, Tx};
use crate::stats::Stats;
use crate::types::{FlowState, FrameSink, PeerId};
use crate::wait::{BoundedWait, WaitTimeout};

/// Mask register value that suppresses every reason.
const IRQ_MASK_ALL: u32 = 0xffff;

/// What one top-half run saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrqOutcome {
    /// Reasons read (and acknowledged). Empty if the interrupt wasn't ours.
    pub reason: IrqReason,
    /// Deferred work is pending; schedule [`Device::run_deferred`].
    pub bottom_half: bool,
}

struct Rings {
    tx: DescriptorRing<Tx>,
    rx: DescriptorRing<Rx>,
}

/// Everything guarded by the fast lock.
struct Core {
    rings: Option<Rings>,
    channel: CommandChannel,
    rates: RateController,
    irq: Dispatcher,
    stats: Stats,
    /// Consecutive full-ring submissions where reaping freed nothing.
    stall_strikes: u32,
    up: bool,
}

impl Core {
    fn take_flow_event(&mut self) -> Option<FlowState> {
        self.rings.as_mut().and_then(|r| r.tx.take_flow_event())
    }
}

/// One adapter.
pub struct Device<B: Bus, S: FrameSink> {
    bus: B,
    sink: S,
    config: DeviceConfig,
    lengths: LengthTable,
    core: Mutex<Core>,
    seq: Mutex<()>,
}

impl<B: Bus, S: FrameSink> Device<B, S> {
    /// Create a device context. Nothing touches the hardware until
    /// [`bring_up`](Self::bring_up).
    pub fn new(bus: B, sink: S, config: DeviceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let core = Core {
            rings: None,
            channel: CommandChannel::new(),
            rates: RateController::new(config.rate_thresholds, config.default_rates),
            irq: Dispatcher::new(config.max_irq_loops_per_tick, config.irq_tick_us),
            stats: Stats::default(),
            stall_strikes: 0,
            up: false,
        };
        Ok(Self {
            bus,
            sink,
            lengths: LengthTable::for_variant(config.variant),
            config,
            core: Mutex::new(core),
            seq: Mutex::new(()),
        })
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Element lengths for this chip.
    pub fn lengths(&self) -> &LengthTable {
        &self.lengths
    }

    pub fn is_up(&self) -> bool {
        self.core.lock().up
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════

    /// Build the rings, probe and configure the firmware, start Rx/Tx and
    /// unmask interrupts.
    ///
    /// # Returns
    /// The firmware revision on success. `DeviceUnusable` if the firmware
    /// never answered within `bring_up_retries` probes.
    pub fn bring_up(&self) -> Result<FirmwareRevision, BringUpError> {
        let _seq = self.seq.lock();
        if self.is_up() {
            log::debug!("bring-up: already up, restarting");
            self.teardown_locked();
        }

        self.bus.write_reg(Reg::IrqMask, IRQ_MASK_ALL);

        let cfg = &self.config;
        let tx = DescriptorRing::<Tx>::new(cfg.tx_ring_size, cfg.buffer_size, |host, len| {
            self.bus.map_buffer(host, len)
        })?
        .with_watermarks(cfg.tx_watermarks);
        let rx = DescriptorRing::<Rx>::new(cfg.rx_ring_size, cfg.buffer_size, |host, len| {
            self.bus.map_buffer(host, len)
        })?;
        self.bus.attach_rings(tx.shared(), rx.shared());

        {
            let mut core = self.core.lock();
            core.rings = Some(Rings { tx, rx });
            core.channel.reset();
            core.irq.reset();
            core.stall_strikes = 0;
        }

        match self.configure_firmware() {
            Ok(revision) => {
                let mut core = self.core.lock();
                core.irq.set_enabled(true);
                core.up = true;
                self.bus
                    .write_reg(Reg::IrqMask, u32::from(!cfg.irq_enable.bits()));
                log::info!(
                    "{:?}: up, firmware {} (hw {:#010x})",
                    self.lengths.variant(),
                    revision.version,
                    revision.hardware_id
                );
                Ok(revision)
            }
            Err(e) => {
                log::error!("bring-up failed: {}", e);
                self.release_rings();
                Err(e)
            }
        }
    }

    /// Stop Rx/Tx, mask interrupts and drop both rings.
    pub fn teardown(&self) {
        let _seq = self.seq.lock();
        self.teardown_locked();
    }

    fn teardown_locked(&self) {
        let was_up = {
            let mut core = self.core.lock();
            mem::replace(&mut core.up, false)
        };
        if was_up {
            for cmd in [Command::DisableTx, Command::DisableRx] {
                if let Err(e) = self.execute_locked(cmd, &[], self.config.command_timeout_us) {
                    log::warn!("teardown: {:?} failed: {}", cmd, e);
                }
            }
        }
        self.release_rings();
        log::info!("{:?}: down", self.lengths.variant());
    }

    fn release_rings(&self) {
        self.bus.write_reg(Reg::IrqMask, IRQ_MASK_ALL);
        let rings = {
            let mut core = self.core.lock();
            core.irq.reset();
            core.channel.reset();
            core.rates.clear_in_flight();
            core.up = false;
            core.rings.take()
        };
        if let Some(mut rings) = rings {
            rings.tx.emergency_reset();
            rings.rx.emergency_reset();
            self.bus.detach_rings();
        }
    }

    fn configure_firmware(&self) -> Result<FirmwareRevision, BringUpError> {
        let revision = self.probe_firmware()?;
        let timeout = self.config.command_timeout_us;

        let settings: [(Parameter, &[u8]); 3] = [
            (Parameter::ShortRetryLimit, &[self.config.short_retry_limit]),
            (Parameter::LongRetryLimit, &[self.config.long_retry_limit]),
            // Rate control runs on the host.
            (Parameter::RateFallback, &[0]),
        ];
        for (param, data) in settings {
            let request = command::configure_request(&self.lengths, param, data)?;
            self.execute_locked(Command::Configure, &request, timeout)?;
        }

        let posted = {
            let mut core = self.core.lock();
            match core.rings.as_mut() {
                Some(rings) => rings.rx.fill()?,
                None => 0,
            }
        };
        log::debug!("bring-up: {} rx buffers posted", posted);

        self.execute_locked(Command::EnableRx, &[self.config.channel], timeout)?;
        self.execute_locked(Command::EnableTx, &[self.config.channel], timeout)?;
        Ok(revision)
    }

    fn probe_firmware(&self) -> Result<FirmwareRevision, BringUpError> {
        let request = command::interrogate_request(&self.lengths, Parameter::FirmwareRevision)?;
        let mut attempts = 0;
        while attempts < self.config.bring_up_retries {
            attempts += 1;
            match self.execute_locked(Command::Interrogate, &request, self.config.command_timeout_us) {
                Ok(response) => {
                    let body = response.get(IE_HEADER_LEN..).unwrap_or_default();
                    return Ok(FirmwareRevision::parse(body).unwrap_or_default());
                }
                Err(CommandError::Timeout) => {
                    log::warn!(
                        "bring-up: probe {}/{} timed out",
                        attempts,
                        self.config.bring_up_retries
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(BringUpError::DeviceUnusable { attempts })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // FRAMES
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue one frame for `peer`.
    ///
    /// Never blocks. A full ring is reaped once before the frame is
    /// refused; a ring that stays stuck for `stall_strikes_before_reset`
    /// attempts is forcibly reset. Refused frames are counted as dropped.
    pub fn submit_tx(&self, peer: PeerId, frame: &[u8]) -> Result<(), TxError> {
        let mut core = self.core.lock();
        let result = self.submit_locked(&mut core, peer, frame);
        if let Err(e) = result {
            core.stats.tx_dropped += 1;
            log::trace!("tx: drop frame for {:?}: {}", peer, e);
        }
        let flow = core.take_flow_event();
        drop(core);

        if let Some(state) = flow {
            self.sink.on_tx_flow(state);
        }
        result
    }

    fn submit_locked(&self, core: &mut Core, peer: PeerId, frame: &[u8]) -> Result<(), TxError> {
        if !core.up {
            return Err(TxError::DeviceNotReady);
        }
        let Core {
            rings,
            rates,
            stats,
            stall_strikes,
            ..
        } = core;
        let Some(rings) = rings.as_mut() else {
            return Err(TxError::DeviceNotReady);
        };
        let max = rings.tx.buffer_size();
        if frame.len() > max {
            return Err(TxError::FrameTooLarge {
                len: frame.len(),
                max,
            });
        }

        let rate = rates.tx_rate(&peer);
        let mut reaped_once = false;
        loop {
            match rings
                .tx
                .try_produce(frame, ControlFlags::FIRST_FRAGMENT, rate, Some(peer))
            {
                Ok(_) => {
                    rates.note_submitted(&peer);
                    stats.tx_submitted += 1;
                    *stall_strikes = 0;
                    self.bus.write_reg(Reg::TxDoorbell, 1);
                    return Ok(());
                }
                Err(RingError::Full) if !reaped_once => {
                    reaped_once = true;
                    let summary = reaper::reap_tx(&mut rings.tx, rates, stats);
                    if let Some(fault) = summary.fault {
                        log::error!("tx: {}", fault);
                        stats.protocol_violations += 1;
                        reset_tx(&mut rings.tx, rates, stats);
                        return Err(TxError::RingReset);
                    }
                    if summary.reaped > 0 {
                        *stall_strikes = 0;
                        continue;
                    }
                    *stall_strikes += 1;
                    if *stall_strikes < self.config.stall_strikes_before_reset {
                        return Err(TxError::RingFull);
                    }
                    log::warn!(
                        "tx: ring stalled for {} submissions, forcing reset",
                        stall_strikes
                    );
                    *stall_strikes = 0;
                    reset_tx(&mut rings.tx, rates, stats);
                }
                Err(RingError::Full) => return Err(TxError::RingFull),
                Err(e) => {
                    log::error!("tx: {}", e);
                    stats.protocol_violations += 1;
                    reset_tx(&mut rings.tx, rates, stats);
                    return Err(TxError::RingReset);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // INTERRUPTS
    // ═══════════════════════════════════════════════════════════════════════

    /// Top half. Call from the interrupt handler.
    ///
    /// Reads and acknowledges the reason register, reaps both rings,
    /// flags command completion and records heavier work for
    /// [`run_deferred`](Self::run_deferred). Received frames and flow
    /// changes are delivered after the fast lock is dropped.
    pub fn handle_interrupt(&self) -> IrqOutcome {
        let mut frames = Vec::new();
        let mut core = self.core.lock();
        let outcome = self.top_half(&mut core, &mut frames);
        let flow = core.take_flow_event();
        drop(core);

        for frame in &frames {
            self.sink.on_rx_frame(&frame.data, frame.meta);
        }
        if let Some(state) = flow {
            self.sink.on_tx_flow(state);
        }
        outcome
    }

    fn top_half(&self, core: &mut Core, frames: &mut Vec<RxFrame>) -> IrqOutcome {
        if !core.irq.is_enabled() {
            return IrqOutcome::default();
        }
        let raw = self.bus.read_reg(Reg::IrqStatus) as u16;
        if raw == 0 || raw == IrqReason::DEVICE_ABSENT {
            return IrqOutcome::default();
        }
        self.bus.write_reg(Reg::IrqAck, u32::from(raw));
        let reason = IrqReason::from_bits_retain(raw);

        // A storm masks further delivery, but the reasons just
        // acknowledged are gone from the register and are handled below.
        if let Err(storm) = core.irq.enter_top_half(self.bus.now_us()) {
            self.bus.write_reg(Reg::IrqMask, IRQ_MASK_ALL);
            core.stats.irq_storms += 1;
            log::error!(
                "irq: {} interrupts within one tick, disabling interrupts",
                storm.loops
            );
        }
        log::trace!("irq: {:?}", reason);

        let Core {
            rings,
            rates,
            stats,
            channel,
            irq,
            ..
        } = core;

        if let Some(rings) = rings.as_mut() {
            let mut fault = None;
            if reason.intersects(IrqReason::TX_ANY) {
                fault = reaper::reap_tx(&mut rings.tx, rates, stats).fault;
            }
            if reason.intersects(IrqReason::RX_ANY) {
                fault = fault.or(reaper::reap_rx(&mut rings.rx, stats, frames).fault);
            }
            if fault.is_some() {
                stats.protocol_violations += 1;
                irq.defer(DeferredJobs::RING_RECOVERY);
            }
        }

        if reason.contains(IrqReason::CMD_COMPLETE) && !channel.flag_complete() {
            log::debug!("irq: completion with no command outstanding");
        }
        if reason.contains(IrqReason::SCAN_COMPLETE) {
            irq.defer(DeferredJobs::SCAN_COMPLETE);
        }
        if reason.contains(IrqReason::FCS_THRESHOLD) {
            irq.defer(DeferredJobs::RADIO_RECALIBRATE);
        }
        if reason.contains(IrqReason::OVERFLOW) {
            log::warn!("irq: rx overflow");
        }
        if reason.contains(IrqReason::PROCESS_ERROR) {
            log::warn!("irq: firmware process error");
        }

        IrqOutcome {
            reason,
            bottom_half: irq.exit_top_half(),
        }
    }

    /// Bottom half. Runs each pending job at most once and returns the
    /// jobs it ran.
    pub fn run_deferred(&self) -> DeferredJobs {
        let mut ran = DeferredJobs::empty();
        for job in DeferredJobs::all().iter() {
            if !self.core.lock().irq.claim(job) {
                continue;
            }
            ran |= job;
            if job == DeferredJobs::RING_RECOVERY {
                self.recover_rings();
            } else if job == DeferredJobs::RADIO_RECALIBRATE {
                self.recalibrate();
            } else if job == DeferredJobs::SCAN_COMPLETE {
                self.sink.on_scan_complete();
            }
        }
        self.core.lock().irq.finish_bottom_half();
        ran
    }

    /// Re-enable interrupt delivery after a storm shut it off.
    pub fn rearm_interrupts(&self) {
        let mut core = self.core.lock();
        if !core.up || core.irq.is_enabled() {
            return;
        }
        core.irq.set_enabled(true);
        self.bus
            .write_reg(Reg::IrqMask, u32::from(!self.config.irq_enable.bits()));
        log::info!("irq: re-armed");
    }

    fn recover_rings(&self) {
        let mut core = self.core.lock();
        let Core {
            rings,
            rates,
            stats,
            ..
        } = &mut *core;
        let Some(rings) = rings.as_mut() else {
            return;
        };
        log::warn!("recovery: resetting both rings");
        reset_tx(&mut rings.tx, rates, stats);
        rings.rx.emergency_reset();
        if let Err(e) = rings.rx.fill() {
            log::error!("recovery: rx refill failed: {}", e);
        }
        let flow = core.take_flow_event();
        drop(core);

        if let Some(state) = flow {
            self.sink.on_tx_flow(state);
        }
    }

    fn recalibrate(&self) {
        let _seq = self.seq.lock();
        if !self.is_up() {
            return;
        }
        match self.execute_locked(Command::RadioRecalibrate, &[], self.config.command_timeout_us) {
            Ok(_) => log::info!("radio recalibrated"),
            Err(e) => log::warn!("radio recalibration failed: {}", e),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // COMMANDS
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one firmware command and return its response parameters.
    ///
    /// Commands are serialized; the channel is idle again when this
    /// returns, whatever the outcome.
    pub fn execute(
        &self,
        cmd: Command,
        params: &[u8],
        timeout_us: u64,
    ) -> Result<Vec<u8>, CommandError> {
        let _seq = self.seq.lock();
        if !self.is_up() {
            return Err(CommandError::DeviceNotReady);
        }
        self.execute_locked(cmd, params, timeout_us)
    }

    /// Interrogate `param` and return its payload (header stripped).
    pub fn get_parameter(&self, param: Parameter) -> Result<Vec<u8>, CommandError> {
        let request = command::interrogate_request(&self.lengths, param)?;
        let response = self.execute(Command::Interrogate, &request, self.config.command_timeout_us)?;
        Ok(response
            .get(IE_HEADER_LEN..)
            .map(<[u8]>::to_vec)
            .unwrap_or_default())
    }

    /// Configure `param` with `data` (zero-padded to the element length).
    pub fn set_parameter(&self, param: Parameter, data: &[u8]) -> Result<(), CommandError> {
        let request = command::configure_request(&self.lengths, param, data)?;
        self.execute(Command::Configure, &request, self.config.command_timeout_us)?;
        Ok(())
    }

    /// Caller holds the sequencing lock.
    fn execute_locked(
        &self,
        cmd: Command,
        params: &[u8],
        timeout_us: u64,
    ) -> Result<Vec<u8>, CommandError> {
        if params.len() > MAILBOX_PARAM_SIZE {
            return Err(CommandError::PayloadTooLarge {
                len: params.len(),
                max: MAILBOX_PARAM_SIZE,
            });
        }
        let response_len = cmd.response_len(params, &self.lengths);

        {
            let mut core = self.core.lock();
            core.channel.begin(cmd)?;
            command::post_request(&self.bus, cmd, params);
            self.bus.write_reg(Reg::CommandDoorbell, 1);
        }
        log::debug!("cmd: {:?} issued ({} bytes)", cmd, params.len());

        let wait = BoundedWait::new(timeout_us, self.config.command_poll_us);
        match self.config.command_wait {
            CommandWaitMode::ReleaseLock => {
                let waited = wait.until(&self.bus, || {
                    let mut core = self.core.lock();
                    self.poll_completion(&mut core, false)
                });
                let mut core = self.core.lock();
                self.finish_command(&mut core, cmd, waited, response_len)
            }
            CommandWaitMode::HoldLock => {
                let mut core = self.core.lock();
                let waited = wait.until(&self.bus, || self.poll_completion(&mut core, true));
                self.finish_command(&mut core, cmd, waited, response_len)
            }
        }
    }

    /// Whether the outstanding command has completed.
    ///
    /// The reason register is polled directly when the top half cannot
    /// deliver the completion: interrupts are off, or the caller holds the
    /// fast lock.
    fn poll_completion(&self, core: &mut Core, hold_lock: bool) -> bool {
        if core.channel.is_complete() {
            return true;
        }
        if !hold_lock && core.irq.is_enabled() {
            return false;
        }
        let raw = self.bus.read_reg(Reg::IrqStatus) as u16;
        if raw == IrqReason::DEVICE_ABSENT {
            return false;
        }
        if IrqReason::from_bits_retain(raw).contains(IrqReason::CMD_COMPLETE) {
            self.bus
                .write_reg(Reg::IrqAck, u32::from(IrqReason::CMD_COMPLETE.bits()));
            return core.channel.flag_complete();
        }
        false
    }

    fn finish_command(
        &self,
        core: &mut Core,
        cmd: Command,
        waited: Result<u64, WaitTimeout>,
        response_len: usize,
    ) -> Result<Vec<u8>, CommandError> {
        let result = match waited {
            Err(timeout) => {
                core.stats.command_timeouts += 1;
                log::warn!("cmd: {:?} timed out after {} us", cmd, timeout.elapsed_us);
                Err(CommandError::Timeout)
            }
            Ok(elapsed) => match command::read_status(&self.bus) {
                FirmwareStatus::Success => {
                    log::debug!("cmd: {:?} done in {} us", cmd, elapsed);
                    Ok(command::read_response(&self.bus, response_len))
                }
                status => {
                    core.stats.firmware_errors += 1;
                    log::warn!("cmd: {:?} failed: {}", cmd, status);
                    Err(CommandError::Firmware(status))
                }
            },
        };
        core.channel.reset();
        result
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PEERS & STATS
    // ═══════════════════════════════════════════════════════════════════════

    /// Start rate control for `peer`. An empty mask means the default rates.
    pub fn add_peer(&self, peer: PeerId, allowed: RateMask) {
        self.core.lock().rates.add_peer(peer, allowed);
    }

    pub fn forget_peer(&self, peer: &PeerId) -> bool {
        self.core.lock().rates.forget_peer(peer).is_some()
    }

    pub fn set_allowed_rates(&self, peer: &PeerId, allowed: RateMask) -> bool {
        self.core.lock().rates.set_allowed(peer, allowed)
    }

    pub fn peer_rates(&self, peer: &PeerId) -> Option<PeerRateState> {
        self.core.lock().rates.peer(peer).cloned()
    }

    /// Rate the next frame to `peer` would go out at.
    pub fn tx_rate(&self, peer: &PeerId) -> RateMask {
        self.core.lock().rates.tx_rate(peer)
    }

    pub fn stats(&self) -> Stats {
        self.core.lock().stats
    }

    /// Free Tx slots, `None` before bring-up.
    pub fn tx_free_slots(&self) -> Option<usize> {
        self.core.lock().rings.as_ref().map(|r| r.tx.free_count())
    }

    /// Whether the Tx queue is currently stopped by backpressure.
    pub fn tx_stopped(&self) -> bool {
        self.core
            .lock()
            .rings
            .as_ref()
            .map_or(false, |r| r.tx.is_stopped())
    }

    pub fn channel_state(&self) -> ChannelState {
        self.core.lock().channel.state()
    }

    pub fn irq_state(&self) -> IrqState {
        self.core.lock().irq.state()
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.core.lock().irq.is_enabled()
    }

    pub fn pending_jobs(&self) -> DeferredJobs {
        self.core.lock().irq.pending()
    }

    /// Schedule deferred work by hand (e.g. a watchdog requesting ring
    /// recovery).
    pub fn defer(&self, jobs: DeferredJobs) {
        self.core.lock().irq.defer(jobs);
    }
}

/// Emergency-reset the Tx ring and forget per-peer in-flight counts.
fn reset_tx(tx: &mut DescriptorRing<Tx>, rates: &mut RateController, stats: &mut Stats) {
    tx.emergency_reset();
    rates.clear_in_flight();
    stats.emergency_resets += 1;
}
