//! Interrupt reasons and the top-half/bottom-half bookkeeping.
//!
//! The top half runs in interrupt context with the fast lock held and does
//! only non-blocking work (reaping, completion flagging). Anything heavier
//! is recorded in [`DeferredJobs`] and drained by the bottom half.

bitflags::bitflags! {
    /// Interrupt reason register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IrqReason: u16 {
        const RX_DATA = 0x0001;
        const TX_COMPLETE = 0x0002;
        const TX_XFER = 0x0004;
        const RX_COMPLETE = 0x0008;
        const DTIM = 0x0010;
        const BEACON = 0x0020;
        const TIMER = 0x0040;
        const KEY_NOT_FOUND = 0x0080;
        const IV_ICV_FAILURE = 0x0100;
        const CMD_COMPLETE = 0x0200;
        const INFO = 0x0400;
        const OVERFLOW = 0x0800;
        const PROCESS_ERROR = 0x1000;
        const SCAN_COMPLETE = 0x2000;
        const FCS_THRESHOLD = 0x4000;
        const UNKNOWN = 0x8000;
    }
}

impl IrqReason {
    /// All-ones read: the device is gone (hot-unplug, bus error).
    pub const DEVICE_ABSENT: u16 = 0xffff;

    /// Any Tx-side completion.
    pub const TX_ANY: IrqReason = IrqReason::TX_COMPLETE.union(IrqReason::TX_XFER);

    /// Any Rx-side completion.
    pub const RX_ANY: IrqReason = IrqReason::RX_DATA.union(IrqReason::RX_COMPLETE);

    /// Reasons enabled during normal operation.
    pub const DEFAULT_ENABLED: IrqReason = IrqReason::TX_ANY
        .union(IrqReason::RX_ANY)
        .union(IrqReason::CMD_COMPLETE)
        .union(IrqReason::SCAN_COMPLETE)
        .union(IrqReason::FCS_THRESHOLD)
        .union(IrqReason::OVERFLOW)
        .union(IrqReason::PROCESS_ERROR);
}

bitflags::bitflags! {
    /// Work deferred to the bottom half.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeferredJobs: u8 {
        /// A ring broke the ownership protocol; reset both rings.
        const RING_RECOVERY = 0x01;
        /// FCS error rate crossed the threshold; recalibrate the radio.
        const RADIO_RECALIBRATE = 0x02;
        /// Firmware finished a scan; tell the upper layer.
        const SCAN_COMPLETE = 0x04;
    }
}

/// Dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IrqState {
    #[default]
    Idle,
    TopHalfRunning,
    BottomHalfScheduled,
}

/// Top half detected more interrupts in one tick than allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptStorm {
    pub loops: u32,
}

/// Interrupt bookkeeping, lives under the fast lock.
#[derive(Debug)]
pub struct Dispatcher {
    state: IrqState,
    pending: DeferredJobs,
    enabled: bool,
    max_loops_per_tick: u32,
    tick_us: u64,
    tick_start_us: u64,
    loops_in_tick: u32,
}

impl Dispatcher {
    pub fn new(max_loops_per_tick: u32, tick_us: u64) -> Self {
        Self {
            state: IrqState::Idle,
            pending: DeferredJobs::empty(),
            enabled: false,
            max_loops_per_tick,
            tick_us,
            tick_start_us: 0,
            loops_in_tick: 0,
        }
    }

    pub fn state(&self) -> IrqState {
        self.state
    }

    pub fn pending(&self) -> DeferredJobs {
        self.pending
    }

    /// Whether interrupt delivery is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.loops_in_tick = 0;
    }

    /// Enter the top half at `now_us`.
    ///
    /// Counts top-half runs per tick; exceeding the limit disables
    /// delivery and reports the storm. The caller masks the device,
    /// still handles the reasons it already acknowledged and leaves
    /// through [`exit_top_half`](Self::exit_top_half) either way.
    pub fn enter_top_half(&mut self, now_us: u64) -> Result<(), InterruptStorm> {
        if now_us.saturating_sub(self.tick_start_us) >= self.tick_us {
            self.tick_start_us = now_us;
            self.loops_in_tick = 0;
        }
        self.loops_in_tick += 1;
        self.state = IrqState::TopHalfRunning;
        if self.loops_in_tick > self.max_loops_per_tick {
            self.enabled = false;
            return Err(InterruptStorm {
                loops: self.loops_in_tick,
            });
        }
        Ok(())
    }

    /// Leave the top half. Returns true if the bottom half must run.
    pub fn exit_top_half(&mut self) -> bool {
        self.state = if self.pending.is_empty() {
            IrqState::Idle
        } else {
            IrqState::BottomHalfScheduled
        };
        self.state == IrqState::BottomHalfScheduled
    }

    pub fn defer(&mut self, jobs: DeferredJobs) {
        if !jobs.is_empty() {
            log::trace!("irq: defer {:?}", jobs);
        }
        self.pending |= jobs;
        if self.state == IrqState::Idle && !self.pending.is_empty() {
            self.state = IrqState::BottomHalfScheduled;
        }
    }

    /// Clear `job` if pending. The bit is cleared before the job runs so
    /// a re-arm during execution schedules another pass.
    pub fn claim(&mut self, job: DeferredJobs) -> bool {
        if self.pending.contains(job) {
            self.pending.remove(job);
            true
        } else {
            false
        }
    }

    /// Bottom half finished one pass.
    pub fn finish_bottom_half(&mut self) {
        if self.state != IrqState::TopHalfRunning {
            self.state = if self.pending.is_empty() {
                IrqState::Idle
            } else {
                IrqState::BottomHalfScheduled
            };
        }
    }

    /// Drop pending work and counters (teardown).
    pub fn reset(&mut self) {
        self.state = IrqState::Idle;
        self.pending = DeferredJobs::empty();
        self.enabled = false;
        self.loops_in_tick = 0;
    }
}
