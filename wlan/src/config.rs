//! Device configuration.

use payload_pool::MAX_BUFFERS;

use crate::command::ChipVariant;
use crate::error::ConfigError;
use crate::irq::IrqReason;
use crate::rate::{RateMask, RateThresholds};
use crate::ring::Watermarks;

// ═══════════════════════════════════════════════════════════════════════════
// DEFAULTS
// ═══════════════════════════════════════════════════════════════════════════

pub const DEFAULT_TX_RING_SIZE: usize = 16;
pub const DEFAULT_RX_RING_SIZE: usize = 16;
/// Largest 802.11 MPDU plus device header, rounded.
pub const DEFAULT_BUFFER_SIZE: usize = 2400;
/// Smallest buffer that holds an 802.11 header plus FCS.
pub const MIN_BUFFER_SIZE: usize = 32;
pub const DEFAULT_TX_LOW_WATERMARK: usize = 3;
pub const DEFAULT_TX_HIGH_WATERMARK: usize = 5;
pub const DEFAULT_FALLBACK_THRESHOLD: u16 = 3;
pub const DEFAULT_STEPUP_THRESHOLD: u16 = 10;
pub const DEFAULT_COMMAND_TIMEOUT_US: u64 = 100_000;
pub const DEFAULT_COMMAND_POLL_US: u64 = 100;
pub const DEFAULT_BRING_UP_RETRIES: u32 = 3;
pub const DEFAULT_SHORT_RETRY_LIMIT: u8 = 7;
pub const DEFAULT_LONG_RETRY_LIMIT: u8 = 4;
pub const DEFAULT_CHANNEL: u8 = 1;
pub const DEFAULT_MAX_IRQ_LOOPS_PER_TICK: u32 = 200;
pub const DEFAULT_IRQ_TICK_US: u64 = 10_000;
pub const DEFAULT_STALL_STRIKES: u32 = 16;

/// How `execute` waits for a command completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandWaitMode {
    /// Sleep with the fast lock dropped between polls.
    #[default]
    ReleaseLock,
    /// Keep the fast lock for the whole wait and poll the reason register.
    /// Only for platforms where the interrupt handler cannot run
    /// concurrently with the waiter.
    HoldLock,
}

/// Device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub variant: ChipVariant,
    pub tx_ring_size: usize,
    pub rx_ring_size: usize,
    /// Payload buffer size, also the largest frame accepted.
    pub buffer_size: usize,
    pub tx_watermarks: Watermarks,
    pub rate_thresholds: RateThresholds,
    /// Rates for peers without their own mask.
    pub default_rates: RateMask,
    pub command_timeout_us: u64,
    /// First poll interval of a command wait.
    pub command_poll_us: u64,
    /// Firmware probe attempts before giving up.
    pub bring_up_retries: u32,
    pub short_retry_limit: u8,
    pub long_retry_limit: u8,
    pub channel: u8,
    /// Top-half runs per tick before interrupts are disabled.
    pub max_irq_loops_per_tick: u32,
    pub irq_tick_us: u64,
    /// Consecutive stalled full-ring submissions before the Tx ring is
    /// forcibly reset.
    pub stall_strikes_before_reset: u32,
    /// Reasons left unmasked during operation.
    pub irq_enable: IrqReason,
    pub command_wait: CommandWaitMode,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            variant: ChipVariant::default(),
            tx_ring_size: DEFAULT_TX_RING_SIZE,
            rx_ring_size: DEFAULT_RX_RING_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            tx_watermarks: Watermarks {
                low: DEFAULT_TX_LOW_WATERMARK,
                high: DEFAULT_TX_HIGH_WATERMARK,
            },
            rate_thresholds: RateThresholds {
                fallback: DEFAULT_FALLBACK_THRESHOLD,
                stepup: DEFAULT_STEPUP_THRESHOLD,
            },
            default_rates: RateMask::CCK,
            command_timeout_us: DEFAULT_COMMAND_TIMEOUT_US,
            command_poll_us: DEFAULT_COMMAND_POLL_US,
            bring_up_retries: DEFAULT_BRING_UP_RETRIES,
            short_retry_limit: DEFAULT_SHORT_RETRY_LIMIT,
            long_retry_limit: DEFAULT_LONG_RETRY_LIMIT,
            channel: DEFAULT_CHANNEL,
            max_irq_loops_per_tick: DEFAULT_MAX_IRQ_LOOPS_PER_TICK,
            irq_tick_us: DEFAULT_IRQ_TICK_US,
            stall_strikes_before_reset: DEFAULT_STALL_STRIKES,
            irq_enable: IrqReason::DEFAULT_ENABLED,
            command_wait: CommandWaitMode::default(),
        }
    }
}

impl DeviceConfig {
    /// Configuration for `variant` with default values.
    pub fn for_variant(variant: ChipVariant) -> Self {
        Self {
            variant,
            ..Self::default()
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for size in [self.tx_ring_size, self.rx_ring_size] {
            if size == 0 || size > MAX_BUFFERS {
                return Err(ConfigError::RingSize(size));
            }
        }
        if self.buffer_size < MIN_BUFFER_SIZE || self.buffer_size > u16::MAX as usize {
            return Err(ConfigError::BufferSize(self.buffer_size));
        }
        let wm = self.tx_watermarks;
        if !wm.fits(self.tx_ring_size) {
            return Err(ConfigError::Watermarks {
                low: wm.low,
                high: wm.high,
            });
        }
        if self.rate_thresholds.fallback == 0 || self.rate_thresholds.stepup == 0 {
            return Err(ConfigError::Threshold);
        }
        if self.default_rates.is_empty() {
            return Err(ConfigError::EmptyRateMask);
        }
        if self.command_timeout_us == 0
            || self.command_poll_us == 0
            || self.irq_tick_us == 0
            || self.max_irq_loops_per_tick == 0
            || self.bring_up_retries == 0
            || self.stall_strikes_before_reset == 0
        {
            return Err(ConfigError::Timing);
        }
        Ok(())
    }
}
