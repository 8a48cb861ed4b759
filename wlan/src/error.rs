//! Error types for the data and control plane.

use core::fmt;

use payload_pool::PoolError;

use crate::command::FirmwareStatus;

/// Ring has no free slot. Expected under load; the caller retries later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

impl fmt::Display for RingFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor ring full")
    }
}

/// Descriptor ring errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// No free slot.
    Full,
    /// Slot ownership byte is neither host nor device.
    Corrupt {
        /// Slot index.
        index: usize,
        /// Raw ownership byte observed.
        raw: u8,
    },
    /// Paired payload buffer refused the operation.
    Pool(PoolError),
}

impl From<PoolError> for RingError {
    fn from(e: PoolError) -> Self {
        RingError::Pool(e)
    }
}

impl From<RingFull> for RingError {
    fn from(_: RingFull) -> Self {
        RingError::Full
    }
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "Descriptor ring full"),
            Self::Corrupt { index, raw } => {
                write!(f, "Slot {} has invalid ownership byte {:#04x}", index, raw)
            }
            Self::Pool(e) => write!(f, "Payload pool: {}", e),
        }
    }
}

/// Frame submission errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// Tx ring is full, try again after completions are reaped.
    RingFull,
    /// Frame does not fit one payload buffer.
    FrameTooLarge {
        /// Frame length.
        len: usize,
        /// Buffer capacity.
        max: usize,
    },
    /// Device not brought up, or torn down.
    DeviceNotReady,
    /// Tx ring broke the ownership protocol and was reset; frame dropped.
    RingReset,
}

impl From<RingFull> for TxError {
    fn from(_: RingFull) -> Self {
        TxError::RingFull
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RingFull => write!(f, "Tx ring full"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "Frame of {} bytes exceeds maximum {}", len, max)
            }
            Self::DeviceNotReady => write!(f, "Device not ready"),
            Self::RingReset => write!(f, "Tx ring reset after protocol violation"),
        }
    }
}

/// Command channel errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// A request is already outstanding. Programming error.
    Busy,
    /// No completion within the timeout. The channel was reset to idle;
    /// re-issuing is safe.
    Timeout,
    /// Firmware completed the command with a non-success status.
    Firmware(FirmwareStatus),
    /// Request payload larger than the mailbox or the parameter's length.
    PayloadTooLarge {
        /// Offered length.
        len: usize,
        /// Allowed length.
        max: usize,
    },
    /// Parameter has no length entry for this chip variant.
    UnsupportedParameter(u16),
    /// Device not brought up, or torn down.
    DeviceNotReady,
}

impl CommandError {
    /// Whether re-issuing the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommandError::Timeout)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "Command already outstanding"),
            Self::Timeout => write!(f, "Command timed out"),
            Self::Firmware(status) => write!(f, "Firmware error: {}", status),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "Command payload of {} bytes exceeds {}", len, max)
            }
            Self::UnsupportedParameter(id) => {
                write!(f, "Parameter {:#06x} not supported by this chip", id)
            }
            Self::DeviceNotReady => write!(f, "Device not ready"),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Ring size zero or above the pool limit.
    RingSize(usize),
    /// Payload buffer size zero or too small for an 802.11 header.
    BufferSize(usize),
    /// Watermarks not ordered `low < high <= tx ring size`.
    Watermarks {
        low: usize,
        high: usize,
    },
    /// A rate-control threshold is zero.
    Threshold,
    /// Default rate mask is empty.
    EmptyRateMask,
    /// Timeout or tick of zero length.
    Timing,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RingSize(n) => write!(f, "Invalid ring size {}", n),
            Self::BufferSize(n) => write!(f, "Invalid buffer size {}", n),
            Self::Watermarks { low, high } => {
                write!(f, "Invalid Tx watermarks (low {}, high {})", low, high)
            }
            Self::Threshold => write!(f, "Rate-control thresholds must be non-zero"),
            Self::EmptyRateMask => write!(f, "Default rate mask is empty"),
            Self::Timing => write!(f, "Timeouts and ticks must be non-zero"),
        }
    }
}

/// Device bring-up errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpError {
    /// Configuration rejected.
    Config(ConfigError),
    /// Payload pool could not be built over the arena.
    Pool(PoolError),
    /// Ring setup failed.
    Ring(RingError),
    /// Firmware never answered within the retry budget.
    DeviceUnusable {
        /// Attempts made.
        attempts: u32,
    },
    /// Firmware answered but refused a setup command.
    Command(CommandError),
}

impl From<ConfigError> for BringUpError {
    fn from(e: ConfigError) -> Self {
        BringUpError::Config(e)
    }
}

impl From<PoolError> for BringUpError {
    fn from(e: PoolError) -> Self {
        BringUpError::Pool(e)
    }
}

impl From<RingError> for BringUpError {
    fn from(e: RingError) -> Self {
        BringUpError::Ring(e)
    }
}

impl From<CommandError> for BringUpError {
    fn from(e: CommandError) -> Self {
        BringUpError::Command(e)
    }
}

impl fmt::Display for BringUpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "Configuration: {}", e),
            Self::Pool(e) => write!(f, "Payload pool: {}", e),
            Self::Ring(e) => write!(f, "Ring setup: {}", e),
            Self::DeviceUnusable { attempts } => {
                write!(f, "Firmware unresponsive after {} attempts", attempts)
            }
            Self::Command(e) => write!(f, "Setup command failed: {}", e),
        }
    }
}
