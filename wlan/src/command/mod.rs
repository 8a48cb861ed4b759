//! Synchronous command mailbox.
//!
//! One request may be outstanding at a time. The mailbox region is laid
//! out as:
//!
//! ```text
//!   0      2        4
//!   [type ][status ][ parameters ... MAILBOX_PARAM_SIZE ]
//! ```
//!
//! Configure and Interrogate put an IE header (`id`, `len`) at the start
//! of the parameter area. For Configure the host fills the element; for
//! Interrogate the host writes only the header and the firmware fills the
//! rest before completing.
//!
//! [`CommandChannel`] is the pure request state machine. The mailbox I/O
//! helpers below are driven by the device under the fast lock.

pub mod params;

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::bus::Bus;
use crate::error::CommandError;

pub use params::{ChipVariant, FirmwareRevision, LengthTable, Parameter};

// ═══════════════════════════════════════════════════════════════════════════
// MAILBOX LAYOUT
// ═══════════════════════════════════════════════════════════════════════════

/// Offset of the command type word.
pub const MAILBOX_TYPE_OFFSET: usize = 0;
/// Offset of the status word.
pub const MAILBOX_STATUS_OFFSET: usize = 2;
/// Offset of the parameter area.
pub const MAILBOX_PARAM_OFFSET: usize = 4;
/// Size of the parameter area.
pub const MAILBOX_PARAM_SIZE: usize = 256;
/// Length of an information element header.
pub const IE_HEADER_LEN: usize = 4;

// ═══════════════════════════════════════════════════════════════════════════
// COMMANDS
// ═══════════════════════════════════════════════════════════════════════════

/// Firmware commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Interrogate,
    Configure,
    EnableRx,
    EnableTx,
    DisableRx,
    DisableTx,
    FlushQueues,
    Scan,
    StopScan,
    Join,
    Sleep,
    Wake,
    RadioRecalibrate,
}

impl Command {
    /// Wire code.
    pub const fn code(self) -> u16 {
        match self {
            Command::Interrogate => 0x0001,
            Command::Configure => 0x0002,
            Command::EnableRx => 0x0003,
            Command::EnableTx => 0x0004,
            Command::DisableRx => 0x0005,
            Command::DisableTx => 0x0006,
            Command::FlushQueues => 0x0007,
            Command::Scan => 0x0008,
            Command::StopScan => 0x0009,
            Command::Join => 0x000b,
            Command::Sleep => 0x000f,
            Command::Wake => 0x0010,
            Command::RadioRecalibrate => 0x0019,
        }
    }

    pub fn from_code(code: u16) -> Option<Command> {
        use Command::*;
        [
            Interrogate,
            Configure,
            EnableRx,
            EnableTx,
            DisableRx,
            DisableTx,
            FlushQueues,
            Scan,
            StopScan,
            Join,
            Sleep,
            Wake,
            RadioRecalibrate,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }

    /// Bytes to copy out of the parameter area after a successful
    /// completion of this command with `request` as its parameters.
    ///
    /// Only Interrogate returns data: the element header plus the
    /// element's length on this chip. An element the table doesn't know
    /// uses the length the caller put in the header.
    pub fn response_len(self, request: &[u8], table: &LengthTable) -> usize {
        if self != Command::Interrogate {
            return 0;
        }
        let Some(header) = IeHeader::decode(request) else {
            return 0;
        };
        let body = Parameter::from_id(header.id)
            .and_then(|p| table.len(p))
            .unwrap_or(header.len as usize);
        (IE_HEADER_LEN + body).min(MAILBOX_PARAM_SIZE)
    }
}

/// Firmware completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareStatus {
    Idle,
    Success,
    UnknownCommand,
    InvalidInfoElement,
    ChannelRejected,
    ChannelInvalid,
    MacInvalid,
    ReadOnly,
    Rejected,
    AlreadyAsleep,
    TxInProgress,
    AlreadyAwake,
    WriteOnly,
    RxInProgress,
    InvalidParameter,
    ScanInProgress,
    Failed,
    Unknown(u16),
}

impl FirmwareStatus {
    pub const fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Success,
            2 => Self::UnknownCommand,
            3 => Self::InvalidInfoElement,
            4 => Self::ChannelRejected,
            5 => Self::ChannelInvalid,
            6 => Self::MacInvalid,
            7 => Self::ReadOnly,
            8 => Self::Rejected,
            9 => Self::AlreadyAsleep,
            10 => Self::TxInProgress,
            11 => Self::AlreadyAwake,
            12 => Self::WriteOnly,
            13 => Self::RxInProgress,
            14 => Self::InvalidParameter,
            15 => Self::ScanInProgress,
            16 => Self::Failed,
            other => Self::Unknown(other),
        }
    }

    pub const fn to_raw(self) -> u16 {
        match self {
            Self::Idle => 0,
            Self::Success => 1,
            Self::UnknownCommand => 2,
            Self::InvalidInfoElement => 3,
            Self::ChannelRejected => 4,
            Self::ChannelInvalid => 5,
            Self::MacInvalid => 6,
            Self::ReadOnly => 7,
            Self::Rejected => 8,
            Self::AlreadyAsleep => 9,
            Self::TxInProgress => 10,
            Self::AlreadyAwake => 11,
            Self::WriteOnly => 12,
            Self::RxInProgress => 13,
            Self::InvalidParameter => 14,
            Self::ScanInProgress => 15,
            Self::Failed => 16,
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for FirmwareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Success => write!(f, "success"),
            Self::UnknownCommand => write!(f, "unknown command"),
            Self::InvalidInfoElement => write!(f, "invalid information element"),
            Self::ChannelRejected => write!(f, "channel rejected"),
            Self::ChannelInvalid => write!(f, "channel invalid in current regulatory domain"),
            Self::MacInvalid => write!(f, "MAC invalid"),
            Self::ReadOnly => write!(f, "element is read-only"),
            Self::Rejected => write!(f, "rejected"),
            Self::AlreadyAsleep => write!(f, "already asleep"),
            Self::TxInProgress => write!(f, "Tx in progress"),
            Self::AlreadyAwake => write!(f, "already awake"),
            Self::WriteOnly => write!(f, "element is write-only"),
            Self::RxInProgress => write!(f, "Rx in progress"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::ScanInProgress => write!(f, "scan in progress"),
            Self::Failed => write!(f, "failed"),
            Self::Unknown(raw) => write!(f, "unknown status {:#06x}", raw),
        }
    }
}

/// Information element header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IeHeader {
    pub id: u16,
    pub len: u16,
}

impl IeHeader {
    pub fn encode(&self) -> [u8; IE_HEADER_LEN] {
        let id = self.id.to_le_bytes();
        let len = self.len.to_le_bytes();
        [id[0], id[1], len[0], len[1]]
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < IE_HEADER_LEN {
            return None;
        }
        Some(Self {
            id: u16::from_le_bytes([bytes[0], bytes[1]]),
            len: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}

/// Parameters for `Configure(param)` carrying `data`.
///
/// `data` longer than the element's length on this chip is rejected;
/// shorter data is zero-padded.
pub fn configure_request(
    table: &LengthTable,
    param: Parameter,
    data: &[u8],
) -> Result<Vec<u8>, CommandError> {
    let len = table
        .len(param)
        .ok_or(CommandError::UnsupportedParameter(param.id()))?;
    if data.len() > len {
        return Err(CommandError::PayloadTooLarge {
            len: data.len(),
            max: len,
        });
    }
    let header = IeHeader {
        id: param.id(),
        len: len as u16,
    };
    let mut out = vec![0u8; IE_HEADER_LEN + len];
    out[..IE_HEADER_LEN].copy_from_slice(&header.encode());
    out[IE_HEADER_LEN..IE_HEADER_LEN + data.len()].copy_from_slice(data);
    Ok(out)
}

/// Parameters for `Interrogate(param)`: the header only.
pub fn interrogate_request(table: &LengthTable, param: Parameter) -> Result<Vec<u8>, CommandError> {
    let len = table
        .len(param)
        .ok_or(CommandError::UnsupportedParameter(param.id()))?;
    let header = IeHeader {
        id: param.id(),
        len: len as u16,
    };
    Ok(header.encode().to_vec())
}

// ═══════════════════════════════════════════════════════════════════════════
// CHANNEL STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Mailbox request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Idle,
    AwaitingCompletion,
}

/// Single-outstanding-request state machine.
#[derive(Debug, Default)]
pub struct CommandChannel {
    state: ChannelState,
    pending: Option<Command>,
    completed: bool,
    issued: u64,
}

impl CommandChannel {
    pub const fn new() -> Self {
        Self {
            state: ChannelState::Idle,
            pending: None,
            completed: false,
            issued: 0,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Command awaiting completion, if any.
    pub fn pending(&self) -> Option<Command> {
        self.pending
    }

    /// Commands issued over the channel's lifetime.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Idle -> AwaitingCompletion. A second request while one is
    /// outstanding is a usage error.
    pub fn begin(&mut self, cmd: Command) -> Result<(), CommandError> {
        if self.state != ChannelState::Idle {
            log::error!(
                "cmd: {:?} issued while {:?} outstanding",
                cmd,
                self.pending
            );
            return Err(CommandError::Busy);
        }
        self.state = ChannelState::AwaitingCompletion;
        self.pending = Some(cmd);
        self.completed = false;
        self.issued += 1;
        Ok(())
    }

    /// Record a completion signal. Returns false if nothing was waiting
    /// (spurious completion).
    pub fn flag_complete(&mut self) -> bool {
        if self.state != ChannelState::AwaitingCompletion {
            return false;
        }
        self.completed = true;
        true
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Back to Idle regardless of outcome.
    pub fn reset(&mut self) {
        self.state = ChannelState::Idle;
        self.pending = None;
        self.completed = false;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MAILBOX I/O
// ═══════════════════════════════════════════════════════════════════════════

/// Write `params` then the type word (status cleared to Idle).
///
/// The type word goes last so the firmware never sees a command with
/// half-written parameters.
pub(crate) fn post_request<B: Bus + ?Sized>(bus: &B, cmd: Command, params: &[u8]) {
    if !params.is_empty() {
        bus.write_mailbox(MAILBOX_PARAM_OFFSET, params);
    }
    let ty = cmd.code().to_le_bytes();
    let status = FirmwareStatus::Idle.to_raw().to_le_bytes();
    bus.write_mailbox(MAILBOX_TYPE_OFFSET, &[ty[0], ty[1], status[0], status[1]]);
}

pub(crate) fn read_status<B: Bus + ?Sized>(bus: &B) -> FirmwareStatus {
    let mut raw = [0u8; 2];
    bus.read_mailbox(MAILBOX_STATUS_OFFSET, &mut raw);
    FirmwareStatus::from_raw(u16::from_le_bytes(raw))
}

pub(crate) fn read_response<B: Bus + ?Sized>(bus: &B, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len.min(MAILBOX_PARAM_SIZE)];
    if !out.is_empty() {
        bus.read_mailbox(MAILBOX_PARAM_OFFSET, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_while_outstanding_is_busy() {
        let mut ch = CommandChannel::new();
        ch.begin(Command::Interrogate).unwrap();
        assert_eq!(ch.state(), ChannelState::AwaitingCompletion);
        assert_eq!(ch.begin(Command::Configure), Err(CommandError::Busy));
        // The outstanding request is untouched.
        assert_eq!(ch.pending(), Some(Command::Interrogate));
        ch.reset();
        assert_eq!(ch.state(), ChannelState::Idle);
        assert!(ch.begin(Command::Configure).is_ok());
        assert_eq!(ch.issued(), 2);
    }

    #[test]
    fn test_spurious_completion_ignored() {
        let mut ch = CommandChannel::new();
        assert!(!ch.flag_complete());
        assert!(!ch.is_complete());
        ch.begin(Command::EnableRx).unwrap();
        assert!(ch.flag_complete());
        assert!(ch.is_complete());
        ch.reset();
        assert!(!ch.is_complete());
    }

    #[test]
    fn test_status_codes() {
        for raw in 0..=16u16 {
            assert_eq!(FirmwareStatus::from_raw(raw).to_raw(), raw);
        }
        assert_eq!(FirmwareStatus::from_raw(1), FirmwareStatus::Success);
        assert_eq!(FirmwareStatus::from_raw(0x42), FirmwareStatus::Unknown(0x42));
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::from_code(0x0002), Some(Command::Configure));
        assert_eq!(Command::from_code(0x0019), Some(Command::RadioRecalibrate));
        assert_eq!(Command::from_code(0x00ff), None);
    }

    #[test]
    fn test_configure_request_layout() {
        let table = LengthTable::for_variant(ChipVariant::Acx111);
        let req = configure_request(&table, Parameter::ShortRetryLimit, &[7]).unwrap();
        assert_eq!(req, [0x05, 0x10, 4, 0, 7, 0, 0, 0]);

        let err = configure_request(&table, Parameter::DtimPeriod, &[1, 2]).unwrap_err();
        assert_eq!(err, CommandError::PayloadTooLarge { len: 2, max: 1 });

        let err = configure_request(&table, Parameter::EdThreshold, &[]).unwrap_err();
        assert_eq!(err, CommandError::UnsupportedParameter(0x100f));
    }

    #[test]
    fn test_response_len_follows_variant_table() {
        let a100 = LengthTable::for_variant(ChipVariant::Acx100);
        let a111 = LengthTable::for_variant(ChipVariant::Acx111);
        let req = interrogate_request(&a111, Parameter::QueueConfig).unwrap();
        assert_eq!(Command::Interrogate.response_len(&req, &a100), 4 + 0x1c);
        assert_eq!(Command::Interrogate.response_len(&req, &a111), 4 + 0x14);
        assert_eq!(Command::Configure.response_len(&req, &a111), 0);

        // Unknown element: trust the header.
        let raw = IeHeader { id: 0x7777, len: 12 }.encode();
        assert_eq!(Command::Interrogate.response_len(&raw, &a111), 16);
        assert_eq!(Command::Interrogate.response_len(&[], &a111), 0);
    }
}
