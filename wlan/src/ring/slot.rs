//! Descriptor slot shared between host and firmware.
//!
//! # Ownership Protocol
//! ```text
//!   HOST ──publish(Device)──> DEVICE ──(firmware) publish(Host)──> HOST
//! ```
//!
//! Whoever holds the slot may write its other fields. The ownership byte is
//! always the last write and is issued with release ordering; the other side
//! reads it with acquire ordering before touching anything else. `publish`
//! is the only code that stores the ownership byte.
//!
//! Field layout on the wire is chip specific and belongs to the transport;
//! this struct carries the protocol, not the byte layout.

use core::sync::atomic::{fence, AtomicU16, AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;
use payload_pool::DeviceRef;

use crate::rate::RateMask;

/// Raw ownership byte: host owns the slot.
pub const OWNER_HOST: u8 = 0x80;
/// Raw ownership byte: device owns the slot.
pub const OWNER_DEVICE: u8 = 0x01;

/// Which side may currently mutate a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Host,
    Device,
}

impl Owner {
    pub const fn to_raw(self) -> u8 {
        match self {
            Owner::Host => OWNER_HOST,
            Owner::Device => OWNER_DEVICE,
        }
    }

    /// Decode a raw ownership byte. Anything else is corruption.
    pub const fn from_raw(raw: u8) -> Result<Owner, u8> {
        match raw {
            OWNER_HOST => Ok(Owner::Host),
            OWNER_DEVICE => Ok(Owner::Device),
            other => Err(other),
        }
    }
}

bitflags! {
    /// Host-written per-frame control bits. Meaningful only while
    /// host-owned.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ControlFlags: u8 {
        const FIRST_FRAGMENT = 1 << 0;
        const SHORT_PREAMBLE = 1 << 1;
        const REQUEST_RTS = 1 << 2;
        /// Device must not append an FCS.
        const SKIP_FCS = 1 << 3;
        /// Device must not bump the retry counter.
        const SKIP_RETRY_INCREMENT = 1 << 4;
        /// Device must not assign a sequence number.
        const SKIP_SEQUENCE = 1 << 5;
        const MORE_FRAGMENTS = 1 << 6;
        const POWER_MGMT = 1 << 7;
    }
}

bitflags! {
    /// Device-written completion status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusFlags: u8 {
        /// Device finished with the slot.
        const DONE = 1 << 0;
        /// At least one ACK was missed (see `ack_failures`).
        const ACK_FAILURES = 1 << 1;
        /// At least one RTS went unanswered (see `rts_failures`).
        const RTS_FAILURES = 1 << 2;
        const RTS_OK = 1 << 3;
        /// Frame failed; `error` carries the code.
        const ERROR = 1 << 4;
    }
}

bitflags! {
    /// Tx error code reported with `StatusFlags::ERROR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxErrorCode: u8 {
        const INVALID_FRAME = 1 << 0;
        const LIFETIME_EXPIRED = 1 << 1;
        const EXCESSIVE_RETRIES = 1 << 2;
        const DMA_UNDERRUN = 1 << 3;
        const DMA_ERROR = 1 << 4;
        const UNSUPPORTED_RATE = 1 << 5;
    }
}

/// One descriptor.
#[repr(C)]
#[derive(Debug)]
pub struct DescriptorSlot {
    owner: AtomicU8,
    control: AtomicU8,
    status: AtomicU8,
    error: AtomicU8,
    length: AtomicU16,
    /// Tx: requested rate (host) then used rate (device). Rx: receive rate.
    rate: AtomicU16,
    buffer_ref: AtomicU32,
    ack_failures: AtomicU8,
    rts_failures: AtomicU8,
    signal: AtomicU8,
    noise: AtomicU8,
    timestamp: AtomicU32,
}

/// Everything the device reports about a finished slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotStatus {
    pub flags: StatusFlags,
    pub error: TxErrorCode,
    pub length: u16,
    pub rate: RateMask,
    pub ack_failures: u8,
    pub rts_failures: u8,
    pub signal: u8,
    pub noise: u8,
    pub timestamp: u32,
}

impl DescriptorSlot {
    /// Host-owned, empty slot.
    pub const fn new() -> Self {
        Self {
            owner: AtomicU8::new(OWNER_HOST),
            control: AtomicU8::new(0),
            status: AtomicU8::new(0),
            error: AtomicU8::new(0),
            length: AtomicU16::new(0),
            rate: AtomicU16::new(0),
            buffer_ref: AtomicU32::new(0),
            ack_failures: AtomicU8::new(0),
            rts_failures: AtomicU8::new(0),
            signal: AtomicU8::new(0),
            noise: AtomicU8::new(0),
            timestamp: AtomicU32::new(0),
        }
    }

    /// Current owner, with acquire ordering so fields written before the
    /// flip are visible. `Err(raw)` on a corrupt byte.
    #[inline]
    pub fn owner(&self) -> Result<Owner, u8> {
        Owner::from_raw(self.owner.load(Ordering::Acquire))
    }

    /// Hand the slot to `to`. Must be the caller's last write to the slot.
    #[inline]
    pub fn publish(&self, to: Owner) {
        fence(Ordering::Release);
        self.owner.store(to.to_raw(), Ordering::Release);
    }

    /// Host: fill a slot before publishing it to the device.
    pub(crate) fn host_fill(&self, control: ControlFlags, length: u16, rate: RateMask, buf: DeviceRef) {
        self.control.store(control.bits(), Ordering::Relaxed);
        self.length.store(length, Ordering::Relaxed);
        self.rate.store(rate.bits(), Ordering::Relaxed);
        self.buffer_ref.store(buf.raw(), Ordering::Relaxed);
        self.clear_status();
    }

    /// Host: status snapshot. Only valid after `owner()` returned `Host`.
    pub(crate) fn host_status(&self) -> SlotStatus {
        SlotStatus {
            flags: StatusFlags::from_bits_retain(self.status.load(Ordering::Relaxed)),
            error: TxErrorCode::from_bits_retain(self.error.load(Ordering::Relaxed)),
            length: self.length.load(Ordering::Relaxed),
            rate: RateMask::from_bits_retain(self.rate.load(Ordering::Relaxed)),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            rts_failures: self.rts_failures.load(Ordering::Relaxed),
            signal: self.signal.load(Ordering::Relaxed),
            noise: self.noise.load(Ordering::Relaxed),
            timestamp: self.timestamp.load(Ordering::Relaxed),
        }
    }

    /// Host: whether the device marked the slot done.
    #[inline]
    pub(crate) fn host_done(&self) -> bool {
        StatusFlags::from_bits_retain(self.status.load(Ordering::Relaxed))
            .contains(StatusFlags::DONE)
    }

    pub(crate) fn buffer_ref(&self) -> DeviceRef {
        DeviceRef::from_raw(self.buffer_ref.load(Ordering::Relaxed))
    }

    pub(crate) fn clear_status(&self) {
        self.status.store(0, Ordering::Relaxed);
        self.error.store(0, Ordering::Relaxed);
        self.ack_failures.store(0, Ordering::Relaxed);
        self.rts_failures.store(0, Ordering::Relaxed);
        self.signal.store(0, Ordering::Relaxed);
        self.noise.store(0, Ordering::Relaxed);
        self.timestamp.store(0, Ordering::Relaxed);
    }

    /// Device-side accessor, for transports that mirror descriptors into
    /// chip memory and for simulated firmware.
    pub fn device(&self) -> DeviceSide<'_> {
        DeviceSide { slot: self }
    }
}

impl Default for DescriptorSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Firmware's view of a device-owned slot.
pub struct DeviceSide<'a> {
    slot: &'a DescriptorSlot,
}

impl DeviceSide<'_> {
    /// Whether the device currently owns the slot.
    pub fn owned(&self) -> bool {
        self.slot.owner() == Ok(Owner::Device)
    }

    pub fn control(&self) -> ControlFlags {
        ControlFlags::from_bits_retain(self.slot.control.load(Ordering::Relaxed))
    }

    pub fn length(&self) -> u16 {
        self.slot.length.load(Ordering::Relaxed)
    }

    /// Rate the host asked for.
    pub fn requested_rate(&self) -> RateMask {
        RateMask::from_bits_retain(self.slot.rate.load(Ordering::Relaxed))
    }

    pub fn buffer_ref(&self) -> DeviceRef {
        self.slot.buffer_ref()
    }

    /// Store the ownership byte exactly as read back from chip memory.
    ///
    /// Transports that mirror descriptors copy the raw byte, corrupt or
    /// not; the host ring reports anything that is neither owner.
    pub fn mirror_owner(&self, raw: u8) {
        fence(Ordering::Release);
        self.slot.owner.store(raw, Ordering::Release);
    }

    /// Write the completion and return the slot to the host.
    ///
    /// `DONE` is always set. Ownership flips last.
    pub fn complete(&self, status: SlotStatus) {
        let s = self.slot;
        s.status
            .store((status.flags | StatusFlags::DONE).bits(), Ordering::Relaxed);
        s.error.store(status.error.bits(), Ordering::Relaxed);
        s.length.store(status.length, Ordering::Relaxed);
        s.rate.store(status.rate.bits(), Ordering::Relaxed);
        s.ack_failures.store(status.ack_failures, Ordering::Relaxed);
        s.rts_failures.store(status.rts_failures, Ordering::Relaxed);
        s.signal.store(status.signal, Ordering::Relaxed);
        s.noise.store(status.noise, Ordering::Relaxed);
        s.timestamp.store(status.timestamp, Ordering::Relaxed);
        s.publish(Owner::Host);
    }
}
