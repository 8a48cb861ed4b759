//! Transport collaborator interface.
//!
//! The bus glue (PCI, USB, SDIO ...) maps the device, installs the
//! interrupt handler and hands the core an implementation of [`Bus`]. The
//! core never touches register offsets directly; it names registers by
//! role and the glue translates.

use payload_pool::DeviceRef;

use crate::ring::SharedSlots;
use crate::wait::Clock;

/// Registers the core uses, by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// Pending interrupt reasons. Reads are non-destructive.
    IrqStatus,
    /// Write-to-acknowledge: each set bit clears that reason.
    IrqAck,
    /// Set bits suppress the matching reasons.
    IrqMask,
    /// Any write tells the firmware a command is in the mailbox.
    CommandDoorbell,
    /// Any write tells the firmware new Tx slots are ready.
    TxDoorbell,
}

/// Register, mailbox, DMA mapping and clock access for one device.
///
/// Methods take `&self`; the core serializes register and mailbox access
/// under its own lock.
pub trait Bus: Clock + Send + Sync {
    fn read_reg(&self, reg: Reg) -> u32;

    fn write_reg(&self, reg: Reg, value: u32);

    /// Copy `data` into the command mailbox at `offset`.
    fn write_mailbox(&self, offset: usize, data: &[u8]);

    /// Copy from the command mailbox at `offset` into `out`.
    fn read_mailbox(&self, offset: usize, out: &mut [u8]);

    /// Device-visible reference for `len` bytes of host memory at `host`.
    ///
    /// The memory stays mapped until the rings are detached.
    fn map_buffer(&self, host: *mut u8, len: usize) -> DeviceRef;

    /// Register the Tx and Rx slot tables with the device.
    fn attach_rings(&self, tx: SharedSlots, rx: SharedSlots);

    /// Forget the slot tables registered by `attach_rings`.
    fn detach_rings(&self) {}
}
