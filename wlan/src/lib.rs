//! ACX100/ACX111 wireless adapter data and control plane.
//!
//! Moves frames between host memory and the firmware over shared
//! descriptor rings, runs synchronous mailbox commands, and adapts each
//! peer's Tx rate from completion outcomes.
//!
//! # Architecture
//!
//! ```text
//! submit_tx ──> Tx DescriptorRing ──> device ──> handle_interrupt
//!                                                  ├─ reap_tx ──> RateController
//!                                                  ├─ reap_rx ──> FrameSink::on_rx_frame
//!                                                  ├─ CommandChannel completion
//!                                                  └─ DeferredJobs ──> run_deferred
//! ```
//!
//! The bus glue provides a [`Bus`] (registers, mailbox, DMA mapping,
//! clock) and calls [`Device::handle_interrupt`] from its interrupt
//! handler and [`Device::run_deferred`] from process context.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod bus;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod irq;
pub mod rate;
pub mod reaper;
pub mod ring;
pub mod stats;
pub mod types;
pub mod wait;

pub use bus::{Bus, Reg};
pub use command::{
    ChannelState, ChipVariant, Command, CommandChannel, FirmwareRevision, FirmwareStatus,
    LengthTable, Parameter,
};
pub use config::{CommandWaitMode, DeviceConfig};
pub use device::{Device, IrqOutcome};
pub use error::{BringUpError, CommandError, ConfigError, RingError, RingFull, TxError};
pub use irq::{DeferredJobs, IrqReason, IrqState};
pub use payload_pool::DeviceRef;
pub use rate::{PeerRateState, RateAdjustment, RateController, RateMask, RateThresholds};
pub use ring::{DescriptorRing, DescriptorSlot, Owner, SharedSlots, SlotStatus, StatusFlags};
pub use stats::Stats;
pub use types::{FlowState, FrameSink, PeerId, RxMeta};
pub use wait::{BoundedWait, Clock};
