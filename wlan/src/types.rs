//! Shared types and the upward frame-delivery interface.

use core::fmt;

use crate::rate::RateMask;

/// Peer identifier (802.11 MAC address).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PeerId(pub [u8; 6]);

impl PeerId {
    /// Broadcast address.
    pub const BROADCAST: PeerId = PeerId([0xff; 6]);

    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Group-addressed frames carry no per-peer rate state.
    pub fn is_group(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

/// Metadata reported by the device for one received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxMeta {
    /// Signal level as reported by the PHY.
    pub signal_level: u8,
    /// Noise level as reported by the PHY.
    pub noise_level: u8,
    /// Device MAC timestamp (µs).
    pub timestamp: u32,
    /// Rate the frame was received at (single bit).
    pub rate: RateMask,
}

/// Tx queue flow state reported to the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Free slots fell below the low watermark; stop submitting.
    Stopped,
    /// Free slots rose above the high watermark; resume.
    Resumed,
}

/// Upper-layer callbacks.
///
/// Always invoked with no internal lock held, so implementations may call
/// back into the device (e.g. submit a frame from `on_rx_frame`).
pub trait FrameSink: Send + Sync {
    /// One received frame, invoked once per reaped good Rx slot.
    fn on_rx_frame(&self, frame: &[u8], meta: RxMeta);

    /// Tx ring crossed a watermark.
    fn on_tx_flow(&self, _state: FlowState) {}

    /// Firmware finished a scan.
    fn on_scan_complete(&self) {}
}
