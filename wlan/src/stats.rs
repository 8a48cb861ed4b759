//! Counters.

use crate::ring::TxErrorCode;

/// Tx failures by device-reported cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxErrorCounters {
    pub invalid_frame: u64,
    pub lifetime_expired: u64,
    pub excessive_retries: u64,
    pub dma_underrun: u64,
    pub dma_error: u64,
    pub unsupported_rate: u64,
    /// Error flagged with no cause bit set.
    pub unspecified: u64,
}

impl TxErrorCounters {
    pub fn record(&mut self, code: TxErrorCode) {
        if code.is_empty() {
            self.unspecified += 1;
            return;
        }
        if code.contains(TxErrorCode::INVALID_FRAME) {
            self.invalid_frame += 1;
        }
        if code.contains(TxErrorCode::LIFETIME_EXPIRED) {
            self.lifetime_expired += 1;
        }
        if code.contains(TxErrorCode::EXCESSIVE_RETRIES) {
            self.excessive_retries += 1;
        }
        if code.contains(TxErrorCode::DMA_UNDERRUN) {
            self.dma_underrun += 1;
        }
        if code.contains(TxErrorCode::DMA_ERROR) {
            self.dma_error += 1;
        }
        if code.contains(TxErrorCode::UNSUPPORTED_RATE) {
            self.unsupported_rate += 1;
        }
    }
}

/// Device statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub tx_submitted: u64,
    pub tx_completed: u64,
    pub tx_errors: u64,
    /// Frames refused by `submit_tx`.
    pub tx_dropped: u64,
    pub tx_ack_failures: u64,
    pub tx_rts_failures: u64,
    pub tx_error_kinds: TxErrorCounters,
    pub rx_frames: u64,
    pub rx_errors: u64,
    pub emergency_resets: u64,
    pub protocol_violations: u64,
    pub irq_storms: u64,
    pub command_timeouts: u64,
    pub firmware_errors: u64,
}
