//! Completion reaping for both rings.
//!
//! Called from the top half (and from the Tx submit path when the ring is
//! full) with the fast lock held. Never blocks.

use alloc::vec::Vec;

use crate::error::RingError;
use crate::rate::{RateController, TxRateOutcome};
use crate::ring::{DescriptorRing, Rx, StatusFlags, Tx};
use crate::stats::Stats;
use crate::types::RxMeta;

/// A good received frame, copied out of its buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    pub data: Vec<u8>,
    pub meta: RxMeta,
}

/// Result of one reap pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReapSummary {
    /// Slots returned to the free set.
    pub reaped: usize,
    /// Slots that carried the error bit.
    pub errors: usize,
    /// Ownership protocol violation that stopped the pass.
    pub fault: Option<RingError>,
}

/// Reap finished Tx slots, feeding each outcome to rate control.
pub fn reap_tx(
    ring: &mut DescriptorRing<Tx>,
    rates: &mut RateController,
    stats: &mut Stats,
) -> ReapSummary {
    let mut summary = ReapSummary::default();
    let mut reap = ring.reap();
    for done in &mut reap {
        summary.reaped += 1;
        let status = done.status;
        let failed = done.is_error();

        stats.tx_completed += 1;
        stats.tx_ack_failures += u64::from(status.ack_failures);
        stats.tx_rts_failures += u64::from(status.rts_failures);
        if failed {
            summary.errors += 1;
            stats.tx_errors += 1;
            stats.tx_error_kinds.record(status.error);
            log::trace!(
                "tx: slot {} failed, error {:?}",
                done.index,
                status.error
            );
        }

        if let Some(peer) = done.tag {
            if !peer.is_group() {
                rates.on_tx_complete(
                    &peer,
                    TxRateOutcome {
                        used_rate: status.rate,
                        failed,
                    },
                );
            }
        }
    }
    summary.fault = reap.fault();
    summary
}

/// Reap filled Rx slots into `out` and hand fresh buffers back.
///
/// Slots flagged with an error are counted and recycled without delivery.
pub fn reap_rx(ring: &mut DescriptorRing<Rx>, stats: &mut Stats, out: &mut Vec<RxFrame>) -> ReapSummary {
    let mut summary = ReapSummary::default();
    {
        let mut reap = ring.reap();
        for done in &mut reap {
            summary.reaped += 1;
            if done.status.flags.contains(StatusFlags::ERROR) {
                summary.errors += 1;
                stats.rx_errors += 1;
                continue;
            }
            stats.rx_frames += 1;
            let status = done.status;
            out.push(RxFrame {
                data: done.payload,
                meta: RxMeta {
                    signal_level: status.signal,
                    noise_level: status.noise,
                    timestamp: status.timestamp,
                    rate: status.rate.highest(),
                },
            });
        }
        summary.fault = reap.fault();
    }

    for _ in 0..summary.reaped {
        if let Err(e) = ring.post_buffer(()) {
            log::error!("rx: refill failed: {}", e);
            summary.fault.get_or_insert(e);
            break;
        }
    }
    summary
}
