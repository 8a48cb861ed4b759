//! Per-peer adaptive Tx rate control.
//!
//! Each peer carries an `allowed` mask (what configuration permits) and a
//! `current` mask (what is being tried now). Frames go out at the highest
//! bit of `current`. Completions move that bit one step at a time:
//!
//! ```text
//!   lower rate / error ──(fallback_threshold times)──> clear top bit of current
//!   full-rate success  ──(stepup_threshold times)───> add next allowed bit above
//! ```
//!
//! Falling back is meant to be faster than stepping up, so the two
//! thresholds are configured separately.

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::types::PeerId;

bitflags! {
    /// Transmission rate bitset, one bit per rate/modulation.
    ///
    /// Bits are ordered by rate so numeric comparison of single-bit masks
    /// compares rates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RateMask: u16 {
        const RATE_1 = 1 << 0;
        const RATE_2 = 1 << 1;
        const RATE_5_5 = 1 << 2;
        const RATE_6 = 1 << 3;
        const RATE_9 = 1 << 4;
        const RATE_11 = 1 << 5;
        const RATE_12 = 1 << 6;
        const RATE_18 = 1 << 7;
        const RATE_22 = 1 << 8;
        const RATE_24 = 1 << 9;
        const RATE_36 = 1 << 10;
        const RATE_48 = 1 << 11;
        const RATE_54 = 1 << 12;

        /// 802.11b rates.
        const CCK = Self::RATE_1.bits() | Self::RATE_2.bits()
            | Self::RATE_5_5.bits() | Self::RATE_11.bits();
        /// 802.11g OFDM rates.
        const OFDM = Self::RATE_6.bits() | Self::RATE_9.bits() | Self::RATE_12.bits()
            | Self::RATE_18.bits() | Self::RATE_24.bits() | Self::RATE_36.bits()
            | Self::RATE_48.bits() | Self::RATE_54.bits();
    }
}

/// Rate of each bit in 100 kbit/s units, indexed by bit position.
const RATE_100KBPS: [u16; 13] = [10, 20, 55, 60, 90, 110, 120, 180, 220, 240, 360, 480, 540];

impl RateMask {
    /// Highest set bit, or empty.
    pub fn highest(self) -> RateMask {
        match self.bits() {
            0 => RateMask::empty(),
            b => RateMask::from_bits_retain(1 << (15 - b.leading_zeros())),
        }
    }

    /// Lowest set bit, or empty.
    pub fn lowest(self) -> RateMask {
        let b = self.bits();
        RateMask::from_bits_retain(b & b.wrapping_neg())
    }

    /// Whether exactly one bit is set.
    pub fn is_single(self) -> bool {
        self.bits().count_ones() == 1
    }

    /// Rate of a single-bit mask in 100 kbit/s units.
    pub fn rate_100kbps(self) -> Option<u16> {
        if !self.is_single() {
            return None;
        }
        RATE_100KBPS.get(self.bits().trailing_zeros() as usize).copied()
    }

    /// Next bit above `self` (single bit) present in `allowed` but not in
    /// `current`, walking up one position at a time.
    pub fn next_higher(self, allowed: RateMask, current: RateMask) -> Option<RateMask> {
        let mut bit = self.highest().bits();
        if bit == 0 {
            return None;
        }
        loop {
            bit = bit.checked_shl(1).filter(|b| *b != 0)?;
            let candidate = RateMask::from_bits_retain(bit);
            if !RateMask::all().contains(candidate) {
                return None;
            }
            if allowed.contains(candidate) && !current.contains(candidate) {
                return Some(candidate);
            }
        }
    }
}

/// Fallback and step-up thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateThresholds {
    /// Lower-rate or failed completions before the top rate is dropped.
    pub fallback: u16,
    /// Full-rate successes before the next rate is tried.
    pub stepup: u16,
}

/// Outcome of one Tx completion as far as rate control is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRateOutcome {
    /// Rate the device actually used (single bit, empty if unreported).
    pub used_rate: RateMask,
    /// Frame failed (error bits set).
    pub failed: bool,
}

/// What a completion did to the peer's mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAdjustment {
    /// Counters moved, mask unchanged.
    None,
    /// Stale completion discarded.
    Ignored,
    /// Top rate removed from the current mask.
    FellBack(RateMask),
    /// Rate added to the current mask.
    SteppedUp(RateMask),
}

/// Rate-control state for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRateState {
    allowed_mask: RateMask,
    current_mask: RateMask,
    fallback_count: u16,
    stepup_count: u16,
    ignore_count: u16,
    in_flight: u16,
}

impl PeerRateState {
    /// Start trying every allowed rate. `allowed` must be non-empty.
    pub fn new(allowed: RateMask) -> Self {
        Self {
            allowed_mask: allowed,
            current_mask: allowed,
            fallback_count: 0,
            stepup_count: 0,
            ignore_count: 0,
            in_flight: 0,
        }
    }

    pub fn allowed_mask(&self) -> RateMask {
        self.allowed_mask
    }

    pub fn current_mask(&self) -> RateMask {
        self.current_mask
    }

    pub fn fallback_count(&self) -> u16 {
        self.fallback_count
    }

    pub fn stepup_count(&self) -> u16 {
        self.stepup_count
    }

    pub fn ignore_count(&self) -> u16 {
        self.ignore_count
    }

    pub fn in_flight(&self) -> u16 {
        self.in_flight
    }

    /// Rate for the next frame.
    pub fn tx_rate(&self) -> RateMask {
        self.current_mask.highest()
    }

    /// Replace the allowed set, keeping `current` a non-empty subset.
    pub fn set_allowed(&mut self, allowed: RateMask) {
        self.allowed_mask = allowed;
        self.current_mask &= allowed;
        if self.current_mask.is_empty() {
            self.current_mask = allowed.lowest();
        }
        self.fallback_count = 0;
        self.stepup_count = 0;
    }

    /// A frame for this peer entered the ring.
    pub fn note_submitted(&mut self) {
        self.in_flight = self.in_flight.saturating_add(1);
    }

    /// Ring was reset; nothing is in flight any more.
    pub fn clear_in_flight(&mut self) {
        self.in_flight = 0;
        self.ignore_count = 0;
    }

    /// Feed one completion through the state machine.
    pub fn on_completion(
        &mut self,
        outcome: TxRateOutcome,
        thresholds: RateThresholds,
    ) -> RateAdjustment {
        self.in_flight = self.in_flight.saturating_sub(1);

        if self.ignore_count > 0 {
            self.ignore_count -= 1;
            return RateAdjustment::Ignored;
        }

        let top = self.current_mask.highest();
        let used = outcome.used_rate.highest();

        if outcome.failed || used.bits() < top.bits() {
            self.stepup_count = 0;
            self.fallback_count = self.fallback_count.saturating_add(1);
            if self.fallback_count < thresholds.fallback {
                return RateAdjustment::None;
            }
            self.fallback_count = 0;

            self.current_mask.remove(top);
            if self.current_mask.is_empty() {
                // Can't disable every rate.
                self.current_mask.insert(top);
                return RateAdjustment::None;
            }
            self.ignore_count = self.in_flight;
            RateAdjustment::FellBack(top)
        } else {
            self.fallback_count = 0;
            self.stepup_count = self.stepup_count.saturating_add(1);
            if self.stepup_count < thresholds.stepup {
                return RateAdjustment::None;
            }
            self.stepup_count = 0;

            match used.next_higher(self.allowed_mask, self.current_mask) {
                Some(bit) => {
                    self.current_mask.insert(bit);
                    RateAdjustment::SteppedUp(bit)
                }
                None => RateAdjustment::None,
            }
        }
    }
}

/// Rate state for every known peer.
pub struct RateController {
    thresholds: RateThresholds,
    default_rates: RateMask,
    peers: BTreeMap<PeerId, PeerRateState>,
}

impl RateController {
    pub fn new(thresholds: RateThresholds, default_rates: RateMask) -> Self {
        Self {
            thresholds,
            default_rates,
            peers: BTreeMap::new(),
        }
    }

    pub fn thresholds(&self) -> RateThresholds {
        self.thresholds
    }

    /// Start tracking a peer. Re-adding a known peer resets its state.
    ///
    /// An empty `allowed` mask falls back to the default rates.
    pub fn add_peer(&mut self, peer: PeerId, allowed: RateMask) {
        let allowed = if allowed.is_empty() { self.default_rates } else { allowed };
        log::debug!("rate: add peer {:?} allowed {:#06x}", peer, allowed.bits());
        self.peers.insert(peer, PeerRateState::new(allowed));
    }

    /// Narrow or widen a known peer's allowed rates.
    pub fn set_allowed(&mut self, peer: &PeerId, allowed: RateMask) -> bool {
        match self.peers.get_mut(peer) {
            Some(state) if !allowed.is_empty() => {
                state.set_allowed(allowed);
                true
            }
            _ => false,
        }
    }

    /// Stop tracking a peer. In-flight completions for it are discarded.
    pub fn forget_peer(&mut self, peer: &PeerId) -> Option<PeerRateState> {
        log::debug!("rate: forget peer {:?}", peer);
        self.peers.remove(peer)
    }

    pub fn peer(&self, peer: &PeerId) -> Option<&PeerRateState> {
        self.peers.get(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Rate for the next frame to `peer`; unknown peers get the lowest
    /// default rate.
    pub fn tx_rate(&self, peer: &PeerId) -> RateMask {
        match self.peers.get(peer) {
            Some(state) => state.tx_rate(),
            None => self.default_rates.lowest(),
        }
    }

    /// Record a frame for `peer` entering the ring.
    pub fn note_submitted(&mut self, peer: &PeerId) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.note_submitted();
        }
    }

    /// Feed a completion for `peer`.
    pub fn on_tx_complete(&mut self, peer: &PeerId, outcome: TxRateOutcome) -> RateAdjustment {
        let thresholds = self.thresholds;
        let Some(state) = self.peers.get_mut(peer) else {
            return RateAdjustment::Ignored;
        };
        let adj = state.on_completion(outcome, thresholds);
        match adj {
            RateAdjustment::FellBack(bit) => log::debug!(
                "rate: {:?} fell back from {:#06x}, current {:#06x}, ignoring {}",
                peer,
                bit.bits(),
                state.current_mask.bits(),
                state.ignore_count
            ),
            RateAdjustment::SteppedUp(bit) => log::debug!(
                "rate: {:?} stepped up to {:#06x}, current {:#06x}",
                peer,
                bit.bits(),
                state.current_mask.bits()
            ),
            _ => {}
        }
        adj
    }

    /// Forget in-flight accounting for every peer (after a ring reset).
    pub fn clear_in_flight(&mut self) {
        for state in self.peers.values_mut() {
            state.clear_in_flight();
        }
    }
}
