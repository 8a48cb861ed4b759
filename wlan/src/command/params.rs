//! Firmware information elements and per-chip length tables.
//!
//! Configure and Interrogate carry an information element (IE) header
//! `{type: u16, len: u16}` followed by `len` payload bytes. The expected
//! `len` differs between chip generations, so each device builds one
//! [`LengthTable`] for its variant at bring-up.

use alloc::collections::BTreeMap;
use alloc::string::String;

/// Chip generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChipVariant {
    Acx100,
    #[default]
    Acx111,
}

/// Information element selecting what Configure/Interrogate act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Parameter {
    QueueConfig,
    RateFallback,
    MemoryMap,
    ScanStatus,
    FirmwareRevision,
    FcsErrorCount,
    MediumUsage,
    RxConfig,
    FeatureConfig,
    StationId,
    BeaconPeriod,
    DtimPeriod,
    ShortRetryLimit,
    LongRetryLimit,
    RegulatoryDomain,
    Antenna,
    TxPowerLevel,
    CcaMode,
    EdThreshold,
}

impl Parameter {
    /// Every known element.
    pub const ALL: [Parameter; 19] = [
        Parameter::QueueConfig,
        Parameter::RateFallback,
        Parameter::MemoryMap,
        Parameter::ScanStatus,
        Parameter::FirmwareRevision,
        Parameter::FcsErrorCount,
        Parameter::MediumUsage,
        Parameter::RxConfig,
        Parameter::FeatureConfig,
        Parameter::StationId,
        Parameter::BeaconPeriod,
        Parameter::DtimPeriod,
        Parameter::ShortRetryLimit,
        Parameter::LongRetryLimit,
        Parameter::RegulatoryDomain,
        Parameter::Antenna,
        Parameter::TxPowerLevel,
        Parameter::CcaMode,
        Parameter::EdThreshold,
    ];

    /// Wire id.
    pub const fn id(self) -> u16 {
        match self {
            Parameter::QueueConfig => 0x0003,
            Parameter::RateFallback => 0x0006,
            Parameter::MemoryMap => 0x0008,
            Parameter::ScanStatus => 0x0009,
            Parameter::FirmwareRevision => 0x000d,
            Parameter::FcsErrorCount => 0x000e,
            Parameter::MediumUsage => 0x000f,
            Parameter::RxConfig => 0x0010,
            Parameter::FeatureConfig => 0x0015,
            Parameter::StationId => 0x1001,
            Parameter::BeaconPeriod => 0x1002,
            Parameter::DtimPeriod => 0x1003,
            Parameter::ShortRetryLimit => 0x1005,
            Parameter::LongRetryLimit => 0x1006,
            Parameter::RegulatoryDomain => 0x100a,
            Parameter::Antenna => 0x100b,
            Parameter::TxPowerLevel => 0x100d,
            Parameter::CcaMode => 0x100e,
            Parameter::EdThreshold => 0x100f,
        }
    }

    pub fn from_id(id: u16) -> Option<Parameter> {
        Parameter::ALL.iter().copied().find(|p| p.id() == id)
    }

    /// Payload length on `variant`, if the chip knows this element.
    const fn len_for(self, variant: ChipVariant) -> Option<u16> {
        use ChipVariant::*;
        match (self, variant) {
            (Parameter::QueueConfig, Acx100) => Some(0x1c),
            (Parameter::QueueConfig, Acx111) => Some(0x14),
            (Parameter::RateFallback, _) => Some(1),
            (Parameter::MemoryMap, _) => Some(0x28),
            (Parameter::ScanStatus, _) => Some(4),
            (Parameter::FirmwareRevision, _) => Some(0x18),
            (Parameter::FcsErrorCount, _) => Some(4),
            (Parameter::MediumUsage, _) => Some(8),
            (Parameter::RxConfig, _) => Some(4),
            (Parameter::FeatureConfig, _) => Some(8),
            (Parameter::StationId, _) => Some(6),
            (Parameter::BeaconPeriod, _) => Some(2),
            (Parameter::DtimPeriod, _) => Some(1),
            (Parameter::ShortRetryLimit, _) => Some(4),
            (Parameter::LongRetryLimit, _) => Some(4),
            (Parameter::RegulatoryDomain, _) => Some(1),
            (Parameter::Antenna, Acx100) => Some(1),
            (Parameter::Antenna, Acx111) => Some(2),
            (Parameter::TxPowerLevel, _) => Some(1),
            (Parameter::CcaMode, _) => Some(1),
            (Parameter::EdThreshold, Acx100) => Some(4),
            (Parameter::EdThreshold, Acx111) => None,
        }
    }
}

/// Payload length of every element the chip supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthTable {
    variant: ChipVariant,
    lengths: BTreeMap<Parameter, u16>,
}

impl LengthTable {
    /// Build the table for one chip variant.
    pub fn for_variant(variant: ChipVariant) -> Self {
        let lengths = Parameter::ALL
            .iter()
            .filter_map(|&p| p.len_for(variant).map(|len| (p, len)))
            .collect();
        Self { variant, lengths }
    }

    pub fn variant(&self) -> ChipVariant {
        self.variant
    }

    /// Payload length of `param`, `None` if unsupported on this chip.
    pub fn len(&self, param: Parameter) -> Option<usize> {
        self.lengths.get(&param).map(|&l| l as usize)
    }

    pub fn supports(&self, param: Parameter) -> bool {
        self.lengths.contains_key(&param)
    }
}

/// Firmware version as reported by `Parameter::FirmwareRevision`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirmwareRevision {
    /// Version string, e.g. "Rev 1.9.8.b".
    pub version: String,
    /// Hardware id word.
    pub hardware_id: u32,
}

impl FirmwareRevision {
    /// Decode the 24-byte element payload: 20 bytes of NUL-padded ASCII
    /// followed by a little-endian hardware id.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 24 {
            return None;
        }
        let text = &payload[..20];
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        let version = String::from_utf8_lossy(&text[..end]).into_owned();
        let hardware_id = u32::from_le_bytes([payload[20], payload[21], payload[22], payload[23]]);
        Some(Self {
            version,
            hardware_id,
        })
    }
}
