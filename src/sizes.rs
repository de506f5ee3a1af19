//! Size arithmetic for the layer stack
//!
//! All sizes in the engine are tracked in KiB, matching the unit the
//! external tools report. This module holds the rounding helpers, the
//! size-state classification used after discovery and the DRBD external
//! metadata formula.

use serde::{Deserialize, Serialize};

/// One MiB expressed in KiB
pub const MIB_IN_KIB: u64 = 1024;

/// One GiB expressed in KiB
pub const GIB_IN_KIB: u64 = 1024 * 1024;

/// Fixed LUKS2 header overhead (16 MiB)
pub const LUKS_HEADER_KIB: u64 = 16 * MIB_IN_KIB;

/// How many allocation extents a discovered device may exceed its expected
/// size by and still count as `TooLargeWithinTolerance`. Provider-specific
/// in principle; all shipped providers use the same factor.
pub const TOLERANCE_FACTOR: u64 = 3;

/// Classification of actual vs. expected device size after discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeState {
    AsExpected,
    TooSmall,
    TooLarge,
    TooLargeWithinTolerance,
}

impl SizeState {
    pub fn is_as_expected(&self) -> bool {
        matches!(self, SizeState::AsExpected | SizeState::TooLargeWithinTolerance)
    }
}

/// Round `size_kib` up to the next multiple of `unit_kib`
pub fn round_up(size_kib: u64, unit_kib: u64) -> u64 {
    if unit_kib == 0 {
        return size_kib;
    }
    size_kib.div_ceil(unit_kib) * unit_kib
}

/// Classify a discovered size against the expected size.
///
/// An oversized device within `TOLERANCE_FACTOR` allocation extents of the
/// expectation is tolerated; anything larger is reported as `TooLarge` so
/// the controller can decide whether a shrink is wanted.
pub fn classify(actual_kib: u64, expected_kib: u64, extent_kib: u64) -> SizeState {
    if actual_kib == expected_kib {
        SizeState::AsExpected
    } else if actual_kib < expected_kib {
        SizeState::TooSmall
    } else if actual_kib <= expected_kib + extent_kib * TOLERANCE_FACTOR {
        SizeState::TooLargeWithinTolerance
    } else {
        SizeState::TooLarge
    }
}

/// Evaluate a percentage-or-absolute size property value.
///
/// `"5%"` yields five percent of `base_kib` rounded up to the next whole
/// KiB; a plain number is taken as an absolute size in KiB.
pub fn eval_size_or_percent(value: &str, base_kib: u64) -> crate::error::Result<u64> {
    let value = value.trim();
    if let Some(pct_str) = value.strip_suffix('%') {
        let pct: f64 = pct_str
            .trim()
            .parse()
            .map_err(|_| crate::error::Error::CapacityParse(value.to_string()))?;
        if !(0.0..=100.0).contains(&pct) {
            return Err(crate::error::Error::CapacityParse(value.to_string()));
        }
        Ok((pct / 100.0 * base_kib as f64).ceil() as u64)
    } else {
        value
            .parse()
            .map_err(|_| crate::error::Error::CapacityParse(value.to_string()))
    }
}

/// Size of an external DRBD metadata device for a data device of
/// `data_kib`, `peer_slots` peers and `al_stripes` activity log stripes.
///
/// Per-peer bitmap: one bit per 4 KiB of data, rounded up to 4 KiB blocks;
/// the activity log occupies `al_stripes` times the 32 KiB default stripe
/// size plus the metadata superblock. Result is rounded up to 4 KiB.
pub fn drbd_external_meta_size_kib(data_kib: u64, peer_slots: u8, al_stripes: u32) -> u64 {
    let bitmap_bits_per_peer = data_kib.div_ceil(4);
    let bitmap_kib_per_peer = round_up(bitmap_bits_per_peer.div_ceil(8 * 1024), 4);
    let al_kib = (al_stripes as u64) * 32;
    // 4 KiB superblock
    round_up(bitmap_kib_per_peer * peer_slots as u64 + al_kib + 4, 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1000, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_up(17, 0), 17);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(1024, 1024, 4096), SizeState::AsExpected);
        assert_eq!(classify(512, 1024, 4096), SizeState::TooSmall);
        // within 3 extents above expectation
        assert_eq!(
            classify(GIB_IN_KIB + 4096, GIB_IN_KIB, 4096),
            SizeState::TooLargeWithinTolerance
        );
        assert_eq!(
            classify(GIB_IN_KIB + 3 * 4096, GIB_IN_KIB, 4096),
            SizeState::TooLargeWithinTolerance
        );
        assert_eq!(
            classify(GIB_IN_KIB + 3 * 4096 + 1, GIB_IN_KIB, 4096),
            SizeState::TooLarge
        );
    }

    #[test]
    fn test_eval_size_or_percent() {
        // 5% of 1 GiB = 52428.8 KiB, rounded up
        assert_eq!(eval_size_or_percent("5%", GIB_IN_KIB).unwrap(), 52429);
        assert_eq!(eval_size_or_percent("100%", 1000).unwrap(), 1000);
        assert_eq!(eval_size_or_percent("8192", GIB_IN_KIB).unwrap(), 8192);
        assert!(eval_size_or_percent("banana", 1000).is_err());
        assert!(eval_size_or_percent("150%", 1000).is_err());
    }

    #[test]
    fn test_drbd_meta_size_grows_with_peers() {
        let one_peer = drbd_external_meta_size_kib(GIB_IN_KIB, 1, 1);
        let seven_peers = drbd_external_meta_size_kib(GIB_IN_KIB, 7, 1);
        assert!(seven_peers > one_peer);
        assert_eq!(one_peer % 4, 0);
        assert_eq!(seven_peers % 4, 0);
    }
}
