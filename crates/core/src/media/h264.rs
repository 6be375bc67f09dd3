//! H.264 NAL unit header inspection (ITU-T H.264 §7.3.1, RFC 6184 §1.3).
//!
//! Only the 5-bit `nal_unit_type` from the first header byte is used:
//!
//! ```text
//! +---------------+
//! |0|1|2|3|4|5|6|7|
//! +-+-+-+-+-+-+-+-+
//! |F|NRI|  Type   |
//! +---------------+
//! ```
//!
//! | Type | Meaning | [`UnitKind`] |
//! |------|---------|--------------|
//! | 1 | non-IDR slice | `Picture` |
//! | 2–4 | slice data partitions | `Picture` |
//! | 5 | IDR slice | `Picture` |
//! | 6 | SEI | `ParameterSet` |
//! | 7 | SPS | `ParameterSet` |
//! | 8 | PPS | `ParameterSet` |
//! | 9 | access unit delimiter | `ParameterSet` |
//! | other | reserved / extensions | `ParameterSet` |
//!
//! Everything that is not coded picture data is grouped with the parameter
//! sets: none of it carries presentation time of its own, so it is sent
//! with zero duration ahead of the pictures it precedes.

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// Coarse classification of a NAL unit for timestamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Sequence/picture parameter sets and other non-picture units.
    ParameterSet,
    /// Coded slice data (VCL NAL units 1–5).
    Picture,
}

/// `nal_unit_type` of a NAL payload (start code already stripped).
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

pub fn classify(nal: &[u8]) -> UnitKind {
    match nal_type(nal) {
        Some(t) if (NAL_SLICE..=NAL_IDR).contains(&t) => UnitKind::Picture,
        _ => UnitKind::ParameterSet,
    }
}

/// IDR slice: decodable without any earlier picture.
pub fn is_keyframe(nal: &[u8]) -> bool {
    nal_type(nal) == Some(NAL_IDR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_slices_as_pictures() {
        assert_eq!(classify(&[0x65, 0x88]), UnitKind::Picture);
        assert_eq!(classify(&[0x41, 0x9a]), UnitKind::Picture);
        assert_eq!(classify(&[0x21]), UnitKind::Picture);
    }

    #[test]
    fn classifies_non_vcl_as_parameter_sets() {
        assert_eq!(classify(&[0x67, 0x42]), UnitKind::ParameterSet);
        assert_eq!(classify(&[0x68, 0xce]), UnitKind::ParameterSet);
        assert_eq!(classify(&[0x06, 0x05]), UnitKind::ParameterSet);
        assert_eq!(classify(&[0x09, 0xf0]), UnitKind::ParameterSet);
        assert_eq!(classify(&[]), UnitKind::ParameterSet);
    }

    #[test]
    fn nal_type_masks_header_bits() {
        // F=0, NRI=3, type=5
        assert_eq!(nal_type(&[0x65]), Some(NAL_IDR));
        assert!(is_keyframe(&[0x65]));
        assert!(!is_keyframe(&[0x41]));
        assert!(!is_keyframe(&[0x67]));
        assert_eq!(nal_type(&[]), None);
    }
}
