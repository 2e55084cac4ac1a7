//! Wrap-around identifiers used on the Cast wire.
//!
//! Frame ids are 8 bits, packet ids and RTP sequence numbers 16 bits; all of
//! them wrap. `a` is newer than `b` iff `a != b` and `(a - b) mod 2^w` is
//! below half the range. Algorithms must compare through these predicates,
//! never through `<`/`>` on the raw value (`Ord` is derived only so the ids
//! can key a `BTreeMap`).

use std::fmt;

const U8_HALF_RANGE: u8 = 0x80;
const U16_HALF_RANGE: u16 = 0x8000;

/// 8-bit frame identifier assigned by the sender in emission order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u8);

impl FrameId {
    /// Sentinel initial value; the first valid frame received is treated as
    /// the next frame after 255.
    pub const START: FrameId = FrameId(255);

    pub fn is_newer_than(self, other: FrameId) -> bool {
        self != other && self.0.wrapping_sub(other.0) < U8_HALF_RANGE
    }

    pub fn is_older_than(self, other: FrameId) -> bool {
        other.is_newer_than(self)
    }

    pub fn is_older_or_equal(self, other: FrameId) -> bool {
        self == other || other.is_newer_than(self)
    }

    pub fn next(self) -> FrameId {
        FrameId(self.0.wrapping_add(1))
    }

    pub fn previous(self) -> FrameId {
        FrameId(self.0.wrapping_sub(1))
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 0-based index of a packet within its frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(pub u16);

impl PacketId {
    pub fn is_newer_than(self, other: PacketId) -> bool {
        self != other && self.0.wrapping_sub(other.0) < U16_HALF_RANGE
    }

    pub fn is_older_than(self, other: PacketId) -> bool {
        other.is_newer_than(self)
    }

    pub fn next(self) -> PacketId {
        PacketId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 16-bit RTP sequence number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNum(pub u16);

impl SeqNum {
    pub fn is_newer_than(self, other: SeqNum) -> bool {
        self != other && self.0.wrapping_sub(other.0) < U16_HALF_RANGE
    }

    pub fn next(self) -> SeqNum {
        SeqNum(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Expands received 8-bit frame ids to a monotonically growing `u32`,
/// tracking wrap-arounds of the wire value.
#[derive(Debug, Default)]
pub struct FrameIdWrapHelper {
    last: Option<(FrameId, u32)>,
}

impl FrameIdWrapHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_to_32bits(&mut self, frame_id: FrameId) -> u32 {
        let expanded = match self.last {
            None => frame_id.0 as u32,
            Some((last_id, last_expanded)) => {
                if frame_id.is_newer_than(last_id) {
                    last_expanded.wrapping_add(frame_id.0.wrapping_sub(last_id.0) as u32)
                } else {
                    last_expanded.wrapping_sub(last_id.0.wrapping_sub(frame_id.0) as u32)
                }
            }
        };
        match self.last {
            Some((last_id, _)) if !frame_id.is_newer_than(last_id) => {}
            _ => self.last = Some((frame_id, expanded)),
        }
        expanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_id_newer_matches_half_range_rule() {
        for a in 0..=255u8 {
            for b in 0..=255u8 {
                let expected = (1..=127).contains(&a.wrapping_sub(b));
                assert_eq!(
                    FrameId(a).is_newer_than(FrameId(b)),
                    expected,
                    "a={a} b={b}"
                );
            }
        }
    }

    #[test]
    fn test_frame_id_older_or_equal() {
        assert!(FrameId(5).is_older_or_equal(FrameId(5)));
        assert!(FrameId(5).is_older_or_equal(FrameId(6)));
        assert!(!FrameId(6).is_older_or_equal(FrameId(5)));
        // Across the wrap.
        assert!(FrameId(250).is_older_or_equal(FrameId(3)));
        assert!(!FrameId(3).is_older_or_equal(FrameId(250)));
    }

    #[test]
    fn test_frame_id_wrap_increment() {
        assert_eq!(FrameId(255).next(), FrameId(0));
        assert_eq!(FrameId(0).previous(), FrameId(255));
        assert!(FrameId(0).is_newer_than(FrameId(255)));
        assert!(FrameId(255).is_older_than(FrameId(0)));
    }

    #[test]
    fn test_packet_id_newer() {
        assert!(PacketId(1).is_newer_than(PacketId(0)));
        assert!(!PacketId(0).is_newer_than(PacketId(0)));
        assert!(PacketId(0).is_newer_than(PacketId(0xffff)));
        assert!(PacketId(0x8000).is_newer_than(PacketId(1)));
        assert!(!PacketId(1).is_newer_than(PacketId(0x8000)));
    }

    #[test]
    fn test_seq_num_newer() {
        assert!(SeqNum(0).is_newer_than(SeqNum(0xffff)));
        assert!(SeqNum(100).is_newer_than(SeqNum(50)));
        assert!(!SeqNum(50).is_newer_than(SeqNum(100)));
    }

    #[test]
    fn test_wrap_helper_expands_across_wrap() {
        let mut helper = FrameIdWrapHelper::new();
        assert_eq!(helper.map_to_32bits(FrameId(254)), 254);
        assert_eq!(helper.map_to_32bits(FrameId(255)), 255);
        assert_eq!(helper.map_to_32bits(FrameId(0)), 256);
        assert_eq!(helper.map_to_32bits(FrameId(1)), 257);
        // An older id maps backwards without regressing the helper.
        assert_eq!(helper.map_to_32bits(FrameId(255)), 255);
        assert_eq!(helper.map_to_32bits(FrameId(2)), 258);
    }

    #[test]
    fn test_wrap_helper_multiple_wraps() {
        let mut helper = FrameIdWrapHelper::new();
        let mut expected = 0u32;
        assert_eq!(helper.map_to_32bits(FrameId(0)), 0);
        for _ in 0..600 {
            expected += 1;
            assert_eq!(helper.map_to_32bits(FrameId(expected as u8)), expected);
        }
    }
}
