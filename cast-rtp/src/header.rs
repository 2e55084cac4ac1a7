use shared::wrap::{FrameId, PacketId, SeqNum};

/// Length of the RFC 3550 fixed header.
pub const RTP_HEADER_LEN: usize = 12;
/// Length of the Cast extension when the reference bit is set; one byte
/// shorter otherwise.
pub const CAST_HEADER_LEN: usize = 7;

pub(crate) const RTP_VERSION: u8 = 2;
pub(crate) const KEY_FRAME_BIT: u8 = 0x80;
pub(crate) const REFERENCE_FRAME_ID_BIT: u8 = 0x40;
pub(crate) const MARKER_BIT: u8 = 0x80;

/// The RFC 3550 fields Cast uses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: SeqNum,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// The 7-byte Cast extension that follows the RTP header.
///
/// `reference_frame_id` is only on the wire when `is_reference` is set; a
/// cleared bit means the frame references its immediate predecessor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CastHeader {
    pub is_key_frame: bool,
    pub is_reference: bool,
    pub frame_id: FrameId,
    pub packet_id: PacketId,
    pub max_packet_id: PacketId,
    pub reference_frame_id: FrameId,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtpCastHeader {
    pub rtp: RtpHeader,
    pub cast: CastHeader,
}

impl RtpCastHeader {
    /// The frame this packet's frame depends on: the explicit reference when
    /// present, the previous frame otherwise.
    pub fn referenced_frame_id(&self) -> FrameId {
        if self.cast.is_reference {
            self.cast.reference_frame_id
        } else {
            self.cast.frame_id.previous()
        }
    }
}
