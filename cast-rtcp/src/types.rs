use std::collections::{BTreeMap, BTreeSet};

/// A single loss entry with this packet id means the whole frame is gone.
pub const CAST_ALL_PACKETS_LOST: u16 = 0xffff;

/// At most this many Cast loss fields go into one feedback message; the
/// rest waits for the next one.
pub const MAX_CAST_LOSS_FIELDS: usize = 100;

/// At most this many generic NACK fields per message.
pub const MAX_NACK_FIELDS: usize = 253;

/// RFC 3550 page 44: CNAME limit, including the terminating null.
pub const MAX_CNAME_SIZE: usize = 256;

/// Packet ids missing within one frame.
pub type PacketIdSet = BTreeSet<u16>;
/// Frame id -> missing packet ids.
pub type MissingFramesAndPackets = BTreeMap<u8, PacketIdSet>;

/// The SR payload: NTP/RTP pair for lip sync plus send counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtcpSenderInfo {
    pub ntp_seconds: u32,
    pub ntp_fraction: u32,
    pub rtp_timestamp: u32,
    pub send_packet_count: u32,
    pub send_octet_count: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtcpReportBlock {
    /// SSRC of the reporting end.
    pub remote_ssrc: u32,
    /// SSRC of the RTP stream this block describes.
    pub media_ssrc: u32,
    pub fraction_lost: u8,
    /// 24 bits valid.
    pub cumulative_lost: u32,
    pub extended_high_sequence_number: u32,
    pub jitter: u32,
    /// Middle 32 bits of the last received SR's NTP timestamp.
    pub last_sr: u32,
    /// Units of 1/65536 s.
    pub delay_since_last_sr: u32,
}

/// Cast ACK + NACK feedback. `ack_frame_id` is the 32-bit expansion of the
/// 8-bit wire value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtcpCastMessage {
    pub media_ssrc: u32,
    pub ack_frame_id: u32,
    pub missing_frames_and_packets: MissingFramesAndPackets,
}

impl RtcpCastMessage {
    pub fn new(media_ssrc: u32) -> Self {
        Self {
            media_ssrc,
            ack_frame_id: 0,
            missing_frames_and_packets: MissingFramesAndPackets::new(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtcpNackMessage {
    pub remote_ssrc: u32,
    /// Sorted, duplicate-free sequence numbers.
    pub nack_list: Vec<u16>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtcpRembMessage {
    pub remb_bitrate: u32,
    pub remb_ssrcs: Vec<u32>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtcpRpsiMessage {
    pub remote_ssrc: u32,
    pub payload_type: u8,
    pub picture_id: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtcpReceiverReferenceTimeReport {
    pub ntp_seconds: u32,
    pub ntp_fraction: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtcpDlrrReportBlock {
    pub last_rr: u32,
    pub delay_since_last_rr: u32,
}

/// What happened to a frame on the sender side.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RtcpSenderFrameStatus {
    #[default]
    Unknown,
    DroppedByEncoder,
    DroppedByFlowControl,
    SentToNetwork,
}

impl RtcpSenderFrameStatus {
    pub fn to_wire(self) -> u8 {
        match self {
            RtcpSenderFrameStatus::Unknown => 0,
            RtcpSenderFrameStatus::DroppedByEncoder => 1,
            RtcpSenderFrameStatus::DroppedByFlowControl => 2,
            RtcpSenderFrameStatus::SentToNetwork => 3,
        }
    }

    pub fn from_wire(status: u8) -> Self {
        match status {
            1 => RtcpSenderFrameStatus::DroppedByEncoder,
            2 => RtcpSenderFrameStatus::DroppedByFlowControl,
            3 => RtcpSenderFrameStatus::SentToNetwork,
            _ => RtcpSenderFrameStatus::Unknown,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtcpSenderFrameLogMessage {
    pub frame_status: RtcpSenderFrameStatus,
    /// Only the low 24 bits go on the wire.
    pub rtp_timestamp: u32,
}

pub type RtcpSenderLogMessage = Vec<RtcpSenderFrameLogMessage>;

/// Receiver-side events carried in the receiver log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CastLoggingEvent {
    #[default]
    Unknown,
    AckSent,
    AudioPlayoutDelay,
    AudioFrameDecoded,
    VideoFrameDecoded,
    VideoRenderDelay,
    PacketReceived,
}

impl CastLoggingEvent {
    pub fn to_wire(self) -> u8 {
        match self {
            CastLoggingEvent::Unknown => 0,
            CastLoggingEvent::AckSent => 1,
            CastLoggingEvent::AudioPlayoutDelay => 2,
            CastLoggingEvent::AudioFrameDecoded => 3,
            CastLoggingEvent::VideoFrameDecoded => 4,
            CastLoggingEvent::VideoRenderDelay => 5,
            CastLoggingEvent::PacketReceived => 6,
        }
    }

    pub fn from_wire(event: u8) -> Self {
        match event {
            1 => CastLoggingEvent::AckSent,
            2 => CastLoggingEvent::AudioPlayoutDelay,
            3 => CastLoggingEvent::AudioFrameDecoded,
            4 => CastLoggingEvent::VideoFrameDecoded,
            5 => CastLoggingEvent::VideoRenderDelay,
            6 => CastLoggingEvent::PacketReceived,
            _ => CastLoggingEvent::Unknown,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtcpReceiverEventLogMessage {
    pub event: CastLoggingEvent,
    /// Milliseconds; base + delta on the wire.
    pub event_timestamp_ms: u64,
    pub delay_delta_or_packet_id: u16,
}

/// Events clustered per frame, keyed by the frame's RTP timestamp.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtcpReceiverFrameLogMessage {
    pub rtp_timestamp: u32,
    pub event_log_messages: Vec<RtcpReceiverEventLogMessage>,
}

pub type RtcpReceiverLogMessage = Vec<RtcpReceiverFrameLogMessage>;
