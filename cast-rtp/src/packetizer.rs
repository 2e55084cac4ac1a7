use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use shared::wrap::{FrameId, PacketId, SeqNum};

use crate::header::{CastHeader, RtpCastHeader, RtpHeader, CAST_HEADER_LEN, RTP_HEADER_LEN};
use crate::packet::marshal_header;

/// RTP clock rate for video streams.
pub const VIDEO_FREQUENCY: u32 = 90_000;

/// Default payload budget: an IP packet minus IPv4 + UDP headers.
const DEFAULT_MAX_PAYLOAD_LENGTH: u16 = 1500 - 28;

#[derive(Debug, Clone, Copy)]
pub struct RtpPacketizerConfig {
    pub audio: bool,
    pub payload_type: u8,
    pub max_payload_length: u16,
    pub sequence_number: SeqNum,
    pub rtp_timestamp: u32,
    pub frequency: u32,
    pub ssrc: u32,
}

impl Default for RtpPacketizerConfig {
    fn default() -> Self {
        Self {
            audio: false,
            payload_type: 0,
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
            sequence_number: SeqNum(0),
            rtp_timestamp: 0,
            frequency: 8000,
            ssrc: 0,
        }
    }
}

/// Splits encoded frames into Cast RTP packets.
///
/// Owns the stream sequence number and RTP timestamp: audio frames advance
/// the timestamp by their sample count, video frames stamp a 90 kHz clock
/// derived from the capture instant.
pub struct RtpPacketizer {
    config: RtpPacketizerConfig,
    sequence_number: SeqNum,
    rtp_timestamp: u32,
    video_epoch: Option<Instant>,
    time_last_sent: Option<Instant>,
    send_packets_count: u32,
    send_octet_count: u32,
}

impl RtpPacketizer {
    pub fn new(config: RtpPacketizerConfig) -> Self {
        Self {
            config,
            sequence_number: config.sequence_number,
            rtp_timestamp: config.rtp_timestamp,
            video_epoch: None,
            time_last_sent: None,
            send_packets_count: 0,
            send_octet_count: 0,
        }
    }

    /// Packetizes an encoded video frame captured at `capture_time`.
    pub fn packetize_video(
        &mut self,
        key_frame: bool,
        frame_id: FrameId,
        reference_frame_id: FrameId,
        capture_time: Instant,
        data: &[u8],
    ) -> Vec<Bytes> {
        debug_assert!(!self.config.audio);
        let epoch = *self.video_epoch.get_or_insert(capture_time);
        let elapsed = capture_time.saturating_duration_since(epoch);
        self.rtp_timestamp = self
            .config
            .rtp_timestamp
            .wrapping_add((elapsed.as_micros() as u64 * VIDEO_FREQUENCY as u64 / 1_000_000) as u32);
        self.time_last_sent = Some(capture_time);
        self.cast(key_frame, frame_id, reference_frame_id, data)
    }

    /// Packetizes an encoded audio frame recorded at `recorded_time`.
    ///
    /// The RTP timestamp advances by `samples` with no monotonicity check;
    /// feeding frames out of capture order is the caller's bug.
    pub fn packetize_audio(
        &mut self,
        frame_id: FrameId,
        samples: u32,
        recorded_time: Instant,
        data: &[u8],
    ) -> Vec<Bytes> {
        debug_assert!(self.config.audio);
        self.rtp_timestamp = self.rtp_timestamp.wrapping_add(samples);
        self.time_last_sent = Some(recorded_time);
        self.cast(true, frame_id, FrameId(0), data)
    }

    fn cast(
        &mut self,
        is_key: bool,
        frame_id: FrameId,
        reference_frame_id: FrameId,
        data: &[u8],
    ) -> Vec<Bytes> {
        let header_length = RTP_HEADER_LEN + CAST_HEADER_LEN;
        let max_length = self.config.max_payload_length as usize - header_length;

        // Split the payload evenly across the minimum number of packets.
        let num_packets = data.len().div_ceil(max_length).max(1);
        let payload_length = data.len().div_ceil(num_packets);

        let mut packets = Vec::with_capacity(num_packets);
        let mut remaining = data;
        for packet_id in 0..num_packets as u16 {
            let take = payload_length.min(remaining.len());
            let (chunk, rest) = remaining.split_at(take);
            remaining = rest;

            let header = RtpCastHeader {
                rtp: RtpHeader {
                    marker: remaining.is_empty(),
                    payload_type: self.config.payload_type,
                    sequence_number: self.next_sequence_number(),
                    timestamp: self.rtp_timestamp,
                    ssrc: self.config.ssrc,
                },
                cast: CastHeader {
                    is_key_frame: is_key,
                    is_reference: true,
                    frame_id,
                    packet_id: PacketId(packet_id),
                    max_packet_id: PacketId(num_packets as u16 - 1),
                    reference_frame_id,
                },
            };
            let mut buf = BytesMut::with_capacity(header_length + chunk.len());
            marshal_header(&header, &mut buf);
            buf.put_slice(chunk);
            packets.push(buf.freeze());

            self.send_packets_count += 1;
            self.send_octet_count += chunk.len() as u32;
        }
        packets
    }

    fn next_sequence_number(&mut self) -> SeqNum {
        let current = self.sequence_number;
        self.sequence_number = self.sequence_number.next();
        current
    }

    /// The last frame's RTP timestamp and its send time, for extrapolating
    /// the RTP timestamp carried in sender reports.
    pub fn last_sent_timestamp(&self) -> Option<(Instant, u32)> {
        self.time_last_sent.map(|t| (t, self.rtp_timestamp))
    }

    pub fn send_packets_count(&self) -> u32 {
        self.send_packets_count
    }

    pub fn send_octet_count(&self) -> u32 {
        self.send_octet_count
    }
}
