pub mod packet_storage;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use rtcp::types::{RtcpSenderFrameLogMessage, RtcpSenderFrameStatus, RtcpSenderLogMessage};
use rtp::packetizer::{RtpPacketizer, RtpPacketizerConfig, VIDEO_FREQUENCY};
use shared::error::Result;
use shared::util::is_rtcp;
use shared::wrap::{FrameId, PacketId, SeqNum};

use crate::config::{AudioSenderConfig, EncodedAudioFrame, EncodedVideoFrame, VideoSenderConfig};
use crate::crypto::FrameCrypto;
use crate::pacing::PacedPacketSender;
use crate::rtcp_session::{Rtcp, RtcpEvent, RttStats};
use packet_storage::PacketStorage;

const MAX_LOGGED_FRAMES: usize = 20;

/// What the application (encoder control loop) should react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderEvent {
    /// A NACKed frame left storage, or the peer sent PLI/FIR: produce a key
    /// frame.
    RequestKeyFrame,
    /// Feedback ACKed up to this frame; feed the encoder's reference
    /// selection.
    AckReceived(FrameId),
}

/// One outgoing Cast media stream: packetize, store for retransmit, send
/// periodic sender reports and answer feedback.
pub struct CastSender {
    audio: bool,
    frequency: u32,
    packetizer: RtpPacketizer,
    storage: PacketStorage,
    crypto: Option<FrameCrypto>,
    rtcp: Rtcp,
    sender_log: RtcpSenderLogMessage,
    events: VecDeque<SenderEvent>,
}

impl CastSender {
    pub fn new_audio(config: &AudioSenderConfig) -> Result<Self> {
        let crypto = FrameCrypto::from_config(&config.aes_key, &config.aes_iv_mask)?;
        Ok(Self {
            audio: true,
            frequency: config.frequency as u32,
            packetizer: RtpPacketizer::new(RtpPacketizerConfig {
                audio: true,
                payload_type: config.rtp_payload_type as u8,
                sequence_number: SeqNum(rand::random()),
                frequency: config.frequency as u32,
                ssrc: config.sender_ssrc,
                ..Default::default()
            }),
            storage: PacketStorage::new(Duration::from_millis(config.rtp_history_ms as u64)),
            crypto,
            rtcp: Rtcp::new(
                config.sender_ssrc,
                config.incoming_feedback_ssrc,
                config.rtcp_c_name.clone(),
                config.rtcp_mode,
                Duration::from_millis(config.rtcp_interval_ms as u64),
                true,
            ),
            sender_log: RtcpSenderLogMessage::new(),
            events: VecDeque::new(),
        })
    }

    pub fn new_video(config: &VideoSenderConfig) -> Result<Self> {
        let crypto = FrameCrypto::from_config(&config.aes_key, &config.aes_iv_mask)?;
        Ok(Self {
            audio: false,
            frequency: VIDEO_FREQUENCY,
            packetizer: RtpPacketizer::new(RtpPacketizerConfig {
                audio: false,
                payload_type: config.rtp_payload_type as u8,
                sequence_number: SeqNum(rand::random()),
                frequency: VIDEO_FREQUENCY,
                ssrc: config.sender_ssrc,
                ..Default::default()
            }),
            storage: PacketStorage::new(Duration::from_millis(config.rtp_history_ms as u64)),
            crypto,
            rtcp: Rtcp::new(
                config.sender_ssrc,
                config.incoming_feedback_ssrc,
                config.rtcp_c_name.clone(),
                config.rtcp_mode,
                Duration::from_millis(config.rtcp_interval_ms as u64),
                true,
            ),
            sender_log: RtcpSenderLogMessage::new(),
            events: VecDeque::new(),
        })
    }

    /// Packetize and send one coded audio frame.
    ///
    /// The RTP timestamp advances by `frame.samples`; keeping capture times
    /// monotonic is the application's responsibility.
    pub fn insert_coded_audio_frame(
        &mut self,
        now: Instant,
        frame: &EncodedAudioFrame,
        pacer: &mut impl PacedPacketSender,
    ) {
        debug_assert!(self.audio);
        let data = self.maybe_encrypt(frame.frame_id, &frame.data);
        let packets = self
            .packetizer
            .packetize_audio(frame.frame_id, frame.samples, now, &data);
        self.send_frame(now, frame.frame_id, packets, pacer);
    }

    /// Packetize and send one coded video frame captured at `capture_time`.
    pub fn insert_coded_video_frame(
        &mut self,
        frame: &EncodedVideoFrame,
        capture_time: Instant,
        pacer: &mut impl PacedPacketSender,
    ) {
        debug_assert!(!self.audio);
        let data = self.maybe_encrypt(frame.frame_id, &frame.data);
        let packets = self.packetizer.packetize_video(
            frame.key_frame,
            frame.frame_id,
            frame.last_referenced_frame_id,
            capture_time,
            &data,
        );
        self.send_frame(capture_time, frame.frame_id, packets, pacer);
    }

    fn maybe_encrypt(&self, frame_id: FrameId, data: &Bytes) -> Bytes {
        match self.crypto {
            Some(ref crypto) => Bytes::from(crypto.encrypt(frame_id, data)),
            None => data.clone(),
        }
    }

    fn send_frame(
        &mut self,
        now: Instant,
        frame_id: FrameId,
        packets: Vec<Bytes>,
        pacer: &mut impl PacedPacketSender,
    ) {
        for (packet_id, packet) in packets.iter().enumerate() {
            self.storage
                .store_packet(now, frame_id, PacketId(packet_id as u16), packet.clone());
        }
        if let Some((_, rtp_timestamp)) = self.packetizer.last_sent_timestamp() {
            self.log_frame(RtcpSenderFrameStatus::SentToNetwork, rtp_timestamp);
        }
        pacer.send_packets(packets);
    }

    /// Record a frame the encoder or flow control dropped, for the log.
    pub fn log_dropped_frame(&mut self, status: RtcpSenderFrameStatus, rtp_timestamp: u32) {
        self.log_frame(status, rtp_timestamp);
    }

    fn log_frame(&mut self, frame_status: RtcpSenderFrameStatus, rtp_timestamp: u32) {
        self.sender_log.push(RtcpSenderFrameLogMessage {
            frame_status,
            rtp_timestamp: rtp_timestamp & 0x00ff_ffff,
        });
        if self.sender_log.len() > MAX_LOGGED_FRAMES {
            self.sender_log.remove(0);
        }
    }

    /// Feed one incoming datagram (RTCP expected; RTP is not for us).
    pub fn handle_packet(
        &mut self,
        now: Instant,
        packet: &[u8],
        pacer: &mut impl PacedPacketSender,
    ) {
        if !is_rtcp(packet) {
            warn!("sender received a non-rtcp datagram; dropping");
            return;
        }
        for event in self.rtcp.handle_rtcp_packet(now, packet) {
            match event {
                RtcpEvent::CastFeedback(message) => {
                    self.events
                        .push_back(SenderEvent::AckReceived(FrameId(message.ack_frame_id as u8)));
                    if !message.missing_frames_and_packets.is_empty() {
                        self.resend_packets(&message, pacer);
                    }
                }
                RtcpEvent::KeyFrameRequest => {
                    self.events.push_back(SenderEvent::RequestKeyFrame);
                }
                RtcpEvent::NackRequest(sequence_numbers) => {
                    // Generic NACKs carry sequence numbers we do not index
                    // storage by; Cast feedback is the retransmit path.
                    debug!("ignoring generic nack for {} packets", sequence_numbers.len());
                }
                RtcpEvent::SendReportRequest => {
                    self.send_rtcp_report(now, pacer);
                }
                RtcpEvent::ReceivedRemb { bitrate } => {
                    debug!("received remb, {bitrate} bps");
                }
                RtcpEvent::ReceiverLog(log) => {
                    debug!("received receiver event log, {} frames", log.len());
                }
                RtcpEvent::Rpsi { picture_id, .. } => {
                    debug!("received rpsi for picture {picture_id}");
                }
                RtcpEvent::SenderLog(_) => {}
            }
        }
    }

    fn resend_packets(
        &mut self,
        message: &rtcp::types::RtcpCastMessage,
        pacer: &mut impl PacedPacketSender,
    ) {
        let (packets, any_frame_evicted) =
            self.storage.get_packets(&message.missing_frames_and_packets);
        debug!(
            "resending {} packets for {} frames",
            packets.len(),
            message.missing_frames_and_packets.len()
        );
        if !packets.is_empty() {
            pacer.resend_packets(packets);
        }
        if any_frame_evicted {
            // Too late for retransmission; restart from a key frame.
            self.events.push_back(SenderEvent::RequestKeyFrame);
        }
    }

    pub fn poll_event(&mut self) -> Option<SenderEvent> {
        self.events.pop_front()
    }

    pub fn poll_timeout(&mut self, now: Instant) -> Option<Instant> {
        Some(self.rtcp.time_to_send_next_rtcp_report(now))
    }

    pub fn handle_timeout(&mut self, now: Instant, pacer: &mut impl PacedPacketSender) {
        if self.rtcp.time_to_send_next_rtcp_report(now) <= now {
            self.send_rtcp_report(now, pacer);
        }
    }

    /// Send the periodic SR; the RTP timestamp extrapolates from the last
    /// sent frame to "now" on the media clock.
    pub fn send_rtcp_report(&mut self, now: Instant, pacer: &mut impl PacedPacketSender) {
        let rtp_timestamp = match self.packetizer.last_sent_timestamp() {
            Some((sent, rtp_timestamp)) => {
                let elapsed = now.saturating_duration_since(sent);
                rtp_timestamp.wrapping_add(
                    (elapsed.as_micros() as u64 * self.frequency as u64 / 1_000_000) as u32,
                )
            }
            None => 0,
        };
        let log = std::mem::take(&mut self.sender_log);
        self.rtcp.send_rtcp_from_rtp_sender(
            now,
            rtp_timestamp,
            self.packetizer.send_packets_count(),
            self.packetizer.send_octet_count(),
            Some(&log),
            pacer,
        );
    }

    pub fn rtt(&self) -> Option<RttStats> {
        self.rtcp.rtt()
    }
}
