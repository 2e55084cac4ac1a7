pub mod playout;
pub mod receiver_stats;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use rtcp::types::{
    CastLoggingEvent, RtcpCastMessage, RtcpReceiverEventLogMessage, RtcpReceiverFrameLogMessage,
    RtcpReceiverLogMessage,
};
use rtp::parser::RtpParser;
use shared::error::Result;
use shared::util::is_rtcp;

use crate::config::{AudioReceiverConfig, EncodedFrame, VideoReceiverConfig};
use crate::crypto::FrameCrypto;
use crate::framer::Framer;
use crate::pacing::PacedPacketSender;
use crate::receiver::playout::PlayoutEstimator;
use crate::receiver::receiver_stats::ReceiverStats;
use crate::rtcp_session::{Rtcp, RtcpEvent};

/// Longest a non-continuous frame sits ready before its playout deadline.
pub const MAX_FRAME_WAIT: Duration = Duration::from_millis(20);
/// Floor for re-arming any scheduler wakeup.
pub const MIN_SCHEDULING_DELAY: Duration = Duration::from_millis(1);

const MAX_LOGGED_FRAMES: usize = 20;

/// One incoming Cast media stream: RTP/RTCP demux, jitter buffer, optional
/// decryption, feedback emission and playout scheduling.
///
/// Sans-io: feed datagrams with [`CastReceiver::handle_packet`], honor
/// [`CastReceiver::poll_timeout`] with [`CastReceiver::handle_timeout`], ask
/// for frames with [`CastReceiver::get_encoded_frame`] and collect them from
/// [`CastReceiver::poll_frame`].
pub struct CastReceiver {
    audio: bool,
    frequency: u32,
    parser: RtpParser,
    framer: Framer,
    crypto: Option<FrameCrypto>,
    rtcp: Rtcp,
    stats: ReceiverStats,
    playout: PlayoutEstimator,

    pending_requests: usize,
    delivered: VecDeque<(EncodedFrame, Instant)>,
    playout_wakeup: Option<Instant>,

    log_epoch: Option<Instant>,
    event_log: RtcpReceiverLogMessage,
}

impl CastReceiver {
    pub fn new_audio(config: &AudioReceiverConfig) -> Result<Self> {
        let crypto = FrameCrypto::from_config(&config.aes_key, &config.aes_iv_mask)?;
        let frequency = config.frequency as u32;
        Ok(Self {
            audio: true,
            frequency,
            parser: RtpParser::new(config.incoming_ssrc, config.rtp_payload_type as u8),
            framer: Framer::new(config.incoming_ssrc, true, 0),
            crypto,
            rtcp: Rtcp::new(
                config.feedback_ssrc,
                config.incoming_ssrc,
                config.rtcp_c_name.clone(),
                config.rtcp_mode,
                Duration::from_millis(config.rtcp_interval_ms as u64),
                false,
            ),
            stats: ReceiverStats::new(frequency),
            playout: PlayoutEstimator::new(
                frequency,
                Duration::from_millis(config.rtp_max_delay_ms as u64),
            ),
            pending_requests: 0,
            delivered: VecDeque::new(),
            playout_wakeup: None,
            log_epoch: None,
            event_log: RtcpReceiverLogMessage::new(),
        })
    }

    pub fn new_video(config: &VideoReceiverConfig) -> Result<Self> {
        let crypto = FrameCrypto::from_config(&config.aes_key, &config.aes_iv_mask)?;
        let max_unacked_frames = if config.max_unacked_frames > 0 {
            config.max_unacked_frames as usize
        } else {
            // Frames in flight over the retransmission window.
            (config.rtp_max_delay_ms * config.max_frame_rate / 1000).max(1) as usize
        };
        Ok(Self {
            audio: false,
            frequency: rtp::packetizer::VIDEO_FREQUENCY,
            parser: RtpParser::new(config.incoming_ssrc, config.rtp_payload_type as u8),
            framer: Framer::new(
                config.incoming_ssrc,
                config.decoder_faster_than_max_frame_rate,
                max_unacked_frames,
            ),
            crypto,
            rtcp: Rtcp::new(
                config.feedback_ssrc,
                config.incoming_ssrc,
                config.rtcp_c_name.clone(),
                config.rtcp_mode,
                Duration::from_millis(config.rtcp_interval_ms as u64),
                false,
            ),
            stats: ReceiverStats::new(rtp::packetizer::VIDEO_FREQUENCY),
            playout: PlayoutEstimator::new(
                rtp::packetizer::VIDEO_FREQUENCY,
                Duration::from_millis(config.rtp_max_delay_ms as u64),
            ),
            pending_requests: 0,
            delivered: VecDeque::new(),
            playout_wakeup: None,
            log_epoch: None,
            event_log: RtcpReceiverLogMessage::new(),
        })
    }

    /// Feed one UDP datagram (RTP or RTCP) from the wire.
    pub fn handle_packet(
        &mut self,
        now: Instant,
        packet: &[u8],
        pacer: &mut impl PacedPacketSender,
    ) {
        if is_rtcp(packet) {
            for event in self.rtcp.handle_rtcp_packet(now, packet) {
                if event == RtcpEvent::SendReportRequest {
                    self.send_rtcp_report(now, pacer);
                }
            }
            return;
        }

        let packet = match self.parser.parse(packet) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("dropping rtp packet: {err}");
                return;
            }
        };

        self.stats.process_rtp(
            now,
            packet.header.rtp.sequence_number,
            packet.header.rtp.timestamp,
        );
        self.playout.on_packet(now, packet.header.rtp.timestamp);
        if self.log_epoch.is_none() {
            self.log_epoch = Some(now);
        }
        self.log_event(
            now,
            packet.header.rtp.timestamp,
            CastLoggingEvent::PacketReceived,
            packet.header.cast.packet_id.0,
        );

        self.framer
            .insert_packet(now, packet.payload, &packet.header);
        self.flush_feedback(now, pacer);
        self.try_release(now);
        self.flush_feedback(now, pacer);
    }

    /// Ask for the next frame in decode order; it arrives on
    /// [`CastReceiver::poll_frame`] once complete and due.
    pub fn get_encoded_frame(&mut self, now: Instant, pacer: &mut impl PacedPacketSender) {
        self.pending_requests += 1;
        self.try_release(now);
        self.flush_feedback(now, pacer);
    }

    /// Frames released for playout, paired with their playout instant.
    pub fn poll_frame(&mut self) -> Option<(EncodedFrame, Instant)> {
        self.delivered.pop_front()
    }

    /// The next instant [`CastReceiver::handle_timeout`] wants to run.
    /// `None` before the first packet has arrived.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<Instant> {
        if !self.playout.has_seen_packet() {
            return None;
        }
        let mut wakeup = self.rtcp.time_to_send_next_rtcp_report(now);
        if let Some(time) = self.framer.time_to_send_next_cast_message(now) {
            wakeup = wakeup.min(time);
        }
        if let Some(time) = self.playout_wakeup {
            wakeup = wakeup.min(time);
        }
        Some(wakeup.max(now + MIN_SCHEDULING_DELAY))
    }

    pub fn handle_timeout(&mut self, now: Instant, pacer: &mut impl PacedPacketSender) {
        if !self.playout.has_seen_packet() {
            return;
        }
        if self.rtcp.time_to_send_next_rtcp_report(now) <= now {
            self.send_rtcp_report(now, pacer);
        }
        if let Some(time) = self.framer.time_to_send_next_cast_message(now) {
            if time <= now {
                self.framer.send_cast_message(now);
                self.flush_feedback(now, pacer);
            }
        }
        if let Some(time) = self.playout_wakeup {
            if time <= now {
                self.playout_wakeup = None;
                self.try_release(now);
                self.flush_feedback(now, pacer);
            }
        }
    }

    /// Drop all jitter-buffer state and wait for a fresh key frame.
    pub fn reset(&mut self) {
        self.framer.reset();
        self.delivered.clear();
        self.playout_wakeup = None;
    }

    pub fn rtt(&self) -> Option<crate::rtcp_session::RttStats> {
        self.rtcp.rtt()
    }

    fn try_release(&mut self, now: Instant) {
        while self.pending_requests > 0 {
            let dequeued = if self.audio {
                self.framer.get_encoded_audio_frame()
            } else {
                self.framer.get_encoded_video_frame()
            };
            let (mut frame, next_frame) = match dequeued {
                Some(dequeued) => dequeued,
                None => {
                    self.playout_wakeup = None;
                    return;
                }
            };

            let playout_time = self.playout.playout_time(now, frame.rtp_timestamp, &self.rtcp);
            if !next_frame && playout_time > now + MAX_FRAME_WAIT {
                // Not the next frame in sequence: hold on to it, a
                // retransmission may still fill the gap in time.
                self.playout_wakeup = Some(playout_time - MAX_FRAME_WAIT);
                debug!(
                    "waiting {:?} before releasing frame {}",
                    playout_time - now,
                    frame.frame_id
                );
                return;
            }

            if let Some(ref crypto) = self.crypto {
                match crypto.decrypt(frame.frame_id, &frame.data) {
                    Ok(plaintext) => frame.data = Bytes::from(plaintext),
                    Err(err) => {
                        warn!("decrypt failed for frame {}: {err}", frame.frame_id);
                        self.framer.release_frame(now, frame.frame_id);
                        continue;
                    }
                }
            }

            self.framer.release_frame(now, frame.frame_id);
            self.delivered.push_back((frame, playout_time));
            self.pending_requests -= 1;
        }
    }

    fn flush_feedback(&mut self, now: Instant, pacer: &mut impl PacedPacketSender) {
        while let Some(message) = self.framer.poll_feedback() {
            self.log_ack_sent(now, &message);
            let report = self.stats.generate_report();
            let log = std::mem::take(&mut self.event_log);
            self.rtcp.send_rtcp_from_rtp_receiver(
                now,
                Some(&message),
                Some(report),
                Some(&log),
                self.framer.want_key_frame(),
                pacer,
            );
        }
    }

    fn send_rtcp_report(&mut self, now: Instant, pacer: &mut impl PacedPacketSender) {
        let report = self.stats.generate_report();
        let log = std::mem::take(&mut self.event_log);
        self.rtcp.send_rtcp_from_rtp_receiver(
            now,
            None,
            Some(report),
            Some(&log),
            self.framer.want_key_frame(),
            pacer,
        );
    }

    fn log_ack_sent(&mut self, now: Instant, message: &RtcpCastMessage) {
        // The ack is logged against the newest frame's timeline.
        if let Some(frame) = self.event_log.last() {
            let rtp_timestamp = frame.rtp_timestamp;
            self.log_event(
                now,
                rtp_timestamp,
                CastLoggingEvent::AckSent,
                message.ack_frame_id as u16,
            );
        }
    }

    fn log_event(&mut self, now: Instant, rtp_timestamp: u32, event: CastLoggingEvent, value: u16) {
        let epoch = match self.log_epoch {
            Some(epoch) => epoch,
            None => return,
        };
        let event_timestamp_ms = now.duration_since(epoch).as_millis() as u64;
        let entry = RtcpReceiverEventLogMessage {
            event,
            event_timestamp_ms,
            delay_delta_or_packet_id: value,
        };
        match self.event_log.iter_mut().find(|f| f.rtp_timestamp == rtp_timestamp) {
            Some(frame) => frame.event_log_messages.push(entry),
            None => {
                self.event_log.push(RtcpReceiverFrameLogMessage {
                    rtp_timestamp,
                    event_log_messages: vec![entry],
                });
                if self.event_log.len() > MAX_LOGGED_FRAMES {
                    self.event_log.remove(0);
                }
            }
        }
    }
}
