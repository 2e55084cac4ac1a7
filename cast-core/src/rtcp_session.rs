use std::time::{Duration, Instant};

use log::{debug, warn};
use rtcp::builder::CompoundRtcpBuilder;
use rtcp::parser::{RtcpItem, RtcpParser};
use rtcp::types::{
    PacketIdSet, RtcpCastMessage, RtcpDlrrReportBlock, RtcpReceiverLogMessage,
    RtcpReceiverReferenceTimeReport, RtcpReportBlock, RtcpSenderInfo, RtcpSenderLogMessage,
    CAST_ALL_PACKETS_LOST,
};
use shared::time::{duration_to_ntp_diff, from_ntp_diff, to_ntp_diff, NtpAnchor};
use shared::wrap::FrameIdWrapHelper;

use crate::config::RtcpMode;
use crate::pacing::PacedPacketSender;

/// What an incoming compound RTCP packet meant for the stream owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpEvent {
    /// Cast ACK/NACK feedback addressed to us (sender side).
    CastFeedback(RtcpCastMessage),
    /// Generic NACK sequence numbers addressed to us.
    NackRequest(Vec<u16>),
    /// PLI or FIR addressed to us: produce a key frame.
    KeyFrameRequest,
    Rpsi {
        payload_type: u8,
        picture_id: u64,
    },
    /// Parsed but intentionally unused beyond surfacing.
    ReceivedRemb {
        bitrate: u32,
    },
    SendReportRequest,
    SenderLog(RtcpSenderLogMessage),
    ReceiverLog(RtcpReceiverLogMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttStats {
    pub rtt: Duration,
    pub avg_rtt: Duration,
    pub min_rtt: Duration,
    pub max_rtt: Duration,
}

/// Receiver-side numbers for the outgoing report block.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReceiverReportData {
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub extended_high_sequence_number: u32,
    pub jitter: u32,
}

/// Per-stream RTCP session: compound report emission, incoming dispatch,
/// RTT measurement and the NTP/RTP lip-sync mapping.
pub struct Rtcp {
    local_ssrc: u32,
    remote_ssrc: u32,
    c_name: String,
    rtcp_mode: RtcpMode,
    rtcp_interval: Duration,
    sending_media: bool,
    anchor: NtpAnchor,

    next_time_to_send_rtcp: Option<Instant>,

    // Middle-32 NTP of the last report we sent, for matching echoes.
    last_report_sent: u32,
    time_last_report_sent: Option<Instant>,

    // Last SR received (receiver side): feeds last_sr/DLSR and lip sync.
    last_report_received: u32,
    time_last_report_received: Option<Instant>,
    lip_sync: Option<LipSync>,

    // Last RRTR received (sender side), echoed back as DLRR.
    remote_rrtr: Option<(u32, Instant)>,

    rtt: Option<Duration>,
    rtt_sum: Duration,
    rtt_count: u32,
    min_rtt: Duration,
    max_rtt: Duration,

    ack_wrap_helper: FrameIdWrapHelper,
}

#[derive(Debug, Clone, Copy)]
struct LipSync {
    ntp_seconds: u32,
    ntp_fraction: u32,
    rtp_timestamp: u32,
}

impl Rtcp {
    pub fn new(
        local_ssrc: u32,
        remote_ssrc: u32,
        c_name: String,
        rtcp_mode: RtcpMode,
        rtcp_interval: Duration,
        sending_media: bool,
    ) -> Self {
        Self {
            local_ssrc,
            remote_ssrc,
            c_name,
            rtcp_mode,
            rtcp_interval,
            sending_media,
            anchor: NtpAnchor::now(),
            next_time_to_send_rtcp: None,
            last_report_sent: 0,
            time_last_report_sent: None,
            last_report_received: 0,
            time_last_report_received: None,
            lip_sync: None,
            remote_rrtr: None,
            rtt: None,
            rtt_sum: Duration::ZERO,
            rtt_count: 0,
            min_rtt: Duration::MAX,
            max_rtt: Duration::ZERO,
            ack_wrap_helper: FrameIdWrapHelper::new(),
        }
    }

    pub fn set_remote_ssrc(&mut self, ssrc: u32) {
        self.remote_ssrc = ssrc;
    }

    pub(crate) fn anchor(&self) -> &NtpAnchor {
        &self.anchor
    }

    /// When the next periodic report is due. The interval is randomized
    /// uniformly in [interval/2, interval*3/2).
    pub fn time_to_send_next_rtcp_report(&mut self, now: Instant) -> Instant {
        if self.next_time_to_send_rtcp.is_none() {
            self.update_next_time_to_send(now);
        }
        self.next_time_to_send_rtcp.unwrap_or(now)
    }

    fn update_next_time_to_send(&mut self, now: Instant) {
        let jitter = self.rtcp_interval.as_micros() as u64 * (rand::random::<u64>() % 1000) / 1000;
        self.next_time_to_send_rtcp =
            Some(now + self.rtcp_interval / 2 + Duration::from_micros(jitter));
    }

    /// Builds and sends the media sender's periodic report: SR (+SDES),
    /// plus a DLRR echo when the peer has sent an RRTR, plus the frame-status
    /// log when provided.
    pub fn send_rtcp_from_rtp_sender(
        &mut self,
        now: Instant,
        rtp_timestamp: u32,
        send_packet_count: u32,
        send_octet_count: u32,
        sender_log: Option<&RtcpSenderLogMessage>,
        pacer: &mut impl PacedPacketSender,
    ) {
        let ntp = self.anchor.ntp(now);
        let sender_info = RtcpSenderInfo {
            ntp_seconds: ntp.seconds,
            ntp_fraction: ntp.fraction,
            rtp_timestamp,
            send_packet_count,
            send_octet_count,
        };
        self.last_report_sent = to_ntp_diff(ntp.seconds, ntp.fraction);
        self.time_last_report_sent = Some(now);

        let dlrr = self.remote_rrtr.map(|(last_rr, received)| RtcpDlrrReportBlock {
            last_rr,
            delay_since_last_rr: duration_to_ntp_diff(now.duration_since(received)),
        });

        let mut builder =
            CompoundRtcpBuilder::new(self.local_ssrc, &self.c_name).sender_report(&sender_info);
        if let Some(ref dlrr) = dlrr {
            builder = builder.dlrr(dlrr);
        }
        if let Some(log) = sender_log {
            if !log.is_empty() {
                builder = builder.sender_log(log);
            }
        }
        pacer.send_rtcp_packet(builder.build());
        self.update_next_time_to_send(now);
    }

    /// Builds and sends the receiver's report: RR + report block (+SDES) +
    /// RRTR, plus Cast feedback / PLI / event log when provided.
    pub fn send_rtcp_from_rtp_receiver(
        &mut self,
        now: Instant,
        cast_message: Option<&RtcpCastMessage>,
        report_data: Option<ReceiverReportData>,
        receiver_log: Option<&RtcpReceiverLogMessage>,
        request_key_frame: bool,
        pacer: &mut impl PacedPacketSender,
    ) {
        let data = report_data.unwrap_or_default();
        let delay_since_last_sr = self
            .time_last_report_received
            .map(|received| duration_to_ntp_diff(now.duration_since(received)))
            .unwrap_or(0);
        let report_block = RtcpReportBlock {
            remote_ssrc: 0,
            media_ssrc: self.remote_ssrc,
            fraction_lost: data.fraction_lost,
            cumulative_lost: data.cumulative_lost,
            extended_high_sequence_number: data.extended_high_sequence_number,
            jitter: data.jitter,
            last_sr: self.last_report_received,
            delay_since_last_sr,
        };

        let ntp = self.anchor.ntp(now);
        let rrtr = RtcpReceiverReferenceTimeReport {
            ntp_seconds: ntp.seconds,
            ntp_fraction: ntp.fraction,
        };
        self.last_report_sent = to_ntp_diff(ntp.seconds, ntp.fraction);
        self.time_last_report_sent = Some(now);

        let mut builder = CompoundRtcpBuilder::new(self.local_ssrc, &self.c_name)
            .receiver_report()
            .report_block(&report_block)
            .rrtr(&rrtr);
        if let Some(cast_message) = cast_message {
            builder = builder.cast_message(cast_message);
        }
        if request_key_frame {
            builder = builder.pli(self.remote_ssrc);
        }
        if let Some(log) = receiver_log {
            if !log.is_empty() {
                builder = builder.receiver_log(log);
            }
        }
        pacer.send_rtcp_packet(builder.build());
        self.update_next_time_to_send(now);
    }

    /// Parses one incoming compound datagram, updates RTT/lip-sync state
    /// and returns the events addressed to this stream.
    pub fn handle_rtcp_packet(&mut self, now: Instant, data: &[u8]) -> Vec<RtcpEvent> {
        let mut events = Vec::new();
        let mut parser = RtcpParser::new(data);

        let mut xr_ssrc: Option<u32> = None;
        let mut cast: Option<RtcpCastMessage> = None;
        let mut nack: Option<Vec<u16>> = None;
        let mut sender_log: Option<RtcpSenderLogMessage> = None;
        let mut receiver_log: Option<RtcpReceiverLogMessage> = None;

        for item in parser.by_ref() {
            match item {
                RtcpItem::SenderReport {
                    sender_ssrc,
                    ntp_seconds,
                    ntp_fraction,
                    rtp_timestamp,
                    ..
                } => {
                    if sender_ssrc == self.remote_ssrc {
                        debug!("rtcp received sr from ssrc {sender_ssrc:#x}");
                        self.last_report_received = to_ntp_diff(ntp_seconds, ntp_fraction);
                        self.time_last_report_received = Some(now);
                        self.lip_sync = Some(LipSync {
                            ntp_seconds,
                            ntp_fraction,
                            rtp_timestamp,
                        });
                    }
                }
                RtcpItem::ReceiverReport { sender_ssrc } => {
                    debug!("rtcp received rr from ssrc {sender_ssrc:#x}");
                }
                RtcpItem::ReportBlock {
                    ssrc,
                    last_sender_report,
                    delay_last_sender_report,
                    ..
                } => {
                    // Only blocks that describe our own stream count.
                    if ssrc == self.local_ssrc {
                        self.on_received_delay_since_last_report(
                            now,
                            last_sender_report,
                            delay_last_sender_report,
                        );
                    }
                }
                RtcpItem::ExtendedReport { sender_ssrc } => {
                    xr_ssrc = Some(sender_ssrc);
                }
                RtcpItem::Rrtr {
                    ntp_seconds,
                    ntp_fraction,
                } => {
                    if xr_ssrc == Some(self.remote_ssrc) {
                        self.remote_rrtr = Some((to_ntp_diff(ntp_seconds, ntp_fraction), now));
                    }
                }
                RtcpItem::Dlrr {
                    receivers_ssrc,
                    last_receiver_report,
                    delay_last_receiver_report,
                } => {
                    if receivers_ssrc == self.remote_ssrc {
                        self.on_received_delay_since_last_report(
                            now,
                            last_receiver_report,
                            delay_last_receiver_report,
                        );
                    }
                }
                RtcpItem::CastAck {
                    sender_ssrc,
                    media_ssrc,
                    ack_frame_id,
                } => {
                    if sender_ssrc == self.remote_ssrc {
                        let mut message = RtcpCastMessage::new(media_ssrc);
                        message.ack_frame_id = self.ack_wrap_helper.map_to_32bits(ack_frame_id);
                        cast = Some(message);
                    }
                }
                RtcpItem::CastNackItem {
                    frame_id,
                    packet_id,
                    bitmask,
                } => {
                    if let Some(ref mut message) = cast {
                        insert_cast_nack_item(message, frame_id, packet_id, bitmask);
                    }
                }
                RtcpItem::GenericNack {
                    media_ssrc, ..
                } => {
                    if media_ssrc == self.local_ssrc {
                        nack = Some(Vec::new());
                    }
                }
                RtcpItem::GenericNackItem { packet_id, bitmask } => {
                    if let Some(ref mut list) = nack {
                        list.push(packet_id);
                        let mut bitmask = bitmask;
                        for i in 1..=16u16 {
                            if bitmask & 1 != 0 {
                                list.push(packet_id.wrapping_add(i));
                            }
                            bitmask >>= 1;
                        }
                    }
                }
                RtcpItem::Pli { media_ssrc, .. } => {
                    if media_ssrc == self.local_ssrc {
                        debug!("rtcp received pli on our ssrc");
                        events.push(RtcpEvent::KeyFrameRequest);
                    }
                }
                RtcpItem::Fir { .. } => {}
                RtcpItem::FirItem { ssrc, .. } => {
                    if ssrc == self.local_ssrc {
                        events.push(RtcpEvent::KeyFrameRequest);
                    }
                }
                RtcpItem::Rpsi {
                    media_ssrc,
                    payload_type,
                    picture_id,
                    ..
                } => {
                    if media_ssrc == self.local_ssrc {
                        events.push(RtcpEvent::Rpsi {
                            payload_type,
                            picture_id,
                        });
                    }
                }
                RtcpItem::Remb { bitrate, ssrcs, .. } => {
                    if ssrcs.contains(&self.local_ssrc) {
                        events.push(RtcpEvent::ReceivedRemb { bitrate });
                    }
                }
                RtcpItem::SendReportRequest { .. } => {
                    events.push(RtcpEvent::SendReportRequest);
                }
                RtcpItem::SenderLog { sender_ssrc } => {
                    if sender_ssrc == self.remote_ssrc {
                        sender_log = Some(Vec::new());
                    }
                }
                RtcpItem::SenderLogItem {
                    frame_status,
                    rtp_timestamp,
                } => {
                    if let Some(ref mut log) = sender_log {
                        log.push(rtcp::types::RtcpSenderFrameLogMessage {
                            frame_status,
                            rtp_timestamp,
                        });
                    }
                }
                RtcpItem::ReceiverLog { sender_ssrc } => {
                    if sender_ssrc == self.remote_ssrc {
                        receiver_log = Some(Vec::new());
                    }
                }
                RtcpItem::ReceiverLogFrame { rtp_timestamp } => {
                    if let Some(ref mut log) = receiver_log {
                        log.push(rtcp::types::RtcpReceiverFrameLogMessage {
                            rtp_timestamp,
                            event_log_messages: Vec::new(),
                        });
                    }
                }
                RtcpItem::ReceiverLogEvent {
                    event,
                    event_timestamp_ms,
                    delay_delta_or_packet_id,
                } => {
                    if let Some(ref mut log) = receiver_log {
                        if let Some(frame) = log.last_mut() {
                            frame.event_log_messages.push(
                                rtcp::types::RtcpReceiverEventLogMessage {
                                    event,
                                    event_timestamp_ms,
                                    delay_delta_or_packet_id,
                                },
                            );
                        }
                    }
                }
                RtcpItem::SdesCname { ssrc, cname } => {
                    debug!("rtcp received sdes cname {cname:?} from ssrc {ssrc:#x}");
                }
                RtcpItem::Bye { sender_ssrc } => {
                    if sender_ssrc == self.remote_ssrc {
                        debug!("rtcp received bye from ssrc {sender_ssrc:#x}");
                    }
                }
            }
        }
        if !parser.is_valid() {
            warn!("malformed rtcp compound packet; dropping the remainder");
        }

        if let Some(message) = cast {
            events.push(RtcpEvent::CastFeedback(message));
        }
        if let Some(list) = nack {
            events.push(RtcpEvent::NackRequest(list));
        }
        if let Some(log) = sender_log {
            if !log.is_empty() {
                events.push(RtcpEvent::SenderLog(log));
            }
        }
        if let Some(log) = receiver_log {
            if !log.is_empty() {
                events.push(RtcpEvent::ReceiverLog(log));
            }
        }
        events
    }

    /// An echo of a report we sent came back; close the RTT loop.
    fn on_received_delay_since_last_report(
        &mut self,
        now: Instant,
        last_report: u32,
        delay_since_last_report: u32,
    ) {
        let time_sent = match self.time_last_report_sent {
            Some(time_sent) => time_sent,
            None => return,
        };
        if self.last_report_sent != last_report || last_report == 0 {
            // Not an echo of our latest report.
            return;
        }
        let sender_delay = now.duration_since(time_sent);
        let receiver_delay = from_ntp_diff(delay_since_last_report);
        self.update_rtt(sender_delay, receiver_delay);
    }

    fn update_rtt(&mut self, sender_delay: Duration, receiver_delay: Duration) {
        let rtt = sender_delay
            .saturating_sub(receiver_delay)
            .max(Duration::from_millis(1));
        self.rtt = Some(rtt);
        self.min_rtt = self.min_rtt.min(rtt);
        self.max_rtt = self.max_rtt.max(rtt);
        self.rtt_sum += rtt;
        self.rtt_count += 1;
        debug!("rtt sample {rtt:?}");
    }

    pub fn rtt(&self) -> Option<RttStats> {
        let rtt = self.rtt?;
        Some(RttStats {
            rtt,
            avg_rtt: self.rtt_sum / self.rtt_count,
            min_rtt: self.min_rtt,
            max_rtt: self.max_rtt,
        })
    }

    /// Maps a media RTP timestamp onto the sender's clock using the last
    /// SR's NTP/RTP pair. `None` until an SR has been received.
    pub fn rtp_timestamp_in_sender_time(
        &self,
        frequency: u32,
        rtp_timestamp: u32,
    ) -> Option<Instant> {
        let lip_sync = self.lip_sync?;
        if lip_sync.ntp_seconds == 0 {
            return None;
        }
        let mut rtp = rtp_timestamp as i64;
        let mut rtp_base = lip_sync.rtp_timestamp as i64;
        match check_for_wrap_around(rtp_timestamp, lip_sync.rtp_timestamp) {
            1 => rtp += 1i64 << 32,
            -1 => rtp_base += 1i64 << 32,
            _ => {}
        }
        let diff_micros = (rtp - rtp_base) * 1_000_000 / frequency as i64;
        let base = self.anchor.instant(shared::time::NtpTimestamp::new(
            lip_sync.ntp_seconds,
            lip_sync.ntp_fraction,
        ));
        Some(if diff_micros >= 0 {
            base + Duration::from_micros(diff_micros as u64)
        } else {
            base - Duration::from_micros((-diff_micros) as u64)
        })
    }

    /// Feeds the lip-sync state directly; normally done by an incoming SR.
    pub fn on_received_lip_sync_info(
        &mut self,
        rtp_timestamp: u32,
        ntp_seconds: u32,
        ntp_fraction: u32,
    ) {
        self.lip_sync = Some(LipSync {
            ntp_seconds,
            ntp_fraction,
            rtp_timestamp,
        });
    }
}

/// Classifies a 32-bit timestamp pair: 1 = wrapped forward, -1 = the new
/// value is behind a wrap, 0 = plain ordering.
pub(crate) fn check_for_wrap_around(new_timestamp: u32, old_timestamp: u32) -> i32 {
    if new_timestamp < old_timestamp {
        if (new_timestamp.wrapping_sub(old_timestamp) as i32) > 0 {
            return 1;
        }
    } else if (old_timestamp.wrapping_sub(new_timestamp) as i32) > 0 {
        return -1;
    }
    0
}

fn insert_cast_nack_item(
    message: &mut RtcpCastMessage,
    frame_id: u8,
    packet_id: u16,
    bitmask: u8,
) {
    let entry = message
        .missing_frames_and_packets
        .entry(frame_id)
        .or_insert_with(PacketIdSet::new);
    if packet_id == CAST_ALL_PACKETS_LOST {
        // Whole frame lost; normalize to the singleton sentinel.
        entry.insert(CAST_ALL_PACKETS_LOST);
        return;
    }
    entry.insert(packet_id);
    let mut bitmask = bitmask;
    for i in 1..=8u16 {
        if bitmask & 1 != 0 {
            entry.insert(packet_id.wrapping_add(i));
        }
        bitmask >>= 1;
    }
}
