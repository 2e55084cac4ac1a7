use bytes::{BufMut, Bytes, BytesMut};

use crate::header::*;
use crate::types::*;

/// An IP packet; compound reports never exceed this.
pub const IP_PACKET_SIZE: usize = 1500;

/// Serializer for one compound RTCP datagram.
///
/// Sub-packets are emitted in a fixed order regardless of the order the
/// `with_*` calls were made: `[SR|RR] [SDES] [BYE] [XR] [PLI NACK RPSI FIR
/// REMB CAST] [CAST-LOG]`. An SR always carries an SDES; an RR carries one
/// when a CNAME is configured.
pub struct CompoundRtcpBuilder<'a> {
    ssrc: u32,
    c_name: &'a str,
    sender_info: Option<&'a RtcpSenderInfo>,
    receiver_report: bool,
    report_block: Option<&'a RtcpReportBlock>,
    bye: bool,
    dlrr: Option<&'a RtcpDlrrReportBlock>,
    rrtr: Option<&'a RtcpReceiverReferenceTimeReport>,
    pli_remote_ssrc: Option<u32>,
    nack: Option<&'a RtcpNackMessage>,
    rpsi: Option<&'a RtcpRpsiMessage>,
    fir_remote_ssrc: Option<(u32, u8)>,
    remb: Option<&'a RtcpRembMessage>,
    cast: Option<&'a RtcpCastMessage>,
    sender_log: Option<&'a RtcpSenderLogMessage>,
    receiver_log: Option<&'a RtcpReceiverLogMessage>,
}

impl<'a> CompoundRtcpBuilder<'a> {
    pub fn new(ssrc: u32, c_name: &'a str) -> Self {
        debug_assert!(c_name.len() < MAX_CNAME_SIZE);
        Self {
            ssrc,
            c_name,
            sender_info: None,
            receiver_report: false,
            report_block: None,
            bye: false,
            dlrr: None,
            rrtr: None,
            pli_remote_ssrc: None,
            nack: None,
            rpsi: None,
            fir_remote_ssrc: None,
            remb: None,
            cast: None,
            sender_log: None,
            receiver_log: None,
        }
    }

    pub fn sender_report(mut self, sender_info: &'a RtcpSenderInfo) -> Self {
        self.sender_info = Some(sender_info);
        self
    }

    pub fn receiver_report(mut self) -> Self {
        self.receiver_report = true;
        self
    }

    pub fn report_block(mut self, report_block: &'a RtcpReportBlock) -> Self {
        self.report_block = Some(report_block);
        self
    }

    pub fn bye(mut self) -> Self {
        self.bye = true;
        self
    }

    pub fn dlrr(mut self, dlrr: &'a RtcpDlrrReportBlock) -> Self {
        self.dlrr = Some(dlrr);
        self
    }

    pub fn rrtr(mut self, rrtr: &'a RtcpReceiverReferenceTimeReport) -> Self {
        self.rrtr = Some(rrtr);
        self
    }

    pub fn pli(mut self, remote_ssrc: u32) -> Self {
        self.pli_remote_ssrc = Some(remote_ssrc);
        self
    }

    pub fn nack(mut self, nack: &'a RtcpNackMessage) -> Self {
        self.nack = Some(nack);
        self
    }

    pub fn rpsi(mut self, rpsi: &'a RtcpRpsiMessage) -> Self {
        self.rpsi = Some(rpsi);
        self
    }

    pub fn fir(mut self, remote_ssrc: u32, command_sequence_number: u8) -> Self {
        self.fir_remote_ssrc = Some((remote_ssrc, command_sequence_number));
        self
    }

    pub fn remb(mut self, remb: &'a RtcpRembMessage) -> Self {
        self.remb = Some(remb);
        self
    }

    pub fn cast_message(mut self, cast: &'a RtcpCastMessage) -> Self {
        self.cast = Some(cast);
        self
    }

    pub fn sender_log(mut self, log: &'a RtcpSenderLogMessage) -> Self {
        self.sender_log = Some(log);
        self
    }

    pub fn receiver_log(mut self, log: &'a RtcpReceiverLogMessage) -> Self {
        self.receiver_log = Some(log);
        self
    }

    pub fn build(self) -> Bytes {
        let mut packet = BytesMut::with_capacity(IP_PACKET_SIZE);
        if let Some(sender_info) = self.sender_info {
            self.build_sr(sender_info, &mut packet);
            self.build_sdes(&mut packet);
        } else if self.receiver_report {
            self.build_rr(&mut packet);
            if !self.c_name.is_empty() {
                self.build_sdes(&mut packet);
            }
        }
        if self.bye {
            self.build_bye(&mut packet);
        }
        if let Some(dlrr) = self.dlrr {
            self.build_dlrr(dlrr, &mut packet);
        }
        if let Some(rrtr) = self.rrtr {
            self.build_rrtr(rrtr, &mut packet);
        }
        if let Some(remote_ssrc) = self.pli_remote_ssrc {
            self.build_pli(remote_ssrc, &mut packet);
        }
        if let Some(nack) = self.nack {
            self.build_nack(nack, &mut packet);
        }
        if let Some(rpsi) = self.rpsi {
            self.build_rpsi(rpsi, &mut packet);
        }
        if let Some((remote_ssrc, seq)) = self.fir_remote_ssrc {
            self.build_fir(remote_ssrc, seq, &mut packet);
        }
        if let Some(remb) = self.remb {
            self.build_remb(remb, &mut packet);
        }
        if let Some(cast) = self.cast {
            self.build_cast(cast, &mut packet);
        }
        if let Some(log) = self.sender_log {
            self.build_sender_log(log, &mut packet);
        }
        if let Some(log) = self.receiver_log {
            self.build_receiver_log(log, &mut packet);
        }
        packet.freeze()
    }

    fn build_sr(&self, sender_info: &RtcpSenderInfo, packet: &mut BytesMut) {
        let number_of_rows: u16 = if self.report_block.is_some() { 12 } else { 6 };
        packet.put_u8(0x80 + if self.report_block.is_some() { 1 } else { 0 });
        packet.put_u8(PACKET_TYPE_SENDER_REPORT);
        packet.put_u16(number_of_rows);
        packet.put_u32(self.ssrc);
        packet.put_u32(sender_info.ntp_seconds);
        packet.put_u32(sender_info.ntp_fraction);
        packet.put_u32(sender_info.rtp_timestamp);
        packet.put_u32(sender_info.send_packet_count);
        packet.put_u32(sender_info.send_octet_count);
        if let Some(report_block) = self.report_block {
            add_report_block(report_block, packet);
        }
    }

    fn build_rr(&self, packet: &mut BytesMut) {
        let number_of_rows: u16 = if self.report_block.is_some() { 7 } else { 1 };
        packet.put_u8(0x80 + if self.report_block.is_some() { 1 } else { 0 });
        packet.put_u8(PACKET_TYPE_RECEIVER_REPORT);
        packet.put_u16(number_of_rows);
        packet.put_u32(self.ssrc);
        if let Some(report_block) = self.report_block {
            add_report_block(report_block, packet);
        }
    }

    fn build_sdes(&self, packet: &mut BytesMut) {
        let start_size = packet.len();
        // One chunk, one CNAME item.
        packet.put_u8(0x80 + 1);
        packet.put_u8(PACKET_TYPE_SDES);
        let sdes_length_position = start_size + 3;
        packet.put_u16(0); // Patched below.
        packet.put_u32(self.ssrc);
        packet.put_u8(1); // CNAME.
        packet.put_u8(self.c_name.len() as u8);
        packet.put_slice(self.c_name.as_bytes());

        // Chunks end with a zero item even when already aligned.
        packet.put_u8(0);
        while packet.len() % 4 != 0 {
            packet.put_u8(0);
        }

        let sdes_length = packet.len() - start_size;
        packet[sdes_length_position] = (sdes_length / 4 - 1) as u8;
    }

    fn build_bye(&self, packet: &mut BytesMut) {
        packet.put_u8(0x80 + 1);
        packet.put_u8(PACKET_TYPE_BYE);
        packet.put_u16(1);
        packet.put_u32(self.ssrc);
    }

    fn build_dlrr(&self, dlrr: &RtcpDlrrReportBlock, packet: &mut BytesMut) {
        packet.put_u8(0x80);
        packet.put_u8(PACKET_TYPE_XR);
        packet.put_u16(5);
        packet.put_u32(self.ssrc);
        packet.put_u8(XR_BLOCK_DLRR);
        packet.put_u8(0); // Reserved.
        packet.put_u16(3); // Block length.
        packet.put_u32(self.ssrc);
        packet.put_u32(dlrr.last_rr);
        packet.put_u32(dlrr.delay_since_last_rr);
    }

    fn build_rrtr(&self, rrtr: &RtcpReceiverReferenceTimeReport, packet: &mut BytesMut) {
        packet.put_u8(0x80);
        packet.put_u8(PACKET_TYPE_XR);
        packet.put_u16(4);
        packet.put_u32(self.ssrc);
        packet.put_u8(XR_BLOCK_RRTR);
        packet.put_u8(0); // Reserved.
        packet.put_u16(2); // Block length.
        packet.put_u32(rrtr.ntp_seconds);
        packet.put_u32(rrtr.ntp_fraction);
    }

    fn build_pli(&self, remote_ssrc: u32, packet: &mut BytesMut) {
        packet.put_u8(0x80 + FMT_PLI);
        packet.put_u8(PACKET_TYPE_PAYLOAD_SPECIFIC);
        packet.put_u16(2);
        packet.put_u32(self.ssrc);
        packet.put_u32(remote_ssrc);
    }

    fn build_nack(&self, nack: &RtcpNackMessage, packet: &mut BytesMut) {
        let start_size = packet.len();
        packet.put_u8(0x80 + FMT_NACK);
        packet.put_u8(PACKET_TYPE_GENERIC_RTP_FEEDBACK);
        let nack_size_position = start_size + 3;
        packet.put_u16(3); // Patched below.
        packet.put_u32(self.ssrc);
        packet.put_u32(nack.remote_ssrc);

        // The list is sorted; fold trailing numbers within 16 of the lead
        // into the bitmask.
        let mut number_of_nack_fields = 0usize;
        let max_number_of_nack_fields =
            MAX_NACK_FIELDS.min((IP_PACKET_SIZE - packet.len()) / 4);
        let mut it = nack.nack_list.iter().copied().peekable();
        while let Some(nack_sequence_number) = it.next() {
            if number_of_nack_fields >= max_number_of_nack_fields {
                break;
            }
            let mut bitmask: u16 = 0;
            while let Some(&next) = it.peek() {
                let shift = next.wrapping_sub(nack_sequence_number).wrapping_sub(1);
                if shift <= 15 {
                    bitmask |= 1 << shift;
                    it.next();
                } else {
                    break;
                }
            }
            packet.put_u16(nack_sequence_number);
            packet.put_u16(bitmask);
            number_of_nack_fields += 1;
        }
        packet[nack_size_position] = (2 + number_of_nack_fields) as u8;
    }

    fn build_rpsi(&self, rpsi: &RtcpRpsiMessage, packet: &mut BytesMut) {
        // Seven payload bits per byte, most significant chunk first.
        let mut bits_required = 7;
        let mut bytes_required = 1usize;
        while (rpsi.picture_id >> bits_required) > 0 {
            bits_required += 7;
            bytes_required += 1;
        }
        let padding_bytes = (4 - ((2 + bytes_required) % 4)) % 4;
        let length_in_words = 2 + (2 + bytes_required + padding_bytes) / 4;

        packet.put_u8(0x80 + FMT_RPSI);
        packet.put_u8(PACKET_TYPE_PAYLOAD_SPECIFIC);
        packet.put_u16(length_in_words as u16);
        packet.put_u32(self.ssrc);
        packet.put_u32(rpsi.remote_ssrc);
        packet.put_u8((padding_bytes * 8) as u8); // Padding size in bits.
        packet.put_u8(rpsi.payload_type);
        for i in (1..bytes_required).rev() {
            packet.put_u8(0x80 | ((rpsi.picture_id >> (i * 7)) & 0x7f) as u8);
        }
        packet.put_u8((rpsi.picture_id & 0x7f) as u8);
        for _ in 0..padding_bytes {
            packet.put_u8(0);
        }
    }

    fn build_fir(&self, remote_ssrc: u32, command_sequence_number: u8, packet: &mut BytesMut) {
        packet.put_u8(0x80 + FMT_FIR);
        packet.put_u8(PACKET_TYPE_PAYLOAD_SPECIFIC);
        packet.put_u16(4);
        packet.put_u32(self.ssrc);
        packet.put_u32(0); // Media SSRC is zero for FIR.
        packet.put_u32(remote_ssrc);
        packet.put_u8(command_sequence_number);
        packet.put_u8(0);
        packet.put_u16(0);
    }

    fn build_remb(&self, remb: &RtcpRembMessage, packet: &mut BytesMut) {
        packet.put_u8(0x80 + FMT_APPLICATION);
        packet.put_u8(PACKET_TYPE_PAYLOAD_SPECIFIC);
        packet.put_u8(0);
        packet.put_u8((remb.remb_ssrcs.len() + 4) as u8);
        packet.put_u32(self.ssrc);
        packet.put_u32(0); // Remote SSRC must be 0.
        packet.put_u32(FOUR_CC_REMB);
        packet.put_u8(remb.remb_ssrcs.len() as u8);

        // 6-bit exponent and an 18-bit mantissa.
        let (exponent, mantissa) = bitrate_to_remb_exponent(remb.remb_bitrate);
        packet.put_u8(((exponent << 2) + ((mantissa >> 16) & 0x03) as u8) as u8);
        packet.put_u8((mantissa >> 8) as u8);
        packet.put_u8(mantissa as u8);
        for ssrc in &remb.remb_ssrcs {
            packet.put_u32(*ssrc);
        }
    }

    fn build_cast(&self, cast: &RtcpCastMessage, packet: &mut BytesMut) {
        let start_size = packet.len();
        packet.put_u8(0x80 + FMT_APPLICATION);
        packet.put_u8(PACKET_TYPE_PAYLOAD_SPECIFIC);
        packet.put_u8(0);
        let cast_size_position = start_size + 3;
        packet.put_u8(4); // Patched below.
        packet.put_u32(self.ssrc);
        packet.put_u32(cast.media_ssrc);
        packet.put_u32(FOUR_CC_CAST);
        packet.put_u8(cast.ack_frame_id as u8);
        let loss_field_position = start_size + 17;
        packet.put_u8(0); // Overwritten with the number of loss fields.
        packet.put_u16(0); // Reserved.

        let mut number_of_loss_fields = 0usize;
        let max_number_of_loss_fields =
            MAX_CAST_LOSS_FIELDS.min((IP_PACKET_SIZE - packet.len()) / 4);

        'frames: for (frame_id, packet_ids) in &cast.missing_frames_and_packets {
            if packet_ids.is_empty() {
                // Whole frame missing.
                if number_of_loss_fields >= max_number_of_loss_fields {
                    break;
                }
                packet.put_u8(*frame_id);
                packet.put_u16(CAST_ALL_PACKETS_LOST);
                packet.put_u8(0);
                number_of_loss_fields += 1;
                continue;
            }
            let mut it = packet_ids.iter().copied().peekable();
            while let Some(packet_id) = it.next() {
                if number_of_loss_fields >= max_number_of_loss_fields {
                    break 'frames;
                }
                let mut bitmask: u8 = 0;
                if packet_id != CAST_ALL_PACKETS_LOST {
                    while let Some(&next) = it.peek() {
                        let shift = next.wrapping_sub(packet_id).wrapping_sub(1);
                        if shift <= 7 {
                            bitmask |= 1 << shift;
                            it.next();
                        } else {
                            break;
                        }
                    }
                }
                packet.put_u8(*frame_id);
                packet.put_u16(packet_id);
                packet.put_u8(bitmask);
                number_of_loss_fields += 1;
            }
        }
        packet[cast_size_position] = (4 + number_of_loss_fields) as u8;
        packet[loss_field_position] = number_of_loss_fields as u8;
    }

    fn build_sender_log(&self, log: &RtcpSenderLogMessage, packet: &mut BytesMut) {
        let length_in_words = 2 + log.len();
        packet.put_u8(0x80 + APP_SUBTYPE_SENDER_LOG);
        packet.put_u8(PACKET_TYPE_APPLICATION_DEFINED);
        packet.put_u16(length_in_words as u16);
        packet.put_u32(self.ssrc);
        packet.put_u32(FOUR_CC_CAST);
        for entry in log {
            packet.put_u32(
                ((entry.frame_status.to_wire() as u32) << 24)
                    | (entry.rtp_timestamp & 0x00ff_ffff),
            );
        }
    }

    fn build_receiver_log(&self, log: &RtcpReceiverLogMessage, packet: &mut BytesMut) {
        let body: usize = log
            .iter()
            .map(|frame| 8 + 4 * frame.event_log_messages.len())
            .sum();
        let length_in_words = 2 + body / 4;
        packet.put_u8(0x80 + APP_SUBTYPE_RECEIVER_LOG);
        packet.put_u8(PACKET_TYPE_APPLICATION_DEFINED);
        packet.put_u16(length_in_words as u16);
        packet.put_u32(self.ssrc);
        packet.put_u32(FOUR_CC_CAST);
        for frame in log {
            let base = frame
                .event_log_messages
                .iter()
                .map(|e| e.event_timestamp_ms)
                .min()
                .unwrap_or(0);
            packet.put_u32(frame.rtp_timestamp);
            packet.put_u8(frame.event_log_messages.len() as u8);
            packet.put_u8((base >> 16) as u8);
            packet.put_u16(base as u16);
            for event in &frame.event_log_messages {
                let delta = (event.event_timestamp_ms - base).min(u8::MAX as u64) as u8;
                packet.put_u8(event.event.to_wire());
                packet.put_u8(delta);
                packet.put_u16(event.delay_delta_or_packet_id);
            }
        }
    }
}

fn add_report_block(report_block: &RtcpReportBlock, packet: &mut BytesMut) {
    packet.put_u32(report_block.media_ssrc);
    packet.put_u8(report_block.fraction_lost);
    packet.put_u8((report_block.cumulative_lost >> 16) as u8);
    packet.put_u8((report_block.cumulative_lost >> 8) as u8);
    packet.put_u8(report_block.cumulative_lost as u8);
    packet.put_u32(report_block.extended_high_sequence_number);
    packet.put_u32(report_block.jitter);
    // What we read from the last SR, not when we received it.
    packet.put_u32(report_block.last_sr);
    packet.put_u32(report_block.delay_since_last_sr);
}

fn bitrate_to_remb_exponent(bitrate: u32) -> (u8, u32) {
    let mut exponent = 0u8;
    while (bitrate >> exponent) >= (1 << 18) {
        exponent += 1;
    }
    (exponent, bitrate >> exponent)
}
