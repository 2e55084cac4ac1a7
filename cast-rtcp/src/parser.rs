use log::warn;
use shared::wrap::FrameId;

use crate::header::*;
use crate::types::{CastLoggingEvent, RtcpSenderFrameStatus};

/// One parsed item from a compound RTCP datagram.
///
/// Items come out in wire order: a header-bearing item (e.g.
/// [`RtcpItem::SenderReport`]) followed by its per-item entries (e.g.
/// [`RtcpItem::ReportBlock`]). SSRC filtering is the consumer's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpItem {
    SenderReport {
        sender_ssrc: u32,
        ntp_seconds: u32,
        ntp_fraction: u32,
        rtp_timestamp: u32,
        send_packet_count: u32,
        send_octet_count: u32,
    },
    ReceiverReport {
        sender_ssrc: u32,
    },
    ReportBlock {
        /// The stream this block reports on.
        ssrc: u32,
        fraction_lost: u8,
        cumulative_lost: u32,
        extended_highest_sequence_number: u32,
        jitter: u32,
        last_sender_report: u32,
        delay_last_sender_report: u32,
    },
    SdesCname {
        ssrc: u32,
        cname: String,
    },
    Bye {
        sender_ssrc: u32,
    },
    ExtendedReport {
        sender_ssrc: u32,
    },
    Rrtr {
        ntp_seconds: u32,
        ntp_fraction: u32,
    },
    Dlrr {
        receivers_ssrc: u32,
        last_receiver_report: u32,
        delay_last_receiver_report: u32,
    },
    GenericNack {
        sender_ssrc: u32,
        media_ssrc: u32,
    },
    GenericNackItem {
        packet_id: u16,
        bitmask: u16,
    },
    SendReportRequest {
        sender_ssrc: u32,
        media_ssrc: u32,
    },
    Pli {
        sender_ssrc: u32,
        media_ssrc: u32,
    },
    Rpsi {
        sender_ssrc: u32,
        media_ssrc: u32,
        payload_type: u8,
        picture_id: u64,
    },
    Fir {
        sender_ssrc: u32,
    },
    FirItem {
        ssrc: u32,
        command_sequence_number: u8,
    },
    Remb {
        sender_ssrc: u32,
        bitrate: u32,
        ssrcs: Vec<u32>,
    },
    CastAck {
        sender_ssrc: u32,
        media_ssrc: u32,
        ack_frame_id: FrameId,
    },
    CastNackItem {
        frame_id: u8,
        packet_id: u16,
        bitmask: u8,
    },
    SenderLog {
        sender_ssrc: u32,
    },
    SenderLogItem {
        frame_status: RtcpSenderFrameStatus,
        rtp_timestamp: u32,
    },
    ReceiverLog {
        sender_ssrc: u32,
    },
    ReceiverLogFrame {
        rtp_timestamp: u32,
    },
    ReceiverLogEvent {
        event: CastLoggingEvent,
        event_timestamp_ms: u64,
        delay_delta_or_packet_id: u16,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    TopLevel,
    ReportBlock { count: u8 },
    Sdes { count: u8 },
    ExtendedReportBlock,
    Dlrr { end: usize },
    GenericNack,
    Fir,
    CastNack { count: u8 },
    SenderLog,
    ReceiverLog,
    ReceiverLogEvent { count: u8, base_ms: u64 },
}

/// Iterator-style parser over a compound RTCP datagram.
///
/// A malformed item terminates iteration and clears [`RtcpParser::is_valid`];
/// no further items are delivered.
pub struct RtcpParser<'a> {
    data: &'a [u8],
    offset: usize,
    block_end: usize,
    state: ParseState,
    valid: bool,
    done: bool,
}

impl<'a> RtcpParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            block_end: 0,
            state: ParseState::TopLevel,
            valid: true,
            done: false,
        }
    }

    /// False once any malformed item has been hit.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn fail(&mut self) -> Option<RtcpItem> {
        warn!("malformed rtcp item at offset {}", self.offset);
        self.valid = false;
        self.done = true;
        None
    }

    fn end_current_block(&mut self) {
        self.offset = self.block_end;
        self.state = ParseState::TopLevel;
    }

    fn remaining_in_block(&self) -> usize {
        self.block_end.saturating_sub(self.offset)
    }

    fn u8_at(&self, at: usize) -> u8 {
        self.data[at]
    }

    fn u16_at(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.data[at], self.data[at + 1]])
    }

    fn u24_at(&self, at: usize) -> u32 {
        (self.data[at] as u32) << 16 | (self.data[at + 1] as u32) << 8 | self.data[at + 2] as u32
    }

    fn u32_at(&self, at: usize) -> u32 {
        u32::from_be_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ])
    }

    fn parse_top_level(&mut self) -> Option<RtcpItem> {
        if self.offset >= self.data.len() {
            self.done = true;
            return None;
        }
        let header = match RtcpCommonHeader::parse(&self.data[self.offset..]) {
            Ok(header) => header,
            Err(_) => return self.fail(),
        };
        let start = self.offset;
        self.block_end = start + header.length_in_octets;

        match header.packet_type {
            PACKET_TYPE_SENDER_REPORT => {
                if header.length_in_octets < 28 {
                    return self.fail();
                }
                let item = RtcpItem::SenderReport {
                    sender_ssrc: self.u32_at(start + 4),
                    ntp_seconds: self.u32_at(start + 8),
                    ntp_fraction: self.u32_at(start + 12),
                    rtp_timestamp: self.u32_at(start + 16),
                    send_packet_count: self.u32_at(start + 20),
                    send_octet_count: self.u32_at(start + 24),
                };
                self.offset = start + 28;
                self.state = ParseState::ReportBlock {
                    count: header.count,
                };
                Some(item)
            }
            PACKET_TYPE_RECEIVER_REPORT => {
                if header.length_in_octets < 8 {
                    return self.fail();
                }
                let item = RtcpItem::ReceiverReport {
                    sender_ssrc: self.u32_at(start + 4),
                };
                self.offset = start + 8;
                self.state = ParseState::ReportBlock {
                    count: header.count,
                };
                Some(item)
            }
            PACKET_TYPE_SDES => {
                self.offset = start + 4;
                self.state = ParseState::Sdes {
                    count: header.count,
                };
                None
            }
            PACKET_TYPE_BYE => {
                if header.length_in_octets < 8 {
                    return self.fail();
                }
                let item = RtcpItem::Bye {
                    sender_ssrc: self.u32_at(start + 4),
                };
                self.end_current_block();
                Some(item)
            }
            PACKET_TYPE_APPLICATION_DEFINED => self.parse_application_defined(header, start),
            PACKET_TYPE_GENERIC_RTP_FEEDBACK => {
                if header.length_in_octets < 12 {
                    return self.fail();
                }
                let sender_ssrc = self.u32_at(start + 4);
                let media_ssrc = self.u32_at(start + 8);
                match header.count {
                    FMT_NACK => {
                        self.offset = start + 12;
                        self.state = ParseState::GenericNack;
                        Some(RtcpItem::GenericNack {
                            sender_ssrc,
                            media_ssrc,
                        })
                    }
                    FMT_SR_REQUEST => {
                        self.end_current_block();
                        Some(RtcpItem::SendReportRequest {
                            sender_ssrc,
                            media_ssrc,
                        })
                    }
                    _ => {
                        self.end_current_block();
                        None
                    }
                }
            }
            PACKET_TYPE_PAYLOAD_SPECIFIC => self.parse_payload_specific(header, start),
            PACKET_TYPE_XR => {
                if header.length_in_octets < 8 {
                    return self.fail();
                }
                let item = RtcpItem::ExtendedReport {
                    sender_ssrc: self.u32_at(start + 4),
                };
                self.offset = start + 8;
                self.state = ParseState::ExtendedReportBlock;
                Some(item)
            }
            _ => {
                // Not a packet type we know; skip the whole sub-packet.
                self.end_current_block();
                None
            }
        }
    }

    fn parse_application_defined(
        &mut self,
        header: RtcpCommonHeader,
        start: usize,
    ) -> Option<RtcpItem> {
        if header.length_in_octets < 12 {
            return self.fail();
        }
        let sender_ssrc = self.u32_at(start + 4);
        if self.u32_at(start + 8) != FOUR_CC_CAST {
            self.end_current_block();
            return None;
        }
        self.offset = start + 12;
        match header.count {
            APP_SUBTYPE_SENDER_LOG => {
                self.state = ParseState::SenderLog;
                Some(RtcpItem::SenderLog { sender_ssrc })
            }
            APP_SUBTYPE_RECEIVER_LOG => {
                self.state = ParseState::ReceiverLog;
                Some(RtcpItem::ReceiverLog { sender_ssrc })
            }
            _ => {
                self.end_current_block();
                None
            }
        }
    }

    fn parse_payload_specific(
        &mut self,
        header: RtcpCommonHeader,
        start: usize,
    ) -> Option<RtcpItem> {
        if header.length_in_octets < 12 {
            return self.fail();
        }
        let sender_ssrc = self.u32_at(start + 4);
        let media_ssrc = self.u32_at(start + 8);
        match header.count {
            FMT_PLI => {
                self.end_current_block();
                Some(RtcpItem::Pli {
                    sender_ssrc,
                    media_ssrc,
                })
            }
            FMT_RPSI => self.parse_rpsi(sender_ssrc, media_ssrc, start),
            FMT_FIR => {
                self.offset = start + 12;
                self.state = ParseState::Fir;
                Some(RtcpItem::Fir { sender_ssrc })
            }
            FMT_APPLICATION => {
                if header.length_in_octets < 16 {
                    return self.fail();
                }
                match self.u32_at(start + 12) {
                    FOUR_CC_REMB => self.parse_remb(sender_ssrc, start),
                    FOUR_CC_CAST => {
                        if header.length_in_octets < 20 {
                            return self.fail();
                        }
                        let ack_frame_id = FrameId(self.u8_at(start + 16));
                        let count = self.u8_at(start + 17);
                        self.offset = start + 20;
                        self.state = ParseState::CastNack { count };
                        Some(RtcpItem::CastAck {
                            sender_ssrc,
                            media_ssrc,
                            ack_frame_id,
                        })
                    }
                    _ => {
                        self.end_current_block();
                        None
                    }
                }
            }
            _ => {
                self.end_current_block();
                None
            }
        }
    }

    fn parse_rpsi(&mut self, sender_ssrc: u32, media_ssrc: u32, start: usize) -> Option<RtcpItem> {
        if self.block_end < start + 16 {
            return self.fail();
        }
        let padding_bits = self.u8_at(start + 12) as usize;
        let payload_type = self.u8_at(start + 13) & 0x7f;
        let bit_string = &self.data[start + 14..self.block_end];
        if padding_bits % 8 != 0 || padding_bits / 8 >= bit_string.len() {
            return self.fail();
        }
        let valid_bytes = bit_string.len() - padding_bits / 8;
        let mut picture_id: u64 = 0;
        for byte in &bit_string[..valid_bytes] {
            picture_id = (picture_id << 7) + (byte & 0x7f) as u64;
        }
        self.end_current_block();
        Some(RtcpItem::Rpsi {
            sender_ssrc,
            media_ssrc,
            payload_type,
            picture_id,
        })
    }

    fn parse_remb(&mut self, sender_ssrc: u32, start: usize) -> Option<RtcpItem> {
        if self.block_end < start + 20 {
            return self.fail();
        }
        let number_of_ssrcs = self.u8_at(start + 16) as usize;
        if self.block_end < start + 20 + number_of_ssrcs * 4 {
            return self.fail();
        }
        let exponent = self.u8_at(start + 17) >> 2;
        let mantissa = ((self.u8_at(start + 17) as u32 & 0x03) << 16)
            | (self.u8_at(start + 18) as u32) << 8
            | self.u8_at(start + 19) as u32;
        let bitrate = mantissa << exponent;
        let ssrcs = (0..number_of_ssrcs)
            .map(|i| self.u32_at(start + 20 + i * 4))
            .collect();
        self.end_current_block();
        Some(RtcpItem::Remb {
            sender_ssrc,
            bitrate,
            ssrcs,
        })
    }

    fn parse_sdes_chunk(&mut self, count: u8) -> Option<RtcpItem> {
        if count == 0 || self.remaining_in_block() < 4 {
            self.end_current_block();
            return None;
        }
        let ssrc = self.u32_at(self.offset);
        self.offset += 4;
        let mut cname = None;
        loop {
            if self.remaining_in_block() == 0 {
                return self.fail();
            }
            let item_type = self.u8_at(self.offset);
            self.offset += 1;
            if item_type == 0 {
                // End of chunk; sub-packets are word aligned, so align the
                // absolute offset.
                while self.offset % 4 != 0 && self.offset < self.block_end {
                    self.offset += 1;
                }
                break;
            }
            if self.remaining_in_block() == 0 {
                return self.fail();
            }
            let length = self.u8_at(self.offset) as usize;
            self.offset += 1;
            if self.remaining_in_block() < length {
                return self.fail();
            }
            let text = &self.data[self.offset..self.offset + length];
            self.offset += length;
            if item_type == 1 {
                cname = Some(String::from_utf8_lossy(text).into_owned());
            }
        }
        self.state = ParseState::Sdes { count: count - 1 };
        match cname {
            Some(cname) => Some(RtcpItem::SdesCname { ssrc, cname }),
            None => None,
        }
    }

    fn parse_extended_report_block(&mut self) -> Option<RtcpItem> {
        if self.remaining_in_block() < 4 {
            self.end_current_block();
            return None;
        }
        let block_type = self.u8_at(self.offset);
        let block_length_octets = self.u16_at(self.offset + 2) as usize * 4;
        if self.remaining_in_block() < 4 + block_length_octets {
            return self.fail();
        }
        let content = self.offset + 4;
        match block_type {
            XR_BLOCK_RRTR => {
                if block_length_octets < 8 {
                    return self.fail();
                }
                let item = RtcpItem::Rrtr {
                    ntp_seconds: self.u32_at(content),
                    ntp_fraction: self.u32_at(content + 4),
                };
                self.offset = content + block_length_octets;
                Some(item)
            }
            XR_BLOCK_DLRR => {
                self.state = ParseState::Dlrr {
                    end: content + block_length_octets,
                };
                self.offset = content;
                None
            }
            _ => {
                // Unknown XR block; skip it.
                self.offset = content + block_length_octets;
                None
            }
        }
    }

    fn parse_dlrr_item(&mut self, end: usize) -> Option<RtcpItem> {
        if self.offset + 12 > end {
            self.offset = end;
            self.state = ParseState::ExtendedReportBlock;
            return None;
        }
        let item = RtcpItem::Dlrr {
            receivers_ssrc: self.u32_at(self.offset),
            last_receiver_report: self.u32_at(self.offset + 4),
            delay_last_receiver_report: self.u32_at(self.offset + 8),
        };
        self.offset += 12;
        Some(item)
    }

    fn parse_receiver_log_frame(&mut self) -> Option<RtcpItem> {
        if self.remaining_in_block() < 8 {
            self.end_current_block();
            return None;
        }
        let rtp_timestamp = self.u32_at(self.offset);
        let count = self.u8_at(self.offset + 4);
        let base_ms = self.u24_at(self.offset + 5) as u64;
        self.offset += 8;
        self.state = ParseState::ReceiverLogEvent { count, base_ms };
        Some(RtcpItem::ReceiverLogFrame { rtp_timestamp })
    }
}

impl Iterator for RtcpParser<'_> {
    type Item = RtcpItem;

    fn next(&mut self) -> Option<RtcpItem> {
        while !self.done {
            let item = match self.state {
                ParseState::TopLevel => self.parse_top_level(),
                ParseState::ReportBlock { count } => {
                    if count == 0 || self.remaining_in_block() < 24 {
                        self.end_current_block();
                        None
                    } else {
                        let at = self.offset;
                        let item = RtcpItem::ReportBlock {
                            ssrc: self.u32_at(at),
                            fraction_lost: self.u8_at(at + 4),
                            cumulative_lost: self.u24_at(at + 5),
                            extended_highest_sequence_number: self.u32_at(at + 8),
                            jitter: self.u32_at(at + 12),
                            last_sender_report: self.u32_at(at + 16),
                            delay_last_sender_report: self.u32_at(at + 20),
                        };
                        self.offset = at + 24;
                        self.state = ParseState::ReportBlock { count: count - 1 };
                        Some(item)
                    }
                }
                ParseState::Sdes { count } => self.parse_sdes_chunk(count),
                ParseState::ExtendedReportBlock => self.parse_extended_report_block(),
                ParseState::Dlrr { end } => self.parse_dlrr_item(end),
                ParseState::GenericNack => {
                    if self.remaining_in_block() < 4 {
                        self.end_current_block();
                        None
                    } else {
                        let item = RtcpItem::GenericNackItem {
                            packet_id: self.u16_at(self.offset),
                            bitmask: self.u16_at(self.offset + 2),
                        };
                        self.offset += 4;
                        Some(item)
                    }
                }
                ParseState::Fir => {
                    if self.remaining_in_block() < 8 {
                        self.end_current_block();
                        None
                    } else {
                        let item = RtcpItem::FirItem {
                            ssrc: self.u32_at(self.offset),
                            command_sequence_number: self.u8_at(self.offset + 4),
                        };
                        self.offset += 8;
                        Some(item)
                    }
                }
                ParseState::CastNack { count } => {
                    if count == 0 || self.remaining_in_block() < 4 {
                        self.end_current_block();
                        None
                    } else {
                        let item = RtcpItem::CastNackItem {
                            frame_id: self.u8_at(self.offset),
                            packet_id: self.u16_at(self.offset + 1),
                            bitmask: self.u8_at(self.offset + 3),
                        };
                        self.offset += 4;
                        self.state = ParseState::CastNack { count: count - 1 };
                        Some(item)
                    }
                }
                ParseState::SenderLog => {
                    if self.remaining_in_block() < 4 {
                        self.end_current_block();
                        None
                    } else {
                        let word = self.u32_at(self.offset);
                        self.offset += 4;
                        Some(RtcpItem::SenderLogItem {
                            frame_status: RtcpSenderFrameStatus::from_wire((word >> 24) as u8),
                            rtp_timestamp: word & 0x00ff_ffff,
                        })
                    }
                }
                ParseState::ReceiverLog => self.parse_receiver_log_frame(),
                ParseState::ReceiverLogEvent { count, base_ms } => {
                    if count == 0 {
                        self.state = ParseState::ReceiverLog;
                        None
                    } else if self.remaining_in_block() < 4 {
                        self.end_current_block();
                        None
                    } else {
                        let item = RtcpItem::ReceiverLogEvent {
                            event: CastLoggingEvent::from_wire(self.u8_at(self.offset)),
                            event_timestamp_ms: base_ms + self.u8_at(self.offset + 1) as u64,
                            delay_delta_or_packet_id: self.u16_at(self.offset + 2),
                        };
                        self.offset += 4;
                        self.state = ParseState::ReceiverLogEvent {
                            count: count - 1,
                            base_ms,
                        };
                        Some(item)
                    }
                }
            };
            if item.is_some() {
                return item;
            }
        }
        None
    }
}
