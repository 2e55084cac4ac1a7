use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use rtp::header::RtpCastHeader;
use shared::wrap::{FrameId, PacketId};

use crate::config::EncodedFrame;

/// Accumulates one frame's payload bytes, packet by packet.
pub struct FrameBuffer {
    frame_id: FrameId,
    max_packet_id: PacketId,
    num_packets_received: u16,
    is_key_frame: bool,
    total_data_size: usize,
    last_referenced_frame_id: FrameId,
    rtp_timestamp: u32,
    packets: BTreeMap<u16, Bytes>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            frame_id: FrameId::default(),
            max_packet_id: PacketId::default(),
            num_packets_received: 0,
            is_key_frame: false,
            total_data_size: 0,
            last_referenced_frame_id: FrameId::default(),
            rtp_timestamp: 0,
            packets: BTreeMap::new(),
        }
    }

    pub fn insert_packet(&mut self, payload: Bytes, header: &RtpCastHeader) {
        if self.packets.is_empty() {
            self.frame_id = header.cast.frame_id;
            self.max_packet_id = header.cast.max_packet_id;
            self.is_key_frame = header.cast.is_key_frame;
            self.last_referenced_frame_id = header.referenced_frame_id();
            self.rtp_timestamp = header.rtp.timestamp;
        }
        if self.packets.insert(header.cast.packet_id.0, payload.clone()).is_none() {
            self.num_packets_received += 1;
            self.total_data_size += payload.len();
        }
    }

    pub fn complete(&self) -> bool {
        self.num_packets_received > 0
            && self.num_packets_received - 1 == self.max_packet_id.0
    }

    /// Reassembles the frame in packet order. `None` until complete.
    pub fn get_encoded_frame(&self) -> Option<EncodedFrame> {
        if !self.complete() {
            return None;
        }
        let mut data = BytesMut::with_capacity(self.total_data_size);
        for payload in self.packets.values() {
            data.extend_from_slice(payload);
        }
        Some(EncodedFrame {
            key_frame: self.is_key_frame,
            frame_id: self.frame_id,
            referenced_frame_id: self.last_referenced_frame_id,
            rtp_timestamp: self.rtp_timestamp,
            data: data.freeze(),
        })
    }

    pub fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn last_referenced_frame_id(&self) -> FrameId {
        self.last_referenced_frame_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp::header::{CastHeader, RtpHeader};
    use shared::wrap::SeqNum;

    fn header(frame_id: u8, packet_id: u16, max_packet_id: u16) -> RtpCastHeader {
        RtpCastHeader {
            rtp: RtpHeader {
                marker: packet_id == max_packet_id,
                payload_type: 96,
                sequence_number: SeqNum(packet_id),
                timestamp: 0x100,
                ssrc: 1,
            },
            cast: CastHeader {
                is_key_frame: true,
                is_reference: false,
                frame_id: FrameId(frame_id),
                packet_id: PacketId(packet_id),
                max_packet_id: PacketId(max_packet_id),
                reference_frame_id: FrameId(frame_id).previous(),
            },
        }
    }

    #[test]
    fn test_assembles_in_packet_order() {
        let mut buffer = FrameBuffer::new();
        buffer.insert_packet(Bytes::from_static(b"world"), &header(0, 1, 1));
        assert!(!buffer.complete());
        buffer.insert_packet(Bytes::from_static(b"hello "), &header(0, 0, 1));
        assert!(buffer.complete());
        let frame = buffer.get_encoded_frame().unwrap();
        assert_eq!(&frame.data[..], b"hello world");
        assert_eq!(frame.rtp_timestamp, 0x100);
        assert!(frame.key_frame);
    }

    #[test]
    fn test_duplicate_packet_is_ignored() {
        let mut buffer = FrameBuffer::new();
        buffer.insert_packet(Bytes::from_static(b"a"), &header(0, 0, 1));
        buffer.insert_packet(Bytes::from_static(b"a"), &header(0, 0, 1));
        assert!(!buffer.complete());
        buffer.insert_packet(Bytes::from_static(b"b"), &header(0, 1, 1));
        assert_eq!(&buffer.get_encoded_frame().unwrap().data[..], b"ab");
    }

    #[test]
    fn test_single_packet_frame() {
        let mut buffer = FrameBuffer::new();
        buffer.insert_packet(Bytes::from_static(b"only"), &header(5, 0, 0));
        assert!(buffer.complete());
        let frame = buffer.get_encoded_frame().unwrap();
        assert_eq!(frame.frame_id, FrameId(5));
        assert_eq!(frame.referenced_frame_id, FrameId(4));
    }
}
