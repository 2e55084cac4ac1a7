use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use shared::wrap::{FrameId, PacketId, SeqNum};

use crate::header::{
    CastHeader, RtpCastHeader, RtpHeader, CAST_HEADER_LEN, KEY_FRAME_BIT, MARKER_BIT,
    REFERENCE_FRAME_ID_BIT, RTP_HEADER_LEN, RTP_VERSION,
};

/// A parsed Cast RTP packet: header plus the payload slice it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastPacket {
    pub header: RtpCastHeader,
    pub payload: Bytes,
}

impl CastPacket {
    /// Parses a Cast RTP packet. Rejects truncated input, a version other
    /// than 2, and a `max_packet_id` that precedes `packet_id`.
    pub fn unmarshal(buf: &[u8]) -> Result<CastPacket> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(Error::ErrRtpPacketTooShort);
        }
        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(Error::ErrRtpBadVersion);
        }
        let csrc_count = (buf[0] & 0x0f) as usize;
        let marker = (buf[1] & MARKER_BIT) != 0;
        let payload_type = buf[1] & 0x7f;
        let sequence_number = SeqNum(u16::from_be_bytes([buf[2], buf[3]]));
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let cast_offset = RTP_HEADER_LEN + csrc_count * 4;
        if buf.len() < cast_offset + CAST_HEADER_LEN {
            return Err(Error::ErrRtpPacketTooShort);
        }
        let cast = &buf[cast_offset..];
        let is_key_frame = (cast[0] & KEY_FRAME_BIT) != 0;
        let is_reference = (cast[0] & REFERENCE_FRAME_ID_BIT) != 0;
        let frame_id = FrameId(cast[1]);
        let packet_id = PacketId(u16::from_be_bytes([cast[2], cast[3]]));
        let max_packet_id = PacketId(u16::from_be_bytes([cast[4], cast[5]]));
        if max_packet_id.is_older_than(packet_id) {
            return Err(Error::ErrRtpBadPacketId);
        }

        // Without the reference bit the header is one byte shorter and byte
        // six already belongs to the payload.
        let (reference_frame_id, payload_offset) = if is_reference {
            (FrameId(cast[6]), cast_offset + CAST_HEADER_LEN)
        } else {
            (frame_id.previous(), cast_offset + CAST_HEADER_LEN - 1)
        };

        Ok(CastPacket {
            header: RtpCastHeader {
                rtp: RtpHeader {
                    marker,
                    payload_type,
                    sequence_number,
                    timestamp,
                    ssrc,
                },
                cast: CastHeader {
                    is_key_frame,
                    is_reference,
                    frame_id,
                    packet_id,
                    max_packet_id,
                    reference_frame_id,
                },
            },
            payload: Bytes::copy_from_slice(&buf[payload_offset..]),
        })
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            RTP_HEADER_LEN + CAST_HEADER_LEN + self.payload.len(),
        );
        marshal_header(&self.header, &mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

pub(crate) fn marshal_header(header: &RtpCastHeader, buf: &mut BytesMut) {
    buf.put_u8(RTP_VERSION << 6);
    buf.put_u8(header.rtp.payload_type | if header.rtp.marker { MARKER_BIT } else { 0 });
    buf.put_u16(header.rtp.sequence_number.0);
    buf.put_u32(header.rtp.timestamp);
    buf.put_u32(header.rtp.ssrc);

    let mut bits = 0u8;
    if header.cast.is_key_frame {
        bits |= KEY_FRAME_BIT;
    }
    if header.cast.is_reference {
        bits |= REFERENCE_FRAME_ID_BIT;
    }
    buf.put_u8(bits);
    buf.put_u8(header.cast.frame_id.0);
    buf.put_u16(header.cast.packet_id.0);
    buf.put_u16(header.cast.max_packet_id.0);
    if header.cast.is_reference {
        buf.put_u8(header.cast.reference_frame_id.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(is_reference: bool) -> RtpCastHeader {
        RtpCastHeader {
            rtp: RtpHeader {
                marker: true,
                payload_type: 127,
                sequence_number: SeqNum(0x1234),
                timestamp: 0x11223344,
                ssrc: 0xdeadbeef,
            },
            cast: CastHeader {
                is_key_frame: true,
                is_reference,
                frame_id: FrameId(10),
                packet_id: PacketId(2),
                max_packet_id: PacketId(5),
                reference_frame_id: if is_reference { FrameId(7) } else { FrameId(9) },
            },
        }
    }

    #[test]
    fn test_round_trip_with_reference() {
        let packet = CastPacket {
            header: sample_header(true),
            payload: Bytes::from_static(&[1, 2, 3, 4, 5]),
        };
        let wire = packet.marshal();
        assert_eq!(wire.len(), RTP_HEADER_LEN + CAST_HEADER_LEN + 5);
        let parsed = CastPacket::unmarshal(&wire).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_round_trip_without_reference() {
        let packet = CastPacket {
            header: sample_header(false),
            payload: Bytes::from_static(&[9, 8, 7]),
        };
        let wire = packet.marshal();
        // Short form: one byte less of header.
        assert_eq!(wire.len(), RTP_HEADER_LEN + CAST_HEADER_LEN - 1 + 3);
        let parsed = CastPacket::unmarshal(&wire).unwrap();
        // The implicit reference is frame_id - 1.
        assert_eq!(parsed.header.cast.reference_frame_id, FrameId(9));
        assert_eq!(parsed.payload, packet.payload);
    }

    #[test]
    fn test_rejects_bad_version() {
        let packet = CastPacket {
            header: sample_header(true),
            payload: Bytes::new(),
        };
        let mut wire = BytesMut::from(&packet.marshal()[..]);
        wire[0] = 0x40; // version 1
        assert_eq!(
            CastPacket::unmarshal(&wire),
            Err(Error::ErrRtpBadVersion)
        );
    }

    #[test]
    fn test_rejects_max_packet_id_before_packet_id() {
        let mut header = sample_header(true);
        header.cast.packet_id = PacketId(6);
        header.cast.max_packet_id = PacketId(5);
        let packet = CastPacket {
            header,
            payload: Bytes::new(),
        };
        assert_eq!(
            CastPacket::unmarshal(&packet.marshal()),
            Err(Error::ErrRtpBadPacketId)
        );
    }

    #[test]
    fn test_rejects_truncated() {
        let packet = CastPacket {
            header: sample_header(true),
            payload: Bytes::new(),
        };
        let wire = packet.marshal();
        assert_eq!(
            CastPacket::unmarshal(&wire[..RTP_HEADER_LEN + 3]),
            Err(Error::ErrRtpPacketTooShort)
        );
        assert_eq!(
            CastPacket::unmarshal(&wire[..4]),
            Err(Error::ErrRtpPacketTooShort)
        );
    }

    #[test]
    fn test_marker_only_on_last_packet_bit() {
        let mut header = sample_header(true);
        header.rtp.marker = false;
        let wire = CastPacket {
            header,
            payload: Bytes::new(),
        }
        .marshal();
        assert_eq!(wire[1] & 0x80, 0);
        assert_eq!(wire[1] & 0x7f, 127);
    }
}
