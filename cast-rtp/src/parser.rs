use shared::error::{Error, Result};

use crate::packet::CastPacket;

/// Validating parser for one configured stream: in addition to wire-level
/// checks, packets must carry the expected SSRC and payload type.
#[derive(Debug, Clone, Copy)]
pub struct RtpParser {
    ssrc: u32,
    payload_type: u8,
}

impl RtpParser {
    pub fn new(ssrc: u32, payload_type: u8) -> Self {
        Self { ssrc, payload_type }
    }

    pub fn parse(&self, buf: &[u8]) -> Result<CastPacket> {
        let packet = CastPacket::unmarshal(buf)?;
        if packet.header.rtp.payload_type != self.payload_type {
            return Err(Error::ErrRtpPayloadTypeMismatch);
        }
        if packet.header.rtp.ssrc != self.ssrc {
            return Err(Error::ErrRtpSsrcMismatch);
        }
        Ok(packet)
    }
}
