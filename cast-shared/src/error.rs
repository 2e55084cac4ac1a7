#![allow(dead_code)]

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("rtp: packet too short")]
    ErrRtpPacketTooShort,
    #[error("rtp: version is not 2")]
    ErrRtpBadVersion,
    #[error("rtp: payload type does not match stream")]
    ErrRtpPayloadTypeMismatch,
    #[error("rtp: ssrc does not match stream")]
    ErrRtpSsrcMismatch,
    #[error("rtp: max packet id precedes packet id")]
    ErrRtpBadPacketId,
    #[error("rtp: payload does not fit in a single frame window")]
    ErrRtpFrameTooLarge,
    #[error("rtcp: packet too short")]
    ErrRtcpPacketTooShort,
    #[error("rtcp: version is not 2")]
    ErrRtcpBadVersion,
    #[error("rtcp: block length exceeds datagram")]
    ErrRtcpBlockTruncated,
    #[error("rtcp: compound packet exceeds mtu")]
    ErrRtcpPacketTooBig,
    #[error("crypto: aes key must be 16 bytes")]
    ErrAesKeyLength,
    #[error("crypto: aes iv mask must be 16 bytes")]
    ErrAesIvMaskLength,
    #[error("crypto: key and iv mask must be configured together")]
    ErrAesPartialConfig,
    #[error("crypto: decrypt failed")]
    ErrDecryptFailed,
    #[error("config: rtcp cname too long")]
    ErrCnameTooLong,
    #[error("{0}")]
    Other(String),
}
