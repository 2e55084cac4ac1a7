#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod config;
pub mod crypto;
pub mod framer;
pub mod pacing;
pub mod receiver;
pub mod rtcp_session;
pub mod sender;

pub use config::{
    AudioCodec, AudioReceiverConfig, AudioSenderConfig, EncodedAudioFrame, EncodedFrame,
    EncodedVideoFrame, RtcpMode, VideoCodec, VideoEncoderController, VideoReceiverConfig,
    VideoSenderConfig,
};
pub use pacing::PacedPacketSender;
pub use receiver::CastReceiver;
pub use sender::{CastSender, SenderEvent};
