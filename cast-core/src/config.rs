use bytes::Bytes;
use shared::wrap::FrameId;

/// How outgoing RTCP compounds are assembled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RtcpMode {
    /// Compound RTCP per RFC 4585.
    #[default]
    Compound,
    /// Reduced-size RTCP per RFC 5506.
    ReducedSize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    #[default]
    Vp8,
    H264,
    ExternalVideo,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    #[default]
    Opus,
    Pcm16,
    ExternalAudio,
}

pub const DEFAULT_MAX_QP: i32 = 56;
pub const DEFAULT_MIN_QP: i32 = 4;
pub const DEFAULT_MAX_FRAME_RATE: i32 = 30;
pub const DEFAULT_NUMBER_OF_VIDEO_BUFFERS: i32 = 1;
pub const DEFAULT_RTCP_INTERVAL_MS: i32 = 500;
pub const DEFAULT_RTP_HISTORY_MS: i32 = 1000;
pub const DEFAULT_RTP_MAX_DELAY_MS: i32 = 100;

#[derive(Debug, Clone)]
pub struct AudioSenderConfig {
    pub sender_ssrc: u32,
    pub incoming_feedback_ssrc: u32,

    pub rtcp_interval_ms: i32,
    pub rtcp_c_name: String,
    pub rtcp_mode: RtcpMode,

    /// How long RTP packets are stored for retransmissions.
    pub rtp_history_ms: i32,
    pub rtp_max_delay_ms: i32,
    pub rtp_payload_type: i32,

    pub use_external_encoder: bool,
    pub frequency: i32,
    pub channels: i32,
    pub bitrate: i32,
    pub codec: AudioCodec,

    /// 0 or 16 bytes.
    pub aes_key: Vec<u8>,
    /// 0 or 16 bytes.
    pub aes_iv_mask: Vec<u8>,
}

impl Default for AudioSenderConfig {
    fn default() -> Self {
        Self {
            sender_ssrc: 0,
            incoming_feedback_ssrc: 0,
            rtcp_interval_ms: DEFAULT_RTCP_INTERVAL_MS,
            rtcp_c_name: String::new(),
            rtcp_mode: RtcpMode::default(),
            rtp_history_ms: DEFAULT_RTP_HISTORY_MS,
            rtp_max_delay_ms: DEFAULT_RTP_MAX_DELAY_MS,
            rtp_payload_type: 127,
            use_external_encoder: false,
            frequency: 48_000,
            channels: 2,
            bitrate: 0,
            codec: AudioCodec::default(),
            aes_key: Vec::new(),
            aes_iv_mask: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoSenderConfig {
    pub sender_ssrc: u32,
    pub incoming_feedback_ssrc: u32,

    pub rtcp_interval_ms: i32,
    pub rtcp_c_name: String,
    pub rtcp_mode: RtcpMode,

    /// How long RTP packets are stored for retransmissions.
    pub rtp_history_ms: i32,
    pub rtp_max_delay_ms: i32,
    pub rtp_payload_type: i32,

    pub use_external_encoder: bool,
    pub width: i32,
    pub height: i32,

    pub congestion_control_back_off: f32,
    pub max_bitrate: i32,
    pub min_bitrate: i32,
    pub start_bitrate: i32,
    pub max_qp: i32,
    pub min_qp: i32,
    pub max_frame_rate: i32,
    /// Max value depends on the codec.
    pub max_number_of_video_buffers_used: i32,
    pub codec: VideoCodec,

    /// 0 or 16 bytes.
    pub aes_key: Vec<u8>,
    /// 0 or 16 bytes.
    pub aes_iv_mask: Vec<u8>,
}

impl Default for VideoSenderConfig {
    fn default() -> Self {
        Self {
            sender_ssrc: 0,
            incoming_feedback_ssrc: 0,
            rtcp_interval_ms: DEFAULT_RTCP_INTERVAL_MS,
            rtcp_c_name: String::new(),
            rtcp_mode: RtcpMode::default(),
            rtp_history_ms: DEFAULT_RTP_HISTORY_MS,
            rtp_max_delay_ms: DEFAULT_RTP_MAX_DELAY_MS,
            rtp_payload_type: 96,
            use_external_encoder: false,
            width: 0,
            height: 0,
            congestion_control_back_off: 0.875,
            max_bitrate: 0,
            min_bitrate: 0,
            start_bitrate: 0,
            max_qp: DEFAULT_MAX_QP,
            min_qp: DEFAULT_MIN_QP,
            max_frame_rate: DEFAULT_MAX_FRAME_RATE,
            max_number_of_video_buffers_used: DEFAULT_NUMBER_OF_VIDEO_BUFFERS,
            codec: VideoCodec::default(),
            aes_key: Vec::new(),
            aes_iv_mask: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioReceiverConfig {
    pub feedback_ssrc: u32,
    pub incoming_ssrc: u32,

    pub rtcp_interval_ms: i32,
    pub rtcp_c_name: String,
    pub rtcp_mode: RtcpMode,

    /// How long the receiver waits for retransmissions.
    pub rtp_max_delay_ms: i32,
    pub rtp_payload_type: i32,

    pub use_external_decoder: bool,
    pub frequency: i32,
    pub channels: i32,
    pub codec: AudioCodec,

    /// 0 or 16 bytes.
    pub aes_key: Vec<u8>,
    /// 0 or 16 bytes.
    pub aes_iv_mask: Vec<u8>,
}

impl Default for AudioReceiverConfig {
    fn default() -> Self {
        Self {
            feedback_ssrc: 0,
            incoming_ssrc: 0,
            rtcp_interval_ms: DEFAULT_RTCP_INTERVAL_MS,
            rtcp_c_name: String::new(),
            rtcp_mode: RtcpMode::default(),
            rtp_max_delay_ms: DEFAULT_RTP_MAX_DELAY_MS,
            rtp_payload_type: 127,
            use_external_decoder: false,
            frequency: 48_000,
            channels: 2,
            codec: AudioCodec::default(),
            aes_key: Vec::new(),
            aes_iv_mask: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoReceiverConfig {
    pub feedback_ssrc: u32,
    pub incoming_ssrc: u32,

    pub rtcp_interval_ms: i32,
    pub rtcp_c_name: String,
    pub rtcp_mode: RtcpMode,

    /// How long the receiver waits for retransmissions.
    pub rtp_max_delay_ms: i32,
    pub rtp_payload_type: i32,

    pub use_external_decoder: bool,
    pub max_frame_rate: i32,

    /// Some hardware decoders cannot run faster than the frame rate, which
    /// keeps them from catching up after a glitch; that drives the
    /// slow-down-ACK policy.
    pub decoder_faster_than_max_frame_rate: bool,
    /// ACK throttling threshold while the decoder lags.
    pub max_unacked_frames: i32,
    pub codec: VideoCodec,

    /// 0 or 16 bytes.
    pub aes_key: Vec<u8>,
    /// 0 or 16 bytes.
    pub aes_iv_mask: Vec<u8>,
}

impl Default for VideoReceiverConfig {
    fn default() -> Self {
        Self {
            feedback_ssrc: 0,
            incoming_ssrc: 0,
            rtcp_interval_ms: DEFAULT_RTCP_INTERVAL_MS,
            rtcp_c_name: String::new(),
            rtcp_mode: RtcpMode::default(),
            rtp_max_delay_ms: DEFAULT_RTP_MAX_DELAY_MS,
            rtp_payload_type: 96,
            use_external_decoder: false,
            max_frame_rate: DEFAULT_MAX_FRAME_RATE,
            decoder_faster_than_max_frame_rate: true,
            max_unacked_frames: 0,
            codec: VideoCodec::default(),
            aes_key: Vec::new(),
            aes_iv_mask: Vec::new(),
        }
    }
}

/// An encoded audio frame on its way to the packetizer.
#[derive(Debug, Default, Clone)]
pub struct EncodedAudioFrame {
    pub codec: AudioCodec,
    pub frame_id: FrameId,
    /// Sample count; advances the RTP timestamp on the send side.
    pub samples: u32,
    pub data: Bytes,
}

/// An encoded video frame on its way to the packetizer.
#[derive(Debug, Default, Clone)]
pub struct EncodedVideoFrame {
    pub codec: VideoCodec,
    pub key_frame: bool,
    pub frame_id: FrameId,
    pub last_referenced_frame_id: FrameId,
    pub data: Bytes,
}

/// A reassembled frame leaving the receiver's jitter buffer.
#[derive(Debug, Default, Clone)]
pub struct EncodedFrame {
    pub key_frame: bool,
    pub frame_id: FrameId,
    pub referenced_frame_id: FrameId,
    pub rtp_timestamp: u32,
    pub data: Bytes,
}

/// Control surface of the (external) video encoder.
pub trait VideoEncoderController {
    /// Inform the encoder about the new target bit rate.
    fn set_bit_rate(&mut self, new_bit_rate: i32);

    /// Inform the encoder to not encode the next frame.
    /// This setting is sticky; it lasts until called with `false`.
    fn skip_next_frame(&mut self, skip_next_frame: bool);

    /// Inform the encoder to encode the next frame as a key frame.
    fn generate_key_frame(&mut self);

    /// Inform the encoder to only reference frames older or equal to
    /// `frame_id`.
    fn latest_frame_id_to_reference(&mut self, frame_id: FrameId);

    /// How many frames the encoder has skipped due to slow ACKs.
    fn number_of_skipped_frames(&self) -> i32;
}
