pub mod cast_message_builder;
pub mod frame_buffer;
pub mod frame_id_map;

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use log::debug;
use rtcp::types::RtcpCastMessage;
use rtp::header::RtpCastHeader;
use shared::wrap::FrameId;

use crate::config::EncodedFrame;
use cast_message_builder::CastMessageBuilder;
use frame_buffer::FrameBuffer;
use frame_id_map::FrameIdMap;

/// The receiver's jitter buffer: reassembles frames from packets, hands them
/// out in decode order and runs the ACK/NACK message builder.
pub struct Framer {
    decoder_faster_than_max_frame_rate: bool,
    frames: BTreeMap<FrameId, FrameBuffer>,
    frame_id_map: FrameIdMap,
    cast_msg_builder: CastMessageBuilder,
}

impl Framer {
    pub fn new(
        ssrc: u32,
        decoder_faster_than_max_frame_rate: bool,
        max_unacked_frames: usize,
    ) -> Self {
        Self {
            decoder_faster_than_max_frame_rate,
            frames: BTreeMap::new(),
            frame_id_map: FrameIdMap::new(),
            cast_msg_builder: CastMessageBuilder::new(
                ssrc,
                decoder_faster_than_max_frame_rate,
                max_unacked_frames,
            ),
        }
    }

    /// Returns true when this packet completed a frame.
    pub fn insert_packet(&mut self, now: Instant, payload: Bytes, header: &RtpCastHeader) -> bool {
        let complete = match self.frame_id_map.insert_packet(header) {
            None => return false, // Stale packet, no side effects.
            Some(complete) => complete,
        };

        self.frames
            .entry(header.cast.frame_id)
            .or_insert_with(FrameBuffer::new)
            .insert_packet(payload, header);

        if complete {
            // ACK as soon as possible.
            debug!("complete frame {}", header.cast.frame_id);
            self.cast_msg_builder.complete_frame_received(
                now,
                &self.frame_id_map,
                header.cast.frame_id,
                header.cast.is_key_frame,
            );
        }
        complete
    }

    /// Audio dequeue: the next continuous frame, or failing that the oldest
    /// complete frame (frames may be skipped). Does not release the frame.
    pub fn get_encoded_audio_frame(&self) -> Option<(EncodedFrame, bool)> {
        let (frame_id, next_frame) = match self.frame_id_map.next_continuous_frame() {
            Some(frame_id) => (frame_id, true),
            None => (
                self.frame_id_map.next_audio_frame_allowing_missing_frames()?,
                false,
            ),
        };
        let frame = self.frames.get(&frame_id)?.get_encoded_frame()?;
        Some((frame, next_frame))
    }

    /// Video dequeue: the next continuous frame, or, when the decoder can
    /// catch up, the oldest complete frame whose reference is already
    /// released. Does not release the frame.
    pub fn get_encoded_video_frame(&self) -> Option<(EncodedFrame, bool)> {
        let (frame_id, next_frame) = match self.frame_id_map.next_continuous_frame() {
            Some(frame_id) => (frame_id, true),
            None => {
                if !self.decoder_faster_than_max_frame_rate {
                    return None;
                }
                (
                    self.frame_id_map.next_video_frame_allowing_skipping_frames()?,
                    false,
                )
            }
        };
        let frame = self.frames.get(&frame_id)?.get_encoded_frame()?;
        Some((frame, next_frame))
    }

    /// Drops the frame and everything older; releasing over a gap updates
    /// the ACK state right away.
    pub fn release_frame(&mut self, now: Instant, frame_id: FrameId) {
        self.frame_id_map.remove_old_frames(frame_id);
        self.frames.remove(&frame_id);

        // Drop frames with a lower id; skipping over them changes ACK state.
        let before = self.frames.len();
        self.frames.retain(|&id, _| id.is_newer_than(frame_id));
        let skipped_old_frame = self.frames.len() != before;

        if skipped_old_frame {
            self.cast_msg_builder
                .update_cast_message(now, &self.frame_id_map);
        }
    }

    /// Back to the initial state, waiting for a key frame.
    pub fn reset(&mut self) {
        self.frame_id_map.clear();
        self.frames.clear();
        self.cast_msg_builder.reset();
    }

    pub fn time_to_send_next_cast_message(&self, now: Instant) -> Option<Instant> {
        self.cast_msg_builder
            .time_to_send_next_cast_message(now, &self.frame_id_map)
    }

    pub fn send_cast_message(&mut self, now: Instant) {
        self.cast_msg_builder
            .update_cast_message(now, &self.frame_id_map);
    }

    pub fn poll_feedback(&mut self) -> Option<RtcpCastMessage> {
        self.cast_msg_builder.poll_feedback()
    }

    pub fn want_key_frame(&self) -> bool {
        self.cast_msg_builder.want_key_frame()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_id_map.is_empty()
    }
}
