use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use log::debug;
use rtcp::types::{PacketIdSet, RtcpCastMessage, CAST_ALL_PACKETS_LOST};
use shared::wrap::FrameId;

use super::frame_id_map::FrameIdMap;

/// Maximum quiet period between two feedback messages.
pub const CAST_MESSAGE_UPDATE_INTERVAL: Duration = Duration::from_millis(33);

/// A frame's packets are NACKed at most once per this interval.
pub const NACK_REPEAT_INTERVAL: Duration = Duration::from_millis(30);

/// Builds the ACK/NACK feedback stream for one incoming media stream.
///
/// The builder reads (never mutates) the framer's [`FrameIdMap`] and queues
/// finished [`RtcpCastMessage`]s; the receiver drains them with
/// [`CastMessageBuilder::poll_feedback`] and hands them to the RTCP sender.
pub struct CastMessageBuilder {
    media_ssrc: u32,
    decoder_faster_than_max_frame_rate: bool,
    max_unacked_frames: usize,

    cast_msg: RtcpCastMessage,
    last_update_time: Option<Instant>,
    waiting_for_key_frame: bool,
    time_last_nacked_map: BTreeMap<FrameId, Instant>,

    slowing_down_ack: bool,
    acked_last_frame: bool,
    last_acked_frame_id: FrameId,

    outbox: VecDeque<RtcpCastMessage>,
}

impl CastMessageBuilder {
    pub fn new(
        media_ssrc: u32,
        decoder_faster_than_max_frame_rate: bool,
        max_unacked_frames: usize,
    ) -> Self {
        let mut cast_msg = RtcpCastMessage::new(media_ssrc);
        cast_msg.ack_frame_id = FrameId::START.0 as u32;
        Self {
            media_ssrc,
            decoder_faster_than_max_frame_rate,
            max_unacked_frames,
            cast_msg,
            last_update_time: None,
            waiting_for_key_frame: true,
            time_last_nacked_map: BTreeMap::new(),
            slowing_down_ack: false,
            acked_last_frame: true,
            last_acked_frame_id: FrameId::START,
            outbox: VecDeque::new(),
        }
    }

    /// Called by the framer whenever a frame becomes complete. ACKs as soon
    /// as possible; while a key frame is still owed, complete delta frames
    /// are ignored.
    pub fn complete_frame_received(
        &mut self,
        now: Instant,
        frame_id_map: &FrameIdMap,
        frame_id: FrameId,
        is_key_frame: bool,
    ) {
        if self.last_update_time.is_none() {
            // Our first update.
            self.last_update_time = Some(now);
        }
        if self.waiting_for_key_frame {
            if !is_key_frame {
                return;
            }
            self.waiting_for_key_frame = false;
            self.cast_msg.missing_frames_and_packets.clear();
            self.time_last_nacked_map.clear();
            // The decoder restarts at this key frame; older incomplete
            // frames no longer hold the ACK back.
            self.last_acked_frame_id = frame_id;
        }
        if !self.update_ack_message(frame_id_map) {
            return;
        }
        self.build_packet_list(now, frame_id_map);
        self.last_update_time = Some(now);
        debug!("send cast message, ack {}", self.last_acked_frame_id);
        self.outbox.push_back(self.cast_msg.clone());
    }

    /// Timer-driven update: emits a (possibly unchanged) message once the
    /// update interval has elapsed.
    pub fn update_cast_message(&mut self, now: Instant, frame_id_map: &FrameIdMap) {
        match self.last_update_time {
            None => {
                if !frame_id_map.is_empty() {
                    // We have received packets.
                    self.last_update_time = Some(now);
                }
            }
            Some(last_update) => {
                if now.duration_since(last_update) < CAST_MESSAGE_UPDATE_INTERVAL {
                    return;
                }
                self.last_update_time = Some(now);
                // Covers the case where no frame completed since last time.
                self.update_ack_message(frame_id_map);
                self.build_packet_list(now, frame_id_map);
                self.outbox.push_back(self.cast_msg.clone());
            }
        }
    }

    /// When the scheduler should call [`CastMessageBuilder::update_cast_message`]
    /// next. `None` until any packet has arrived.
    pub fn time_to_send_next_cast_message(
        &self,
        now: Instant,
        frame_id_map: &FrameIdMap,
    ) -> Option<Instant> {
        match self.last_update_time {
            Some(last_update) => Some(last_update + CAST_MESSAGE_UPDATE_INTERVAL),
            None if !frame_id_map.is_empty() => Some(now),
            None => None,
        }
    }

    /// Clears all NACK state; the next message will request a key frame.
    pub fn reset(&mut self) {
        self.waiting_for_key_frame = true;
        self.cast_msg.ack_frame_id = FrameId::START.0 as u32;
        self.last_acked_frame_id = FrameId::START;
        self.cast_msg.missing_frames_and_packets.clear();
        self.time_last_nacked_map.clear();
    }

    /// True while the builder is owed a key frame; the receiver attaches a
    /// PLI to outgoing reports while this holds.
    pub fn want_key_frame(&self) -> bool {
        self.waiting_for_key_frame
    }

    pub fn poll_feedback(&mut self) -> Option<RtcpCastMessage> {
        self.outbox.pop_front()
    }

    /// Returns false when nothing changed and no message needs to go out.
    fn update_ack_message(&mut self, frame_id_map: &FrameIdMap) -> bool {
        if !self.decoder_faster_than_max_frame_rate {
            let complete_frame_count = frame_id_map.number_of_complete_frames();
            if complete_frame_count > self.max_unacked_frames {
                self.slowing_down_ack = true;
            } else if complete_frame_count <= 1 {
                self.slowing_down_ack = false;
            }
        }
        if self.slowing_down_ack {
            // Acknowledge only every other frame while the decoder lags.
            if self.acked_last_frame {
                self.acked_last_frame = false;
            } else {
                self.acked_last_frame = true;
                let next = self.last_acked_frame_id.next();
                if next.is_older_or_equal(frame_id_map.last_continuous_frame()) {
                    self.last_acked_frame_id = next;
                }
            }
            self.cast_msg.ack_frame_id = self.last_acked_frame_id.0 as u32;
            true
        } else {
            self.acked_last_frame = true;
            let last_continuous = frame_id_map.last_continuous_frame();
            // The ACK never regresses; after a key frame the candidate from
            // the map may be behind the key frame id.
            if last_continuous.is_newer_than(self.last_acked_frame_id) {
                self.last_acked_frame_id = last_continuous;
            }
            if self.cast_msg.ack_frame_id == self.last_acked_frame_id.0 as u32 {
                return false;
            }
            self.cast_msg.ack_frame_id = self.last_acked_frame_id.0 as u32;
            true
        }
    }

    fn build_packet_list(&mut self, now: Instant, frame_id_map: &FrameIdMap) {
        self.cast_msg.missing_frames_and_packets.clear();
        let last_released = frame_id_map.last_released_frame();
        self.time_last_nacked_map
            .retain(|&frame_id, _| frame_id.is_newer_than(last_released));

        if frame_id_map.is_empty() {
            return;
        }
        let newest_frame_id = frame_id_map.newest_frame_id();
        let mut next_expected = FrameId(self.cast_msg.ack_frame_id as u8).next();

        while !next_expected.is_newer_than(newest_frame_id) {
            let nacked_recently = matches!(
                self.time_last_nacked_map.get(&next_expected),
                Some(&t) if now.duration_since(t) < NACK_REPEAT_INTERVAL
            );
            if !nacked_recently {
                if frame_id_map.frame_exists(next_expected) {
                    let missing = frame_id_map
                        .get_missing_packets(next_expected, next_expected == newest_frame_id);
                    if !missing.is_empty() {
                        self.time_last_nacked_map.insert(next_expected, now);
                        self.cast_msg
                            .missing_frames_and_packets
                            .insert(next_expected.0, missing);
                    }
                } else {
                    // A frame we never saw a single packet of.
                    self.time_last_nacked_map.insert(next_expected, now);
                    let mut all_lost = PacketIdSet::new();
                    all_lost.insert(CAST_ALL_PACKETS_LOST);
                    self.cast_msg
                        .missing_frames_and_packets
                        .insert(next_expected.0, all_lost);
                }
            }
            next_expected = next_expected.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp::header::{CastHeader, RtpCastHeader, RtpHeader};
    use shared::wrap::PacketId;

    const SSRC: u32 = 0x1234;
    const SHORT_TIME_INCREMENT: Duration = Duration::from_millis(10);
    const LONG_TIME_INCREMENT: Duration = Duration::from_millis(40);

    struct Harness {
        builder: CastMessageBuilder,
        map: FrameIdMap,
        header: RtpCastHeader,
        now: Instant,
        last_message: Option<RtcpCastMessage>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_decoder(true, 0)
        }

        fn with_decoder(faster: bool, max_unacked_frames: usize) -> Self {
            let mut header = RtpCastHeader {
                rtp: RtpHeader {
                    ssrc: SSRC,
                    ..Default::default()
                },
                cast: CastHeader::default(),
            };
            header.cast.max_packet_id = PacketId(0);
            Self {
                builder: CastMessageBuilder::new(SSRC, faster, max_unacked_frames),
                map: FrameIdMap::new(),
                header,
                now: Instant::now(),
                last_message: None,
            }
        }

        fn set_frame_id(&mut self, frame_id: u8) {
            self.header.cast.frame_id = FrameId(frame_id);
        }

        fn set_packet_id(&mut self, packet_id: u16) {
            self.header.cast.packet_id = PacketId(packet_id);
        }

        fn set_max_packet_id(&mut self, max_packet_id: u16) {
            self.header.cast.max_packet_id = PacketId(max_packet_id);
        }

        fn set_key_frame(&mut self, key: bool) {
            self.header.cast.is_key_frame = key;
        }

        fn set_reference_frame_id(&mut self, reference: u8) {
            self.header.cast.is_reference = true;
            self.header.cast.reference_frame_id = FrameId(reference);
        }

        fn insert_packet(&mut self) {
            if let Some(complete) = self.map.insert_packet(&self.header) {
                if complete {
                    self.builder.complete_frame_received(
                        self.now,
                        &self.map,
                        self.header.cast.frame_id,
                        self.header.cast.is_key_frame,
                    );
                }
            }
            self.builder.update_cast_message(self.now, &self.map);
        }

        fn advance(&mut self, delta: Duration) {
            self.now += delta;
        }

        /// True when at least one message was emitted since the last call.
        fn triggered(&mut self) -> bool {
            let mut any = false;
            while let Some(message) = self.builder.poll_feedback() {
                assert_eq!(message.media_ssrc, SSRC);
                self.last_message = Some(message);
                any = true;
            }
            any
        }

        fn last_frame_acked(&self) -> u32 {
            self.last_message.as_ref().map(|m| m.ack_frame_id).unwrap()
        }

        fn num_missing_packets(&self, frame_id: u8) -> usize {
            let message = self.last_message.as_ref().unwrap();
            match message.missing_frames_and_packets.get(&frame_id) {
                None => 0,
                Some(set) => {
                    if set.len() == 1 && set.contains(&CAST_ALL_PACKETS_LOST) {
                        CAST_ALL_PACKETS_LOST as usize
                    } else {
                        set.len()
                    }
                }
            }
        }
    }

    #[test]
    fn test_start_with_a_key_frame() {
        let mut h = Harness::new();
        h.set_frame_id(3);
        h.set_packet_id(0);
        h.set_max_packet_id(0);
        h.insert_packet();
        // Should not trigger an ack.
        assert!(!h.triggered());
        h.set_frame_id(5);
        h.set_key_frame(true);
        h.insert_packet();
        h.map.remove_old_frames(FrameId(5)); // Simulate 5 being rendered.
        h.advance(LONG_TIME_INCREMENT);
        h.builder.update_cast_message(h.now, &h.map);
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 5);
    }

    #[test]
    fn test_one_frame_nack_list() {
        let mut h = Harness::new();
        h.set_frame_id(0);
        h.set_packet_id(4);
        h.set_max_packet_id(10);
        h.insert_packet();
        h.advance(SHORT_TIME_INCREMENT);
        assert!(!h.triggered());
        h.advance(LONG_TIME_INCREMENT);
        h.set_packet_id(5);
        h.insert_packet();
        assert!(h.triggered());
        assert_eq!(h.num_missing_packets(0), 4);
    }

    #[test]
    fn test_complete_frame_missing() {
        let mut h = Harness::new();
        h.set_frame_id(0);
        h.set_packet_id(2);
        h.set_max_packet_id(5);
        h.insert_packet();
        h.advance(LONG_TIME_INCREMENT);
        h.set_frame_id(2);
        h.insert_packet();
        assert!(h.triggered());
        assert_eq!(h.num_missing_packets(1), CAST_ALL_PACKETS_LOST as usize);
    }

    #[test]
    fn test_fast_forward_ack() {
        let mut h = Harness::new();
        h.set_frame_id(1);
        h.set_packet_id(0);
        h.set_max_packet_id(0);
        h.insert_packet();
        assert!(!h.triggered());
        h.advance(LONG_TIME_INCREMENT);
        h.set_frame_id(2);
        h.insert_packet();
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), FrameId::START.0 as u32);
        h.advance(LONG_TIME_INCREMENT);
        h.set_frame_id(0);
        h.set_key_frame(true);
        h.insert_packet();
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 2);
    }

    #[test]
    fn test_remove_old_frames() {
        let mut h = Harness::new();
        h.set_frame_id(1);
        h.set_packet_id(0);
        h.set_max_packet_id(1);
        h.insert_packet();
        assert!(!h.triggered());
        h.advance(LONG_TIME_INCREMENT);
        h.set_frame_id(2);
        h.set_max_packet_id(0);
        h.insert_packet();
        assert!(h.triggered());
        h.advance(LONG_TIME_INCREMENT);
        h.set_frame_id(3);
        h.set_max_packet_id(5);
        h.insert_packet();
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), FrameId::START.0 as u32);
        h.advance(LONG_TIME_INCREMENT);
        h.set_frame_id(5);
        h.set_max_packet_id(0);
        h.set_key_frame(true);
        h.insert_packet();
        h.advance(LONG_TIME_INCREMENT);
        h.map.remove_old_frames(FrameId(5)); // Simulate 5 being rendered.
        h.builder.update_cast_message(h.now, &h.map);
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 5);
        h.advance(SHORT_TIME_INCREMENT);
        h.set_frame_id(1);
        h.set_packet_id(1);
        h.set_max_packet_id(1);
        h.set_key_frame(false);
        h.insert_packet();
        assert!(!h.triggered());
        h.advance(LONG_TIME_INCREMENT);
        h.insert_packet();
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 5);
    }

    #[test]
    fn test_wrap_fast_forward() {
        let mut h = Harness::new();
        h.set_frame_id(254);
        h.set_packet_id(0);
        h.set_max_packet_id(1);
        h.set_key_frame(true);
        h.insert_packet();
        assert!(!h.triggered());
        h.advance(LONG_TIME_INCREMENT);
        h.set_frame_id(255);
        h.set_max_packet_id(0);
        h.set_key_frame(false);
        h.insert_packet();
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 253);
        h.advance(LONG_TIME_INCREMENT);
        h.set_frame_id(0); // 256 after the wrap.
        h.insert_packet();
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 253);
        h.advance(LONG_TIME_INCREMENT);
        h.set_frame_id(254);
        h.set_packet_id(1);
        h.set_max_packet_id(1);
        h.set_key_frame(true);
        h.insert_packet();
        assert!(h.triggered());
        // 256 modulo the 8-bit wire id.
        assert_eq!(h.last_frame_acked(), 0);
    }

    #[test]
    fn test_nack_until_max_received_packet() {
        let mut h = Harness::new();
        h.set_frame_id(0);
        h.set_packet_id(0);
        h.set_max_packet_id(20);
        h.set_key_frame(true);
        h.insert_packet();
        h.advance(LONG_TIME_INCREMENT);
        h.set_packet_id(5);
        h.insert_packet();
        assert!(h.triggered());
        assert_eq!(h.num_missing_packets(0), 4);
    }

    #[test]
    fn test_nack_until_max_received_packet_next_frame() {
        let mut h = Harness::new();
        h.set_frame_id(0);
        h.set_packet_id(0);
        h.set_max_packet_id(20);
        h.set_key_frame(true);
        h.insert_packet();
        h.advance(LONG_TIME_INCREMENT);
        h.set_packet_id(5);
        h.insert_packet();
        h.advance(LONG_TIME_INCREMENT);
        assert!(h.triggered());
        assert_eq!(h.num_missing_packets(0), 4);
        h.set_frame_id(1);
        h.set_max_packet_id(2);
        h.set_packet_id(0);
        h.set_key_frame(false);
        h.insert_packet();
        h.advance(LONG_TIME_INCREMENT);
        assert!(h.triggered());
        // Frame 0 is no longer the newest; all 19 remaining packets count.
        assert_eq!(h.num_missing_packets(0), 19);
    }

    #[test]
    fn test_nack_until_max_received_packet_next_key() {
        let mut h = Harness::new();
        h.set_frame_id(0);
        h.set_packet_id(0);
        h.set_max_packet_id(20);
        h.set_key_frame(true);
        h.insert_packet();
        h.advance(LONG_TIME_INCREMENT);
        h.set_packet_id(5);
        h.insert_packet();
        h.advance(LONG_TIME_INCREMENT);
        assert!(h.triggered());
        assert_eq!(h.num_missing_packets(0), 4);
        h.set_frame_id(1);
        h.set_max_packet_id(0);
        h.set_packet_id(0);
        h.insert_packet();
        h.advance(LONG_TIME_INCREMENT);
        assert!(h.triggered());
        // The new key frame supersedes the incomplete frame 0.
        assert_eq!(h.num_missing_packets(0), 0);
    }

    #[test]
    fn test_reset() {
        let mut h = Harness::new();
        h.insert_packet();
        h.advance(LONG_TIME_INCREMENT);
        h.builder.reset();
        h.map.clear();
        // Reset drops the nack list state and requests a key frame.
        h.builder.update_cast_message(h.now, &h.map);
        assert!(h.triggered());
        assert_eq!(h.num_missing_packets(0), 0);
        assert!(h.builder.want_key_frame());
    }

    #[test]
    fn test_delta_after_reset() {
        let mut h = Harness::new();
        h.set_frame_id(0);
        h.set_packet_id(0);
        h.set_max_packet_id(0);
        h.set_key_frame(true);
        h.insert_packet();
        assert!(h.triggered());
        assert_eq!(h.num_missing_packets(0), 0);
        h.advance(LONG_TIME_INCREMENT);
        h.builder.reset();
        h.set_frame_id(1);
        h.set_key_frame(true);
        assert!(!h.triggered());
    }

    #[test]
    fn test_basic_rps() {
        let mut h = Harness::new();
        h.set_frame_id(0);
        h.set_packet_id(0);
        h.set_max_packet_id(0);
        h.set_key_frame(true);
        h.insert_packet();
        h.advance(LONG_TIME_INCREMENT);
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 0);
        h.set_frame_id(3);
        h.set_key_frame(false);
        h.set_reference_frame_id(0);
        h.insert_packet();
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 0);
        h.advance(LONG_TIME_INCREMENT);
        h.map.remove_old_frames(FrameId(3)); // Simulate 3 being rendered.
        h.builder.update_cast_message(h.now, &h.map);
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 3);
    }

    #[test]
    fn test_in_order_rps() {
        // Skip to the reference frame and don't look back.
        let mut h = Harness::new();
        h.set_frame_id(0);
        h.set_packet_id(0);
        h.set_max_packet_id(0);
        h.set_key_frame(true);
        h.insert_packet();
        h.advance(SHORT_TIME_INCREMENT);
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 0);
        h.set_frame_id(1);
        h.set_max_packet_id(1);
        h.set_key_frame(false);
        h.insert_packet();
        h.advance(SHORT_TIME_INCREMENT);
        assert!(!h.triggered());
        h.set_frame_id(3);
        h.set_packet_id(0);
        h.set_max_packet_id(0);
        h.set_reference_frame_id(0);
        h.insert_packet();
        h.advance(SHORT_TIME_INCREMENT);
        h.map.remove_old_frames(FrameId(3)); // Simulate 3 being rendered.
        h.advance(SHORT_TIME_INCREMENT);
        h.builder.update_cast_message(h.now, &h.map);
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 3);
        // Completing an old frame must not trigger a new ack.
        h.set_frame_id(1);
        h.set_packet_id(1);
        h.set_max_packet_id(1);
        h.header.cast.is_reference = false;
        h.insert_packet();
        h.advance(SHORT_TIME_INCREMENT);
        assert!(!h.triggered());
    }

    #[test]
    fn test_slow_down_ack() {
        let mut h = Harness::with_decoder(false, 3);
        h.set_frame_id(0);
        h.set_packet_id(0);
        h.set_max_packet_id(0);
        h.set_key_frame(true);
        h.insert_packet();

        h.advance(SHORT_TIME_INCREMENT);
        h.set_key_frame(false);
        for frame_id in 1u32..3 {
            assert!(h.triggered());
            assert_eq!(h.last_frame_acked(), frame_id - 1);
            h.set_frame_id(frame_id as u8);
            h.insert_packet();
            h.advance(SHORT_TIME_INCREMENT);
        }
        // Now in the slowdown state: the ack advances one every two frames.
        let mut expected_frame_id = 1u32;
        for frame_id in 3u32..10 {
            if frame_id % 2 != 0 {
                expected_frame_id += 1;
            }
            assert!(h.triggered());
            assert_eq!(h.last_frame_acked(), expected_frame_id);
            h.set_frame_id(frame_id as u8);
            h.insert_packet();
            h.advance(SHORT_TIME_INCREMENT);
        }
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), expected_frame_id);

        // Simulate frames being pulled for rendering.
        h.map.remove_old_frames(FrameId(10));
        // We should now leave the slowdown state.
        h.set_frame_id(11);
        h.insert_packet();
        h.advance(SHORT_TIME_INCREMENT);
        assert!(h.triggered());
        assert_eq!(h.last_frame_acked(), 11);
    }
}
