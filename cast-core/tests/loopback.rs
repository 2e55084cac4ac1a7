//! Sender/receiver loopback over a mock pacer: packetize, lose packets,
//! observe NACK feedback, resend, and check frame release order and timing.

use std::time::{Duration, Instant};

use bytes::Bytes;
use cast_core::config::{
    AudioReceiverConfig, AudioSenderConfig, EncodedAudioFrame, EncodedVideoFrame,
    VideoReceiverConfig, VideoSenderConfig,
};
use cast_core::sender::SenderEvent;
use cast_core::{CastReceiver, CastSender, PacedPacketSender};
use shared::wrap::FrameId;

const SENDER_SSRC: u32 = 11;
const FEEDBACK_SSRC: u32 = 12;

#[derive(Default)]
struct MockTransport {
    packets: Vec<Bytes>,
    rtcp: Vec<Bytes>,
}

impl MockTransport {
    fn take_packets(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.packets)
    }

    fn take_rtcp(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.rtcp)
    }
}

impl PacedPacketSender for MockTransport {
    fn send_packets(&mut self, mut packets: Vec<Bytes>) {
        self.packets.append(&mut packets);
    }
    fn resend_packets(&mut self, mut packets: Vec<Bytes>) {
        self.packets.append(&mut packets);
    }
    fn send_rtcp_packet(&mut self, packet: Bytes) {
        self.rtcp.push(packet);
    }
}

fn video_pair() -> (CastSender, CastReceiver) {
    let sender = CastSender::new_video(&VideoSenderConfig {
        sender_ssrc: SENDER_SSRC,
        incoming_feedback_ssrc: FEEDBACK_SSRC,
        ..Default::default()
    })
    .unwrap();
    let receiver = CastReceiver::new_video(&VideoReceiverConfig {
        feedback_ssrc: FEEDBACK_SSRC,
        incoming_ssrc: SENDER_SSRC,
        ..Default::default()
    })
    .unwrap();
    (sender, receiver)
}

fn video_frame(frame_id: u8, key_frame: bool, len: usize) -> EncodedVideoFrame {
    EncodedVideoFrame {
        key_frame,
        frame_id: FrameId(frame_id),
        last_referenced_frame_id: FrameId(frame_id).previous(),
        data: Bytes::from(vec![frame_id ^ 0x5a; len]),
        ..Default::default()
    }
}

#[test]
fn test_key_frame_round_trip() {
    let (mut sender, mut receiver) = video_pair();
    let mut wire = MockTransport::default();
    let now = Instant::now();

    let frame = video_frame(0, true, 5000);
    sender.insert_coded_video_frame(&frame, now, &mut wire);
    let packets = wire.take_packets();
    assert!(packets.len() > 1);

    receiver.get_encoded_frame(now, &mut wire);
    for packet in &packets {
        receiver.handle_packet(now, packet, &mut wire);
    }

    let (released, _playout) = receiver.poll_frame().expect("frame should be released");
    assert_eq!(released.frame_id, FrameId(0));
    assert!(released.key_frame);
    assert_eq!(released.data, frame.data);

    // Completing the frame produced ACK feedback on the wire.
    let feedback = wire.take_rtcp();
    assert!(!feedback.is_empty());
    sender.handle_packet(now, &feedback[0], &mut wire);
    assert_eq!(
        sender.poll_event(),
        Some(SenderEvent::AckReceived(FrameId(0)))
    );
}

#[test]
fn test_delta_before_key_is_never_released() {
    let (mut sender, mut receiver) = video_pair();
    let mut wire = MockTransport::default();
    let now = Instant::now();

    sender.insert_coded_video_frame(&video_frame(0, false, 100), now, &mut wire);
    receiver.get_encoded_frame(now, &mut wire);
    for packet in wire.take_packets() {
        receiver.handle_packet(now, &packet, &mut wire);
    }
    assert!(receiver.poll_frame().is_none());

    // The key frame unblocks delivery.
    sender.insert_coded_video_frame(&video_frame(1, true, 100), now, &mut wire);
    for packet in wire.take_packets() {
        receiver.handle_packet(now, &packet, &mut wire);
    }
    let (released, _) = receiver.poll_frame().unwrap();
    assert_eq!(released.frame_id, FrameId(1));
}

#[test]
fn test_lost_packet_is_nacked_and_resent() {
    let (mut sender, mut receiver) = video_pair();
    let mut wire = MockTransport::default();
    let mut now = Instant::now();

    // Frame 0 arrives whole.
    sender.insert_coded_video_frame(&video_frame(0, true, 100), now, &mut wire);
    receiver.get_encoded_frame(now, &mut wire);
    for packet in wire.take_packets() {
        receiver.handle_packet(now, &packet, &mut wire);
    }
    assert!(receiver.poll_frame().is_some());
    wire.take_rtcp();

    // Frame 1 loses its first packet.
    let frame = video_frame(1, false, 5000);
    sender.insert_coded_video_frame(&frame, now, &mut wire);
    let packets = wire.take_packets();
    assert!(packets.len() >= 3);
    receiver.get_encoded_frame(now, &mut wire);
    for packet in &packets[1..] {
        receiver.handle_packet(now, packet, &mut wire);
    }
    assert!(receiver.poll_frame().is_none());

    // The cast-message timer fires and NACKs the missing packet.
    now += Duration::from_millis(40);
    receiver.handle_timeout(now, &mut wire);
    let feedback = wire.take_rtcp();
    assert!(!feedback.is_empty());

    // The sender answers from storage.
    for datagram in &feedback {
        sender.handle_packet(now, datagram, &mut wire);
    }
    let resent = wire.take_packets();
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0], packets[0]);

    // The retransmission completes the frame.
    receiver.handle_packet(now, &resent[0], &mut wire);
    let (released, _) = receiver.poll_frame().unwrap();
    assert_eq!(released.frame_id, FrameId(1));
    assert_eq!(released.data, frame.data);
}

#[test]
fn test_receiver_poll_timeout_tracks_cast_message_interval() {
    let (mut sender, mut receiver) = video_pair();
    let mut wire = MockTransport::default();
    let now = Instant::now();

    assert!(receiver.poll_timeout(now).is_none());

    sender.insert_coded_video_frame(&video_frame(0, true, 100), now, &mut wire);
    for packet in wire.take_packets() {
        receiver.handle_packet(now, &packet, &mut wire);
    }
    let wakeup = receiver.poll_timeout(now).unwrap();
    assert!(wakeup >= now + Duration::from_millis(1));
    assert!(wakeup <= now + Duration::from_millis(750));
}

#[test]
fn test_encrypted_stream_round_trip() {
    let key = b"0123456789abcdef".to_vec();
    let mask = b"fedcba9876543210".to_vec();
    let mut sender = CastSender::new_audio(&AudioSenderConfig {
        sender_ssrc: SENDER_SSRC,
        incoming_feedback_ssrc: FEEDBACK_SSRC,
        aes_key: key.clone(),
        aes_iv_mask: mask.clone(),
        ..Default::default()
    })
    .unwrap();
    let mut receiver = CastReceiver::new_audio(&AudioReceiverConfig {
        feedback_ssrc: FEEDBACK_SSRC,
        incoming_ssrc: SENDER_SSRC,
        aes_key: key,
        aes_iv_mask: mask,
        ..Default::default()
    })
    .unwrap();
    let mut wire = MockTransport::default();
    let now = Instant::now();

    let frame = EncodedAudioFrame {
        frame_id: FrameId(0),
        samples: 480,
        data: Bytes::from_static(b"ten milliseconds of opus"),
        ..Default::default()
    };
    sender.insert_coded_audio_frame(now, &frame, &mut wire);
    receiver.get_encoded_frame(now, &mut wire);
    for packet in wire.take_packets() {
        receiver.handle_packet(now, &packet, &mut wire);
    }
    let (released, _) = receiver.poll_frame().unwrap();
    assert_eq!(released.data, frame.data);
}

#[test]
fn test_audio_skips_lost_frame() {
    // Audio side: a fully lost frame is skipped once the next one lands.
    let mut sender = CastSender::new_audio(&AudioSenderConfig {
        sender_ssrc: SENDER_SSRC,
        incoming_feedback_ssrc: FEEDBACK_SSRC,
        ..Default::default()
    })
    .unwrap();
    let mut receiver = CastReceiver::new_audio(&AudioReceiverConfig {
        feedback_ssrc: FEEDBACK_SSRC,
        incoming_ssrc: SENDER_SSRC,
        rtp_max_delay_ms: 0,
        ..Default::default()
    })
    .unwrap();
    let mut wire = MockTransport::default();
    let now = Instant::now();

    let make = |frame_id: u8| EncodedAudioFrame {
        frame_id: FrameId(frame_id),
        samples: 480,
        data: Bytes::from(vec![frame_id; 32]),
        ..Default::default()
    };

    sender.insert_coded_audio_frame(now, &make(0), &mut wire);
    let frame0 = wire.take_packets();
    sender.insert_coded_audio_frame(now, &make(1), &mut wire);
    let _lost = wire.take_packets();
    sender.insert_coded_audio_frame(now, &make(2), &mut wire);
    let frame2 = wire.take_packets();

    receiver.get_encoded_frame(now, &mut wire);
    for packet in frame0 {
        receiver.handle_packet(now, &packet, &mut wire);
    }
    assert_eq!(receiver.poll_frame().unwrap().0.frame_id, FrameId(0));

    receiver.get_encoded_frame(now, &mut wire);
    for packet in frame2 {
        receiver.handle_packet(now, &packet, &mut wire);
    }
    // Frame 2 is not continuous but audio may skip; with a zero target
    // delay its playout deadline has long passed.
    let (released, _) = receiver.poll_frame().unwrap();
    assert_eq!(released.frame_id, FrameId(2));
}

#[test]
fn test_rtt_measured_over_report_exchange() {
    let (mut sender, mut receiver) = video_pair();
    let mut wire = MockTransport::default();
    let t0 = Instant::now();

    // The receiver must have media state before it reports.
    sender.insert_coded_video_frame(&video_frame(0, true, 100), t0, &mut wire);
    let media = wire.take_packets();

    // SR travels 50 ms.
    sender.send_rtcp_report(t0, &mut wire);
    let sr = wire.take_rtcp().remove(0);
    let t1 = t0 + Duration::from_millis(50);
    receiver.handle_packet(t1, &sr, &mut wire);
    receiver.get_encoded_frame(t1, &mut wire);
    for packet in &media {
        receiver.handle_packet(t1, packet, &mut wire);
    }

    // The completion feedback (RR + report block) travels another 50 ms.
    let feedback = wire.take_rtcp();
    assert!(!feedback.is_empty());
    let t2 = t1 + Duration::from_millis(50);
    sender.handle_packet(t2, &feedback[0], &mut wire);

    let stats = sender.rtt().expect("rtt should be measured");
    let rtt_ms = stats.rtt.as_millis();
    assert!((99..=101).contains(&rtt_ms), "rtt {rtt_ms} ms");
}

#[test]
fn test_non_continuous_frame_waits_for_playout_budget() {
    let (mut sender, mut receiver) = video_pair();
    let mut wire = MockTransport::default();
    let now = Instant::now();

    // Frame 0 released; frame 1 lost; frame 2 (keyed) complete.
    sender.insert_coded_video_frame(&video_frame(0, true, 100), now, &mut wire);
    let frame0 = wire.take_packets();
    sender.insert_coded_video_frame(
        &video_frame(1, false, 100),
        now + Duration::from_millis(33),
        &mut wire,
    );
    let _lost = wire.take_packets();
    sender.insert_coded_video_frame(
        &video_frame(2, true, 100),
        now + Duration::from_millis(66),
        &mut wire,
    );
    let frame2 = wire.take_packets();

    receiver.get_encoded_frame(now, &mut wire);
    for packet in frame0 {
        receiver.handle_packet(now, &packet, &mut wire);
    }
    assert!(receiver.poll_frame().is_some());

    receiver.get_encoded_frame(now, &mut wire);
    for packet in frame2 {
        receiver.handle_packet(now + Duration::from_millis(5), &packet, &mut wire);
    }
    // Frame 2 is decodable (key) but not continuous, and its media
    // position is ~60 ms beyond the wait budget: deferred.
    assert!(receiver.poll_frame().is_none());
    let wakeup = receiver.poll_timeout(now + Duration::from_millis(5)).unwrap();

    // Once the deferral expires the frame comes out.
    let later = wakeup.max(now + Duration::from_millis(200));
    receiver.handle_timeout(later, &mut wire);
    let (released, _) = receiver.poll_frame().unwrap();
    assert_eq!(released.frame_id, FrameId(2));
}
