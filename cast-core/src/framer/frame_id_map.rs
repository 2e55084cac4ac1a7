use std::collections::BTreeMap;

use log::trace;
use rtp::header::RtpCastHeader;
use rtcp::types::PacketIdSet;
use shared::wrap::{FrameId, PacketId};

/// Per-frame packet bookkeeping: which packets are still missing.
pub struct FrameInfo {
    is_key_frame: bool,
    frame_id: FrameId,
    referenced_frame_id: FrameId,
    max_received_packet_id: PacketId,
    missing_packets: PacketIdSet,
}

impl FrameInfo {
    fn new(
        frame_id: FrameId,
        referenced_frame_id: FrameId,
        max_packet_id: PacketId,
        key_frame: bool,
    ) -> Self {
        let mut missing_packets = PacketIdSet::new();
        if max_packet_id.0 > 0 {
            for packet_id in 0..=max_packet_id.0 {
                missing_packets.insert(packet_id);
            }
        }
        Self {
            is_key_frame: key_frame,
            frame_id,
            referenced_frame_id,
            max_received_packet_id: PacketId(0),
            missing_packets,
        }
    }

    /// Returns true when the frame is complete after this insert.
    fn insert_packet(&mut self, packet_id: PacketId) -> bool {
        if packet_id.is_newer_than(self.max_received_packet_id) {
            self.max_received_packet_id = packet_id;
        }
        self.missing_packets.remove(&packet_id.0);
        self.missing_packets.is_empty()
    }

    pub fn complete(&self) -> bool {
        self.missing_packets.is_empty()
    }

    /// For the newest frame, missing packets are capped at the highest
    /// packet id actually received; later ones have had no chance to arrive.
    pub fn get_missing_packets(&self, newest_frame: bool) -> PacketIdSet {
        if newest_frame {
            self.missing_packets
                .range(..self.max_received_packet_id.0)
                .copied()
                .collect()
        } else {
            self.missing_packets.clone()
        }
    }

    pub fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn referenced_frame_id(&self) -> FrameId {
        self.referenced_frame_id
    }
}

/// Ordered map of pending frames plus the decode-ordering state: what has
/// been released, what is newest, and whether we still need a key frame.
pub struct FrameIdMap {
    frame_map: BTreeMap<FrameId, FrameInfo>,
    waiting_for_key: bool,
    last_released_frame: FrameId,
    newest_frame_id: FrameId,
}

impl Default for FrameIdMap {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameIdMap {
    pub fn new() -> Self {
        Self {
            frame_map: BTreeMap::new(),
            waiting_for_key: true,
            last_released_frame: FrameId::START,
            newest_frame_id: FrameId::START,
        }
    }

    /// Tracks the packet. `None` means the packet belongs to an already
    /// released frame and was rejected; otherwise the bool reports whether
    /// the frame became complete.
    pub fn insert_packet(&mut self, header: &RtpCastHeader) -> Option<bool> {
        let frame_id = header.cast.frame_id;
        let reference_frame_id = header.referenced_frame_id();

        if header.cast.is_key_frame && self.waiting_for_key {
            self.last_released_frame = frame_id.previous();
            self.waiting_for_key = false;
        }

        trace!(
            "insert frame:{} packet:{} max packet:{}",
            frame_id,
            header.cast.packet_id,
            header.cast.max_packet_id
        );

        if frame_id.is_older_or_equal(self.last_released_frame) && !self.waiting_for_key {
            return None;
        }

        if frame_id.is_newer_than(self.newest_frame_id) {
            self.newest_frame_id = frame_id;
        }

        let info = self.frame_map.entry(frame_id).or_insert_with(|| {
            FrameInfo::new(
                frame_id,
                reference_frame_id,
                header.cast.max_packet_id,
                header.cast.is_key_frame,
            )
        });
        Some(info.insert_packet(header.cast.packet_id))
    }

    /// Erases the frame and everything older, marking it released.
    pub fn remove_old_frames(&mut self, frame_id: FrameId) {
        self.frame_map
            .retain(|&id, _| id.is_newer_than(frame_id));
        self.last_released_frame = frame_id;
    }

    pub fn clear(&mut self) {
        self.frame_map.clear();
        self.waiting_for_key = true;
        self.last_released_frame = FrameId::START;
        self.newest_frame_id = FrameId::START;
    }

    pub fn newest_frame_id(&self) -> FrameId {
        self.newest_frame_id
    }

    pub fn last_released_frame(&self) -> FrameId {
        self.last_released_frame
    }

    pub fn is_empty(&self) -> bool {
        self.frame_map.is_empty()
    }

    pub fn frame_exists(&self, frame_id: FrameId) -> bool {
        self.frame_map.contains_key(&frame_id)
    }

    /// The next frame to release when playing strictly in order.
    pub fn next_continuous_frame(&self) -> Option<FrameId> {
        self.frame_map
            .values()
            .find(|info| info.complete() && self.continuous_frame(info))
            .map(|info| info.frame_id())
    }

    /// Walks forward from the last released frame over complete frames.
    pub fn last_continuous_frame(&self) -> FrameId {
        let mut last_continuous = self.last_released_frame;
        let mut next_expected = self.last_released_frame;
        loop {
            next_expected = next_expected.next();
            match self.frame_map.get(&next_expected) {
                Some(info) if info.complete() => last_continuous = next_expected,
                _ => break,
            }
            if next_expected == self.newest_frame_id {
                break;
            }
        }
        last_continuous
    }

    /// Audio may skip over missing frames: pick the oldest complete frame.
    pub fn next_audio_frame_allowing_missing_frames(&self) -> Option<FrameId> {
        if let Some(frame_id) = self.next_continuous_frame() {
            return Some(frame_id);
        }
        let mut best: Option<FrameId> = None;
        for info in self.frame_map.values() {
            if !info.complete() {
                continue;
            }
            best = match best {
                None => Some(info.frame_id()),
                Some(current) if info.frame_id().is_older_than(current) => Some(info.frame_id()),
                Some(current) => Some(current),
            };
        }
        best
    }

    /// Video may only skip to a frame whose reference is already released.
    pub fn next_video_frame_allowing_skipping_frames(&self) -> Option<FrameId> {
        let mut best: Option<FrameId> = None;
        for info in self.frame_map.values() {
            if info.complete() && self.decodable_video_frame(info) {
                best = Some(info.frame_id());
            }
        }
        best
    }

    pub fn number_of_complete_frames(&self) -> usize {
        self.frame_map.values().filter(|info| info.complete()).count()
    }

    pub fn get_missing_packets(&self, frame_id: FrameId, last_frame: bool) -> PacketIdSet {
        match self.frame_map.get(&frame_id) {
            Some(info) => info.get_missing_packets(last_frame),
            None => PacketIdSet::new(),
        }
    }

    fn continuous_frame(&self, info: &FrameInfo) -> bool {
        if self.waiting_for_key && !info.is_key_frame() {
            return false;
        }
        self.last_released_frame.next() == info.frame_id()
    }

    fn decodable_video_frame(&self, info: &FrameInfo) -> bool {
        if info.is_key_frame() {
            return true;
        }
        if self.waiting_for_key {
            return false;
        }
        info.referenced_frame_id()
            .is_older_or_equal(self.last_released_frame)
    }
}
