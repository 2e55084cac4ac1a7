use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtcp::types::{MissingFramesAndPackets, CAST_ALL_PACKETS_LOST};
use shared::wrap::{FrameId, PacketId};

/// Upper bound on retained packets, independent of the history window.
const MAX_STORED_PACKETS: usize = 1000;

/// Sender-side retransmission store: the last `history` worth of packets,
/// retrievable bit-exact by `(frame id, packet id)`. Eviction is FIFO.
pub struct PacketStorage {
    history: Duration,
    packets: BTreeMap<(u8, u16), Bytes>,
    order: VecDeque<(Instant, (u8, u16))>,
}

impl PacketStorage {
    pub fn new(history: Duration) -> Self {
        Self {
            history,
            packets: BTreeMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn store_packet(
        &mut self,
        now: Instant,
        frame_id: FrameId,
        packet_id: PacketId,
        packet: Bytes,
    ) {
        self.cleanup(now);
        let key = (frame_id.0, packet_id.0);
        self.packets.insert(key, packet);
        self.order.push_back((now, key));
    }

    pub fn get_packet(&self, frame_id: FrameId, packet_id: PacketId) -> Option<Bytes> {
        self.packets.get(&(frame_id.0, packet_id.0)).cloned()
    }

    /// Collects the requested packets; the whole-frame sentinel expands to
    /// every stored packet of that frame. The flag reports whether any
    /// requested frame was missing from storage entirely.
    pub fn get_packets(&self, missing: &MissingFramesAndPackets) -> (Vec<Bytes>, bool) {
        let mut packets = Vec::new();
        let mut any_frame_evicted = false;
        for (&frame_id, packet_ids) in missing {
            let whole_frame = packet_ids.len() == 1 && packet_ids.contains(&CAST_ALL_PACKETS_LOST);
            if whole_frame || packet_ids.is_empty() {
                let mut found = false;
                for (_, packet) in self
                    .packets
                    .range((frame_id, 0)..=(frame_id, u16::MAX))
                {
                    packets.push(packet.clone());
                    found = true;
                }
                if !found {
                    any_frame_evicted = true;
                }
            } else {
                let mut found_any = false;
                for &packet_id in packet_ids {
                    match self.packets.get(&(frame_id, packet_id)) {
                        Some(packet) => {
                            packets.push(packet.clone());
                            found_any = true;
                        }
                        None => {}
                    }
                }
                if !found_any {
                    any_frame_evicted = true;
                }
            }
        }
        (packets, any_frame_evicted)
    }

    fn cleanup(&mut self, now: Instant) {
        while let Some(&(stored, key)) = self.order.front() {
            let expired = now.duration_since(stored) > self.history;
            if expired || self.order.len() >= MAX_STORED_PACKETS {
                self.packets.remove(&key);
                self.order.pop_front();
            } else {
                break;
            }
        }
    }
}
