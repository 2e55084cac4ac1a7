use std::time::{Duration, Instant};

use crate::rtcp_session::Rtcp;

/// Maps frame RTP timestamps to local playout instants.
///
/// Once an SR has provided the sender-clock mapping, the offset between the
/// first packet's arrival and its sender-side timestamp is locked in and
/// every frame plays out at `sender_ticks + offset + target_delay`. Until
/// then frames play as soon as their media position allows.
pub struct PlayoutEstimator {
    frequency: u32,
    target_delay: Duration,
    first_incoming_rtp_timestamp: u32,
    time_first_incoming_packet: Option<Instant>,
    /// Signed microseconds: first arrival minus first frame's sender time.
    time_offset_micros: Option<i64>,
}

impl PlayoutEstimator {
    pub fn new(frequency: u32, target_delay: Duration) -> Self {
        Self {
            frequency,
            target_delay,
            first_incoming_rtp_timestamp: 0,
            time_first_incoming_packet: None,
            time_offset_micros: None,
        }
    }

    /// Records the first packet's arrival; later packets are ignored.
    pub fn on_packet(&mut self, now: Instant, rtp_timestamp: u32) {
        if self.time_first_incoming_packet.is_none() {
            self.first_incoming_rtp_timestamp = rtp_timestamp;
            self.time_first_incoming_packet = Some(now);
        }
    }

    pub fn has_seen_packet(&self) -> bool {
        self.time_first_incoming_packet.is_some()
    }

    pub fn playout_time(&mut self, now: Instant, rtp_timestamp: u32, rtcp: &Rtcp) -> Instant {
        let first_arrival = match self.time_first_incoming_packet {
            Some(first_arrival) => first_arrival,
            None => return now,
        };

        if self.time_offset_micros.is_none() {
            match rtcp
                .rtp_timestamp_in_sender_time(self.frequency, self.first_incoming_rtp_timestamp)
            {
                Some(first_in_sender_ticks) => {
                    self.time_offset_micros = Some(signed_micros_between(
                        first_arrival,
                        first_in_sender_ticks,
                    ));
                }
                None => {
                    // No RTCP sync yet: play out as soon as possible.
                    let rtp_diff = rtp_timestamp.wrapping_sub(self.first_incoming_rtp_timestamp);
                    let frequency_khz = (self.frequency / 1000).max(1);
                    let rtp_time_diff =
                        Duration::from_millis((rtp_diff / frequency_khz) as u64);
                    let time_diff = now.duration_since(first_arrival);
                    return now + rtp_time_diff.saturating_sub(time_diff);
                }
            }
        }

        let offset = self.time_offset_micros.unwrap_or(0);
        match rtcp.rtp_timestamp_in_sender_time(self.frequency, rtp_timestamp) {
            Some(in_sender_ticks) => {
                apply_signed_micros(in_sender_ticks, offset) + self.target_delay
            }
            None => now,
        }
    }
}

fn signed_micros_between(a: Instant, b: Instant) -> i64 {
    if a >= b {
        a.duration_since(b).as_micros() as i64
    } else {
        -(b.duration_since(a).as_micros() as i64)
    }
}

fn apply_signed_micros(instant: Instant, micros: i64) -> Instant {
    if micros >= 0 {
        instant + Duration::from_micros(micros as u64)
    } else {
        instant - Duration::from_micros((-micros) as u64)
    }
}
