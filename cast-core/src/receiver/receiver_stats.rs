use std::time::Instant;

use shared::wrap::SeqNum;

use crate::rtcp_session::ReceiverReportData;

const PACKETS_PER_ENTRY: usize = 64;
const BITMAP_ENTRIES: usize = 128;

/// Tracks RTP reception for one stream and produces the numbers that go
/// into outgoing report blocks: extended highest sequence number, fraction
/// and cumulative loss, and RFC 3550 interarrival jitter.
pub struct ReceiverStats {
    clock_rate: f64,

    /// Bitmap of received sequence numbers, 64 per entry.
    packets: [u64; BITMAP_ENTRIES],
    started: bool,
    seq_num_cycles: u16,
    last_seq_num: SeqNum,
    last_report_seq_num: SeqNum,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: Option<Instant>,
    jitter: f64,
    total_lost: u32,
}

impl ReceiverStats {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate: clock_rate as f64,
            packets: [0u64; BITMAP_ENTRIES],
            started: false,
            seq_num_cycles: 0,
            last_seq_num: SeqNum(0),
            last_report_seq_num: SeqNum(0),
            last_rtp_time_rtp: 0,
            last_rtp_time_time: None,
            jitter: 0.0,
            total_lost: 0,
        }
    }

    fn set_received(&mut self, seq: SeqNum) {
        let pos = (seq.0 as usize) % (BITMAP_ENTRIES * PACKETS_PER_ENTRY);
        self.packets[pos / PACKETS_PER_ENTRY] |= 1 << (pos % PACKETS_PER_ENTRY);
    }

    fn del_received(&mut self, seq: SeqNum) {
        let pos = (seq.0 as usize) % (BITMAP_ENTRIES * PACKETS_PER_ENTRY);
        self.packets[pos / PACKETS_PER_ENTRY] &= !(1u64 << (pos % PACKETS_PER_ENTRY));
    }

    fn get_received(&self, seq: SeqNum) -> bool {
        let pos = (seq.0 as usize) % (BITMAP_ENTRIES * PACKETS_PER_ENTRY);
        (self.packets[pos / PACKETS_PER_ENTRY] & (1 << (pos % PACKETS_PER_ENTRY))) != 0
    }

    pub fn process_rtp(&mut self, now: Instant, sequence_number: SeqNum, rtp_timestamp: u32) {
        if !self.started {
            self.started = true;
            self.set_received(sequence_number);
            self.last_seq_num = sequence_number;
            self.last_report_seq_num = SeqNum(sequence_number.0.wrapping_sub(1));
            self.last_rtp_time_rtp = rtp_timestamp;
            self.last_rtp_time_time = Some(now);
            return;
        }

        self.set_received(sequence_number);

        if sequence_number.is_newer_than(self.last_seq_num) {
            // Wrapped when the raw value went down while moving forward.
            if sequence_number.0 < self.last_seq_num.0 {
                self.seq_num_cycles = self.seq_num_cycles.wrapping_add(1);
            }
            // Positions in between may hold bits from a lap ago.
            let mut i = self.last_seq_num.next();
            while i != sequence_number {
                self.del_received(i);
                i = i.next();
            }
            self.last_seq_num = sequence_number;
        }

        // Interarrival jitter, RFC 3550 page 39.
        if let Some(last_time) = self.last_rtp_time_time {
            let d = now.duration_since(last_time).as_secs_f64() * self.clock_rate
                - (rtp_timestamp.wrapping_sub(self.last_rtp_time_rtp) as i32 as f64);
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }
        self.last_rtp_time_rtp = rtp_timestamp;
        self.last_rtp_time_time = Some(now);
    }

    /// Snapshot for the next report block; resets the per-report window.
    pub fn generate_report(&mut self) -> ReceiverReportData {
        let total_since_report = self.last_seq_num.0.wrapping_sub(self.last_report_seq_num.0);
        let mut lost_since_report = 0u32;
        if self.last_seq_num != self.last_report_seq_num {
            let mut i = self.last_report_seq_num.next();
            while i != self.last_seq_num {
                if !self.get_received(i) {
                    lost_since_report += 1;
                }
                i = i.next();
            }
        }

        self.total_lost = (self.total_lost + lost_since_report).min(0x00ff_ffff);
        let lost_since_report = lost_since_report.min(0x00ff_ffff);

        let fraction_lost = if total_since_report > 0 {
            ((lost_since_report * 256) as f64 / total_since_report as f64) as u8
        } else {
            0
        };

        let report = ReceiverReportData {
            fraction_lost,
            cumulative_lost: self.total_lost,
            extended_high_sequence_number: ((self.seq_num_cycles as u32) << 16)
                | self.last_seq_num.0 as u32,
            jitter: self.jitter as u32,
        };
        self.last_report_seq_num = self.last_seq_num;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_no_loss() {
        let mut stats = ReceiverStats::new(90000);
        let now = Instant::now();
        for seq in 0..10u16 {
            stats.process_rtp(now, SeqNum(seq), seq as u32 * 3000);
        }
        let report = stats.generate_report();
        assert_eq!(report.fraction_lost, 0);
        assert_eq!(report.cumulative_lost, 0);
        assert_eq!(report.extended_high_sequence_number, 9);
    }

    #[test]
    fn test_loss_counts() {
        let mut stats = ReceiverStats::new(90000);
        let now = Instant::now();
        // 0..8 with 3 and 5 missing.
        for seq in [0u16, 1, 2, 4, 6, 7, 8] {
            stats.process_rtp(now, SeqNum(seq), 0);
        }
        let report = stats.generate_report();
        assert_eq!(report.cumulative_lost, 2);
        // 2 lost of 9 expected.
        assert_eq!(report.fraction_lost, (2 * 256 / 9) as u8);

        // Late arrival of 3 and 5: no further loss this window.
        stats.process_rtp(now, SeqNum(3), 0);
        stats.process_rtp(now, SeqNum(5), 0);
        stats.process_rtp(now, SeqNum(9), 0);
        let report = stats.generate_report();
        assert_eq!(report.fraction_lost, 0);
        assert_eq!(report.cumulative_lost, 2);
        assert_eq!(report.extended_high_sequence_number, 9);
    }

    #[test]
    fn test_sequence_wrap_bumps_cycles() {
        let mut stats = ReceiverStats::new(90000);
        let now = Instant::now();
        stats.process_rtp(now, SeqNum(65534), 0);
        stats.process_rtp(now, SeqNum(65535), 0);
        stats.process_rtp(now, SeqNum(0), 0);
        let report = stats.generate_report();
        assert_eq!(report.extended_high_sequence_number, 1 << 16);
    }

    #[test]
    fn test_jitter_accumulates_on_irregular_arrival() {
        let mut stats = ReceiverStats::new(90000);
        let mut now = Instant::now();
        let mut rtp = 0u32;
        // Frames 33 ms apart on the RTP clock, arriving with 10 ms of extra
        // spread every other packet.
        for i in 0..20 {
            stats.process_rtp(now, SeqNum(i), rtp);
            rtp += 2970;
            now += Duration::from_millis(if i % 2 == 0 { 43 } else { 23 });
        }
        let report = stats.generate_report();
        assert!(report.jitter > 0);
    }
}
