use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Offset in seconds between the Unix epoch (1970) and the NTP epoch (1900).
pub const NTP_UNIX_EPOCH_DELTA_SECONDS: u64 = 0x83AA_7E80;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// A 64-bit NTP timestamp: whole seconds since 1900-01-01 UTC in the upper
/// half, fractions of a second (unit 2^-32 s) in the lower half.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub fn new(seconds: u32, fraction: u32) -> Self {
        Self { seconds, fraction }
    }

    pub fn as_u64(&self) -> u64 {
        ((self.seconds as u64) << 32) | self.fraction as u64
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            seconds: (v >> 32) as u32,
            fraction: v as u32,
        }
    }

    /// The middle 32 bits, as echoed in report blocks (`last_sr`) and DLRR
    /// sub-blocks (`last_rr`).
    pub fn middle_32(&self) -> u32 {
        to_ntp_diff(self.seconds, self.fraction)
    }
}

/// Pack seconds and 2^-32 fractions into 16.16 fixed point. 0x8000_0000
/// fractions is half a second.
pub fn to_ntp_diff(delay_seconds: u32, delay_fraction: u32) -> u32 {
    ((delay_seconds & 0x0000_ffff) << 16) + ((delay_fraction & 0xffff_0000) >> 16)
}

/// Unpack a 16.16 fixed point delay into a `Duration`.
pub fn from_ntp_diff(ntp_delay: u32) -> Duration {
    let seconds = (ntp_delay >> 16) as u64;
    let micros = ((ntp_delay & 0x0000_ffff) as u64 * MICROS_PER_SECOND) >> 16;
    Duration::from_secs(seconds) + Duration::from_micros(micros)
}

/// Pack a `Duration` into 16.16 fixed point, the unit of
/// `delay_since_last_sr` / `delay_since_last_rr`.
pub fn duration_to_ntp_diff(delay: Duration) -> u32 {
    let seconds = delay.as_secs() as u32;
    let fraction16 = ((delay.subsec_micros() as u64) << 16) / MICROS_PER_SECOND;
    ((seconds & 0x0000_ffff) << 16) + fraction16 as u32
}

fn micros_to_ntp(micros: u64) -> NtpTimestamp {
    let seconds = micros / MICROS_PER_SECOND;
    let rem = micros % MICROS_PER_SECOND;
    NtpTimestamp {
        seconds: seconds as u32,
        fraction: ((rem << 32) / MICROS_PER_SECOND) as u32,
    }
}

fn ntp_to_micros(ntp: NtpTimestamp) -> u64 {
    // Rounded division so that micros -> fraction -> micros is exact.
    let rem = ((ntp.fraction as u64) * MICROS_PER_SECOND + (1 << 31)) >> 32;
    ntp.seconds as u64 * MICROS_PER_SECOND + rem
}

/// Pins a monotonic `Instant` to the NTP timeline so that any other
/// `Instant` can be expressed as wall-clock NTP time, and vice versa.
///
/// Production code uses [`NtpAnchor::now`]; tests build fixed anchors with
/// [`NtpAnchor::from_parts`] for determinism.
#[derive(Debug, Clone, Copy)]
pub struct NtpAnchor {
    instant: Instant,
    since_ntp_epoch: Duration,
}

impl NtpAnchor {
    pub fn now() -> Self {
        let since_unix_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Self {
            instant: Instant::now(),
            since_ntp_epoch: since_unix_epoch
                + Duration::from_secs(NTP_UNIX_EPOCH_DELTA_SECONDS),
        }
    }

    pub fn from_parts(instant: Instant, since_ntp_epoch: Duration) -> Self {
        Self {
            instant,
            since_ntp_epoch,
        }
    }

    pub fn ntp(&self, at: Instant) -> NtpTimestamp {
        let base = self.since_ntp_epoch.as_micros() as u64;
        let micros = if at >= self.instant {
            base + at.duration_since(self.instant).as_micros() as u64
        } else {
            base - self.instant.duration_since(at).as_micros() as u64
        };
        micros_to_ntp(micros)
    }

    pub fn instant(&self, ntp: NtpTimestamp) -> Instant {
        let base = self.since_ntp_epoch.as_micros() as u64;
        let target = ntp_to_micros(ntp);
        if target >= base {
            self.instant + Duration::from_micros(target - base)
        } else {
            self.instant - Duration::from_micros(base - target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor() -> NtpAnchor {
        NtpAnchor::from_parts(
            Instant::now(),
            Duration::from_secs(NTP_UNIX_EPOCH_DELTA_SECONDS) + Duration::from_secs(1_234_567),
        )
    }

    #[test]
    fn test_ntp_round_trip_is_microsecond_exact() {
        let anchor = anchor();
        for offset_us in [0u64, 1, 999, 1_000, 901_000, 999_999, 5_000_001, 86_400_000_123] {
            let at = anchor.instant + Duration::from_micros(offset_us);
            let ntp = anchor.ntp(at);
            assert_eq!(anchor.instant(ntp), at, "offset {offset_us}us");
        }
    }

    #[test]
    fn test_ntp_seconds_value() {
        let base = Instant::now();
        let anchor = NtpAnchor::from_parts(base, Duration::from_micros(12_345_678_901_000));
        let ntp = anchor.ntp(base);
        assert_eq!(ntp.seconds, 12_345_678);
        assert_eq!(anchor.instant(ntp), base);
    }

    #[test]
    fn test_ntp_before_anchor() {
        let base = Instant::now();
        let anchor = NtpAnchor::from_parts(base, Duration::from_secs(1_000_000));
        let at = base - Duration::from_millis(1500);
        let ntp = anchor.ntp(at);
        assert_eq!(anchor.instant(ntp), at);
    }

    #[test]
    fn test_ntp_diff_round_trip() {
        for delay in [
            Duration::from_millis(0),
            Duration::from_millis(1),
            Duration::from_millis(123),
            Duration::from_millis(500),
            Duration::from_millis(12_345),
        ] {
            let diff = duration_to_ntp_diff(delay);
            let back = from_ntp_diff(diff);
            let err = if back > delay { back - delay } else { delay - back };
            assert!(err < Duration::from_micros(20), "delay {delay:?} err {err:?}");
        }
    }

    #[test]
    fn test_to_ntp_diff_half_second() {
        // 0x80000000 fractions is half a second.
        assert_eq!(to_ntp_diff(0, 0x8000_0000), 0x0000_8000);
        assert_eq!(from_ntp_diff(0x0000_8000), Duration::from_millis(500));
        assert_eq!(to_ntp_diff(3, 0), 0x0003_0000);
    }

    #[test]
    fn test_middle_32() {
        let ntp = NtpTimestamp::new(0x1234_5678, 0x9abc_def0);
        assert_eq!(ntp.middle_32(), 0x5678_9abc);
        assert_eq!(NtpTimestamp::from_u64(ntp.as_u64()), ntp);
    }
}
