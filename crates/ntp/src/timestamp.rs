//! 64-bit NTP timestamps: seconds since 1900-01-01 UTC in the high word,
//! fraction of a second in 1/2^32 units in the low word.

use chrono::{DateTime, Utc};

use crate::NtpError;

/// Seconds between 1900-01-01 and 1970-01-01.
pub const NTP_UNIX_EPOCH_DELTA: i64 = 2_208_988_800;

const ERA_SECONDS: i64 = 1 << 32;
const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpTimestamp(u64);

impl NtpTimestamp {
    pub const fn from_bits(bits: u64) -> Self { Self(bits) }
    pub const fn to_bits(self) -> u64 { self.0 }
    pub const fn new(seconds: u32, fraction: u32) -> Self { Self(((seconds as u64) << 32) | fraction as u64) }
    pub const fn seconds(self) -> u32 { (self.0 >> 32) as u32 }
    pub const fn fraction(self) -> u32 { self.0 as u32 }

    /// Encode a UTC instant. Instants past 2036-02-07 wrap into era 1.
    pub fn from_datetime(t: DateTime<Utc>) -> Result<Self, NtpError> {
        let secs = t.timestamp() + NTP_UNIX_EPOCH_DELTA;
        if secs < 0 || secs >= 2 * ERA_SECONDS {
            return Err(NtpError::OutOfRange);
        }
        // leap-second representation may carry nanos >= 1e9
        let nanos = u64::from(t.timestamp_subsec_nanos()).min(NANOS_PER_SEC - 1);
        let fraction = ((nanos << 32) + NANOS_PER_SEC / 2) / NANOS_PER_SEC;
        Ok(Self::new(secs.rem_euclid(ERA_SECONDS) as u32, fraction as u32))
    }

    /// Decode to a UTC instant. Seconds with the top bit clear are read as
    /// era 1 (2036 onward), per RFC 4330 section 3.
    pub fn to_datetime(self) -> Result<DateTime<Utc>, NtpError> {
        let secs = i64::from(self.seconds());
        let ntp_secs = if self.seconds() & 0x8000_0000 == 0 { secs + ERA_SECONDS } else { secs };
        let nanos = (u64::from(self.fraction()) * NANOS_PER_SEC + (1 << 31)) >> 32;
        let nanos = nanos.min(NANOS_PER_SEC - 1) as u32;
        DateTime::from_timestamp(ntp_secs - NTP_UNIX_EPOCH_DELTA, nanos).ok_or(NtpError::OutOfRange)
    }
}
