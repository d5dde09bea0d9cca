//! Local wall-clock time. The offset is looked up for each instant, so a
//! daylight-saving change takes effect on the next wake-up.

use chrono::TimeZone;
use time::{OffsetDateTime, UtcOffset};

pub trait LocalZone: Send + Sync + 'static {
    /// Offset from UTC in force at `utc`.
    fn offset_at(&self, utc: OffsetDateTime) -> UtcOffset;

    fn to_local(&self, utc: OffsetDateTime) -> OffsetDateTime {
        utc.to_offset(self.offset_at(utc))
    }
}

/// The host's time zone (`TZ`, else `/etc/localtime`).
pub struct SystemZone;

impl LocalZone for SystemZone {
    fn offset_at(&self, utc: OffsetDateTime) -> UtcOffset {
        let secs = chrono::Local
            .timestamp_opt(utc.unix_timestamp(), 0)
            .single()
            .map(|dt| dt.offset().local_minus_utc())
            .unwrap_or(0);
        UtcOffset::from_whole_seconds(secs).unwrap_or(UtcOffset::UTC)
    }
}
