use serde_derive::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use time::format_description::{well_known::Rfc3339, FormatItem};
use time::{macros::format_description, OffsetDateTime, UtcOffset};

/// Wall-clock time as fractional seconds since the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochSeconds(f64);

impl EpochSeconds {
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self(since_epoch.as_secs_f64())
    }

    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }

    /// Seconds elapsed from `earlier` to `self`, clamped at zero.
    pub fn since(self, earlier: EpochSeconds) -> f64 {
        (self.0 - earlier.0).max(0.0)
    }

    fn to_local(self) -> OffsetDateTime {
        let nanos = (self.0 * 1e9) as i128;
        let utc = OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
        utc.to_offset(offset)
    }

    /// `2023-05-04 13:02:01,123`, the prefix used in per-test logs.
    pub fn format_log(self) -> String {
        const FORMAT: &[FormatItem<'_>] = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second],[subsecond digits:3]"
        );
        self.to_local().format(FORMAT).unwrap_or_default()
    }

    /// `2023-05-04T13.02-01`, used in job directory names.
    pub fn format_job_dir(self) -> String {
        const FORMAT: &[FormatItem<'_>] =
            format_description!("[year]-[month]-[day]T[hour].[minute]-[second]");
        self.to_local().format(FORMAT).unwrap_or_default()
    }

    /// ISO-8601 with seconds precision, e.g. `2023-05-04T13:02:01`.
    pub fn format_iso(self) -> String {
        const FORMAT: &[FormatItem<'_>] =
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
        self.to_local().format(FORMAT).unwrap_or_default()
    }

    /// RFC 3339 in UTC, e.g. `2023-11-14T22:13:20Z`.
    pub fn format_rfc3339_utc(self) -> String {
        let nanos = (self.0 * 1e9) as i128;
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
            .format(&Rfc3339)
            .unwrap_or_default()
    }
}

/// Formats a number of seconds as `HH:MM:SS`.
pub fn format_hms(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (hours, rest) = (total / 3600, total % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
