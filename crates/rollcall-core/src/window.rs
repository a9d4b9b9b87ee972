//! Duplicate-window policy for attendance suppression.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};

/// Time span within which a second event for the same identity is suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateWindow {
    /// Same calendar date, evaluated in a fixed UTC offset.
    CalendarDay { utc_offset: FixedOffset },
    /// Absolute difference strictly below the given span.
    Rolling(Duration),
    /// Never suppress.
    Disabled,
}

impl Default for DuplicateWindow {
    fn default() -> Self {
        Self::CalendarDay {
            utc_offset: Utc.fix(),
        }
    }
}

impl DuplicateWindow {
    /// Whether `a` and `b` fall inside one window. Symmetric in its arguments.
    pub fn covers(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        match self {
            Self::CalendarDay { utc_offset } => {
                let day = |t: DateTime<Utc>| t.with_timezone(utc_offset).date_naive();
                day(a) == day(b)
            }
            Self::Rolling(span) => (a - b).abs() < *span,
            Self::Disabled => false,
        }
    }

    /// Half-open range `[start, end)` of instants that `covers` pairs with
    /// `ts`, at microsecond resolution. `None` when nothing is covered.
    pub fn bounds(&self, ts: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match self {
            Self::CalendarDay { utc_offset } => {
                let shift = Duration::seconds(i64::from(utc_offset.local_minus_utc()));
                let midnight = ts.with_timezone(utc_offset).date_naive().and_time(NaiveTime::MIN);
                let start = Utc.from_utc_datetime(&midnight) - shift;
                Some((start, start + Duration::days(1)))
            }
            Self::Rolling(span) => {
                let start = ts
                    .checked_sub_signed(*span - Duration::microseconds(1))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                let end = ts.checked_add_signed(*span).unwrap_or(DateTime::<Utc>::MAX_UTC);
                Some((start, end))
            }
            Self::Disabled => None,
        }
    }

    /// Short name used in status output and configuration.
    pub fn describe(&self) -> String {
        match self {
            Self::CalendarDay { utc_offset } => format!("calendar-day ({utc_offset})"),
            Self::Rolling(span) => format!("rolling ({}m)", span.num_minutes()),
            Self::Disabled => "disabled".to_string(),
        }
    }
}
