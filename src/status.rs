use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Lifecycle phase of an exam table. Only the cancellation override is ever
/// persisted; the other three phases are derived from the clock on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExamStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl ExamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExamStatus::Scheduled => "scheduled",
            ExamStatus::InProgress => "in_progress",
            ExamStatus::Completed => "completed",
            ExamStatus::Cancelled => "cancelled",
        }
    }
}

pub fn parse_exam_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

pub fn parse_time_of_day(s: &str) -> Option<NaiveTime> {
    let t = s.trim();
    NaiveTime::parse_from_str(t, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
        .ok()
}

/// Derive the lifecycle status for an exam from its stored fields and `now`.
///
/// The cancellation override is sticky and wins unconditionally. Otherwise
/// the stored date is combined with the start and end times-of-day into local
/// instants and compared against `now`, with `[start, end]` inclusive.
///
/// Both bounds resolve on the stored calendar date, so a window whose end
/// time-of-day precedes its start (an overnight span) reads `completed` as
/// soon as the start has passed. Kept as-is pending a decision on whether
/// overnight exams exist.
pub fn derive_status(
    cancelled: bool,
    date: &str,
    start_time: &str,
    end_time: &str,
    now: NaiveDateTime,
) -> ExamStatus {
    if cancelled {
        return ExamStatus::Cancelled;
    }

    let (Some(day), Some(start), Some(end)) = (
        parse_exam_date(date),
        parse_time_of_day(start_time),
        parse_time_of_day(end_time),
    ) else {
        // Unparseable time fields never reach the store through the create
        // path; fall back to the pre-window phase.
        return ExamStatus::Scheduled;
    };

    let start_at = day.and_time(start);
    let end_at = day.and_time(end);

    if now < start_at {
        ExamStatus::Scheduled
    } else if now <= end_at {
        ExamStatus::InProgress
    } else {
        ExamStatus::Completed
    }
}

/// Two-decimal rounding used for grade averages and statistics.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
