use chrono::{Duration, Utc};
use chrono_tz::Tz;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_in(zone: Tz) -> Timestamp {
    Utc::now().with_timezone(&zone)
}

/// Reject empty or inverted spans and spans wider than `max_days`.
pub(crate) fn validate_span(span: &Span, max_days: i64) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInput(format!(
            "span must end after it starts ({} >= {})",
            span.start, span.end
        )));
    }
    if span.duration() > Duration::days(max_days) {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Inside the interviewer's write lock: the slot must not overlap any
/// exclusion that landed since availability was computed.
pub(crate) fn check_no_overlap(rs: &InterviewerState, span: &Span) -> Result<(), EngineError> {
    match rs.overlapping(span).next() {
        Some(existing) => Err(EngineError::ReservationConflict(existing.id)),
        None => Ok(()),
    }
}
