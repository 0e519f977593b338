use crate::model::*;

/// Blackouts and booked interviews overlapping `range`, ascending by start.
/// Spans are returned as stored: neither clipped nor merged.
pub fn collect_exclusions(interviewer: &InterviewerState, range: &Span) -> Vec<Span> {
    // `exclusions` is kept start-sorted, so the overlap scan already yields order.
    interviewer.overlapping(range).map(|e| e.span).collect()
}
