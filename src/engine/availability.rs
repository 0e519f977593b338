use chrono::Duration;

use crate::model::*;

use super::exclusions::collect_exclusions;
use super::template::expand_weekly_rules;

// ── Availability Algorithm ────────────────────────────────────────

/// Free blocks of one interviewer over `range`: the expanded weekly template
/// minus every overlapping blackout and interview. Blocks shorter than
/// `min_block` are dropped.
pub fn free_blocks(interviewer: &InterviewerState, range: &Span, min_block: Duration) -> Vec<Span> {
    let free = expand_weekly_rules(&interviewer.rules, range, min_block);
    if free.is_empty() {
        return free;
    }
    let exclusions = collect_exclusions(interviewer, range);
    subtract_exclusions(free, &exclusions, min_block)
}

/// Single sweep over start-sorted `free` blocks and start-sorted `exclusions`.
///
/// The cursor only moves forward. A block whose start is pushed past an
/// exclusion stays under the cursor, so later exclusions still apply to it.
pub fn subtract_exclusions(mut free: Vec<Span>, exclusions: &[Span], min_block: Duration) -> Vec<Span> {
    let mut i = 0;
    for cut in exclusions {
        debug_assert!(cut.start <= cut.end);
        while i < free.len() && free[i].end <= cut.start {
            i += 1;
        }
        while i < free.len() && free[i].start < cut.end {
            let block = free[i];
            if cut.start <= block.start && block.end <= cut.end {
                free.remove(i);
                continue;
            }
            if block.start < cut.start {
                free[i].end = cut.start;
                if block.end > cut.end {
                    free.insert(i + 1, Span::new(cut.end, block.end));
                }
                i += 1;
            } else {
                free[i].start = cut.end;
            }
        }
    }
    free.retain(|b| b.duration() >= min_block);
    free
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}
