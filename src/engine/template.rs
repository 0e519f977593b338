use chrono::{Datelike, Duration, NaiveDateTime, TimeZone};
use chrono_tz::Tz;

use crate::model::*;

/// Resolve a local wall-clock time in `zone`. Ambiguous times (clocks turned
/// back) take the earliest instant; times inside a gap move forward one hour.
pub(crate) fn resolve_local(zone: Tz, naive: NaiveDateTime) -> Option<Timestamp> {
    zone.from_local_datetime(&naive)
        .earliest()
        .or_else(|| zone.from_local_datetime(&(naive + Duration::hours(1))).earliest())
}

/// Expand weekly rules into concrete spans over `range`, in the zone of
/// `range.start`. Output is sorted, merged, and free of blocks shorter
/// than `min_block`.
pub fn expand_weekly_rules(rules: &[WeeklyRule], range: &Span, min_block: Duration) -> Vec<Span> {
    let mut blocks: Vec<Span> = Vec::new();
    if rules.is_empty() || range.is_empty() {
        return blocks;
    }
    let zone = range.start.timezone();
    let last_day = range.end.date_naive();
    let mut day = range.start.date_naive();

    while day <= last_day {
        let mut todays: Vec<&WeeklyRule> = rules.iter().filter(|r| r.weekday == day.weekday()).collect();
        todays.sort_by_key(|r| (r.start, r.end));

        for rule in todays {
            let Some(start) = resolve_local(zone, day.and_time(rule.start)) else {
                continue;
            };
            if start >= range.end {
                break;
            }
            let Some(end) = resolve_local(zone, day.and_time(rule.end)) else {
                continue;
            };
            let start = start.max(range.start);
            let end = end.min(range.end);
            if end <= start {
                continue;
            }
            if let Some(last) = blocks.last_mut()
                && start <= last.end
            {
                last.end = last.end.max(end);
                continue;
            }
            blocks.push(Span::new(start, end));
        }

        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    blocks.retain(|b| b.duration() >= min_block);
    blocks
}
