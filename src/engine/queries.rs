use chrono::Duration;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::free_blocks;
use super::conflict::validate_span;
use super::exclusions::collect_exclusions;
use super::{Engine, EngineError, SharedCandidateState};

impl Engine {
    pub async fn list_interviewers(&self) -> Vec<InterviewerInfo> {
        let all: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(all.len());
        for rs in all {
            let guard = rs.read().await;
            out.push(InterviewerInfo {
                id: guard.id,
                name: guard.name.clone(),
                rule_count: guard.rules.len(),
                interview_count: guard.interview_count(),
            });
        }
        out.sort_by_key(|i| i.id);
        out
    }

    /// Interviewers with at least one weekly rule, sorted by id.
    pub async fn eligible_interviewers(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = Vec::new();
        let all: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for rs in all {
            let guard = rs.read().await;
            if guard.is_eligible() {
                ids.push(guard.id);
            }
        }
        ids.sort();
        ids
    }

    pub async fn get_rules(&self, interviewer_id: Ulid) -> Result<Vec<WeeklyRule>, EngineError> {
        let rs = self
            .get_interviewer(&interviewer_id)
            .ok_or(EngineError::NotFound(interviewer_id))?;
        let guard = rs.read().await;
        Ok(guard.rules.clone())
    }

    pub async fn get_blackouts(&self, interviewer_id: Ulid) -> Result<Vec<BlackoutInfo>, EngineError> {
        let rs = self
            .get_interviewer(&interviewer_id)
            .ok_or(EngineError::NotFound(interviewer_id))?;
        let guard = rs.read().await;
        Ok(guard
            .exclusions
            .iter()
            .filter_map(|e| match &e.kind {
                ExclusionKind::Blackout { reason } => Some(BlackoutInfo {
                    id: e.id,
                    interviewer_id,
                    span: e.span,
                    reason: reason.clone(),
                }),
                ExclusionKind::Interview { .. } => None,
            })
            .collect())
    }

    pub async fn get_interviews(&self, interviewer_id: Ulid) -> Result<Vec<InterviewInfo>, EngineError> {
        let rs = self
            .get_interviewer(&interviewer_id)
            .ok_or(EngineError::NotFound(interviewer_id))?;
        let guard = rs.read().await;
        Ok(guard
            .exclusions
            .iter()
            .filter_map(|e| match e.kind {
                ExclusionKind::Interview { access_id } => Some(InterviewInfo {
                    id: e.id,
                    interviewer_id,
                    access_id,
                    span: e.span,
                }),
                ExclusionKind::Blackout { .. } => None,
            })
            .collect())
    }

    /// Blackouts and interviews of one interviewer overlapping `range`.
    pub async fn exclusions_for(&self, interviewer_id: Ulid, range: &Span) -> Result<Vec<Span>, EngineError> {
        let range = range.in_zone(self.config.zone);
        let rs = self
            .get_interviewer(&interviewer_id)
            .ok_or(EngineError::NotFound(interviewer_id))?;
        let guard = rs.read().await;
        Ok(collect_exclusions(&guard, &range))
    }

    /// Free blocks of one interviewer over `range`.
    pub async fn interviewer_free_blocks(&self, interviewer_id: Ulid, range: &Span) -> Result<Vec<Span>, EngineError> {
        let range = range.in_zone(self.config.zone);
        validate_span(&range, MAX_QUERY_WINDOW_DAYS)?;
        let rs = self
            .get_interviewer(&interviewer_id)
            .ok_or(EngineError::NotFound(interviewer_id))?;
        let guard = rs.read().await;
        Ok(free_blocks(&guard, &range, self.config.slot_len()))
    }

    /// Unknown token → `Unauthenticated`; a token that already booked → `AlreadyBooked`.
    pub async fn validate_access(&self, token: &str) -> Result<SharedCandidateState, EngineError> {
        let candidate = self
            .candidates
            .get(token)
            .map(|e| e.value().clone())
            .ok_or(EngineError::Unauthenticated)?;
        if candidate.lock().await.spent {
            return Err(EngineError::AlreadyBooked);
        }
        Ok(candidate)
    }

    /// Bookable slots from the booking window's opening until `now + window_days`,
    /// grouped by local date.
    pub async fn get_availability(
        &self,
        token: &str,
        window_days: u32,
        now: Timestamp,
    ) -> Result<Vec<DaySlots>, EngineError> {
        self.validate_access(token).await?;
        if window_days == 0 || i64::from(window_days) > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("availability window out of range"));
        }
        let now = now.with_timezone(&self.config.zone);
        let start = self.window.earliest_start(&now);
        let end = now + Duration::days(window_days.into());
        if start >= end {
            return Ok(Vec::new());
        }

        let windows = self.union_free_windows(&Span::new(start, end)).await?;
        Ok(group_by_day(split_into_slots(&windows, self.config.slot_len())))
    }
}

/// Cut each window into consecutive `slot`-long pieces from its start. A trailing
/// piece shorter than `slot` is dropped, separately for every window.
pub(crate) fn split_into_slots(windows: &[Span], slot: Duration) -> Vec<Span> {
    let mut slots = Vec::new();
    for w in windows {
        let mut cursor = w.start;
        while cursor + slot <= w.end {
            slots.push(Span::new(cursor, cursor + slot));
            cursor = cursor + slot;
        }
    }
    slots
}

/// Group start-sorted slots by the local date they start on.
pub(crate) fn group_by_day(slots: Vec<Span>) -> Vec<DaySlots> {
    let mut days: Vec<DaySlots> = Vec::new();
    for slot in slots {
        let date = slot.start.date_naive();
        match days.last_mut() {
            Some(day) if day.date == date => day.slots.push(slot),
            _ => days.push(DaySlots { date, slots: vec![slot] }),
        }
    }
    days
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use chrono_tz::America::Santiago;

    fn at(d: u32, h: u32, m: u32) -> Timestamp {
        Santiago.with_ymd_and_hms(2024, 4, d, h, m, 0).unwrap()
    }

    #[test]
    fn split_drops_remainder_per_window() {
        let windows = [
            Span::new(at(1, 8, 0), at(1, 9, 10)),
            Span::new(at(1, 10, 0), at(1, 11, 0)),
        ];
        let slots = split_into_slots(&windows, Duration::minutes(30));
        assert_eq!(
            slots,
            vec![
                Span::new(at(1, 8, 0), at(1, 8, 30)),
                Span::new(at(1, 8, 30), at(1, 9, 0)),
                Span::new(at(1, 10, 0), at(1, 10, 30)),
                Span::new(at(1, 10, 30), at(1, 11, 0)),
            ]
        );
    }

    #[test]
    fn split_window_shorter_than_slot() {
        let windows = [Span::new(at(1, 8, 0), at(1, 8, 20))];
        assert!(split_into_slots(&windows, Duration::minutes(30)).is_empty());
    }

    #[test]
    fn groups_by_local_date() {
        let slots = vec![
            Span::new(at(1, 8, 0), at(1, 8, 30)),
            Span::new(at(1, 9, 0), at(1, 9, 30)),
            Span::new(at(2, 8, 0), at(2, 8, 30)),
        ];
        let days = group_by_day(slots);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        assert_eq!(days[0].slots.len(), 2);
        assert_eq!(days[1].date, NaiveDate::from_ymd_opt(2024, 4, 2).unwrap());
        assert_eq!(days[1].slots.len(), 1);
    }
}
