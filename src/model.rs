use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Unix milliseconds, as instants are written to the WAL.
pub type Ms = i64;

/// An instant expressed in the scheduling zone.
pub type Timestamp = DateTime<Tz>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Span {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    /// Rebuild a span from WAL milliseconds in the given zone.
    pub fn from_ms(zone: Tz, start: Ms, end: Ms) -> Option<Self> {
        let start = zone.timestamp_millis_opt(start).single()?;
        let end = zone.timestamp_millis_opt(end).single()?;
        (start <= end).then_some(Self { start, end })
    }

    pub fn start_ms(&self) -> Ms {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> Ms {
        self.end.timestamp_millis()
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Re-express both bounds in `zone`. The instants do not move.
    pub fn in_zone(&self, zone: Tz) -> Self {
        Self {
            start: self.start.with_timezone(&zone),
            end: self.end.with_timezone(&zone),
        }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: &Timestamp) -> bool {
        self.start <= *t && *t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection with `bounds`, or `None` when nothing non-empty remains.
    pub fn clamp_to(&self, bounds: &Span) -> Option<Span> {
        let start = self.start.max(bounds.start);
        let end = self.end.min(bounds.end);
        (start < end).then(|| Span::new(start, end))
    }

    /// What is left of `self` after removing `cut`: nothing when `cut` covers it,
    /// one piece for a partial overlap (or no overlap), two when `cut` lies strictly inside.
    pub fn subtract(&self, cut: &Span) -> Vec<Span> {
        if !self.overlaps(cut) {
            return vec![*self];
        }
        let mut pieces = Vec::with_capacity(2);
        if self.start < cut.start {
            pieces.push(Span::new(self.start, cut.start));
        }
        if cut.end < self.end {
            pieces.push(Span::new(cut.end, self.end));
        }
        pieces
    }
}

/// Map `0..=6` (Monday first) to a weekday.
pub fn weekday_from_index(index: u8) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        5 => Some(Weekday::Sat),
        6 => Some(Weekday::Sun),
        _ => None,
    }
}

/// One recurring weekly free window of an interviewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyRule {
    pub id: Ulid,
    pub interviewer_id: Ulid,
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WeeklyRule {
    /// Validating constructor: this is the data-entry boundary for rules.
    pub fn new(
        id: Ulid,
        interviewer_id: Ulid,
        weekday: u8,
        start_hour: u8,
        start_minute: u8,
        end_hour: u8,
        end_minute: u8,
    ) -> Result<Self, EngineError> {
        let weekday = weekday_from_index(weekday).ok_or_else(|| {
            EngineError::InvalidInput(format!("weekday must be 0..=6, got {weekday}"))
        })?;
        let start = wall_clock(start_hour, start_minute)?;
        let end = wall_clock(end_hour, end_minute)?;
        if end <= start {
            return Err(EngineError::InvalidInput(format!(
                "rule must end after it starts ({start} >= {end})"
            )));
        }
        Ok(Self {
            id,
            interviewer_id,
            weekday,
            start,
            end,
        })
    }

    pub fn weekday_index(&self) -> u8 {
        self.weekday.num_days_from_monday() as u8
    }

    /// `(hour, minute)` of the start and end wall-clock times.
    pub fn parts(&self) -> ((u8, u8), (u8, u8)) {
        (
            (self.start.hour() as u8, self.start.minute() as u8),
            (self.end.hour() as u8, self.end.minute() as u8),
        )
    }

    fn sort_key(&self) -> (u32, NaiveTime, NaiveTime) {
        (self.weekday.num_days_from_monday(), self.start, self.end)
    }
}

fn wall_clock(hour: u8, minute: u8) -> Result<NaiveTime, EngineError> {
    if hour > 23 {
        return Err(EngineError::InvalidInput(format!("hour must be 0..=23, got {hour}")));
    }
    if minute > 59 {
        return Err(EngineError::InvalidInput(format!("minute must be 0..=59, got {minute}")));
    }
    NaiveTime::from_hms_opt(hour.into(), minute.into(), 0)
        .ok_or_else(|| EngineError::InvalidInput(format!("bad time {hour:02}:{minute:02}")))
}

/// What an exclusion represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionKind {
    /// Manual block entered by an administrator (vacation, sick day).
    Blackout { reason: String },
    /// A booked interview.
    Interview { access_id: Ulid },
}

/// A period during which an interviewer is not available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    pub id: Ulid,
    pub span: Span,
    pub kind: ExclusionKind,
}

impl Exclusion {
    pub fn is_interview(&self) -> bool {
        matches!(self.kind, ExclusionKind::Interview { .. })
    }

    pub fn is_blackout(&self) -> bool {
        matches!(self.kind, ExclusionKind::Blackout { .. })
    }
}

#[derive(Debug, Clone)]
pub struct InterviewerState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Weekly template, sorted by weekday then start time.
    pub rules: Vec<WeeklyRule>,
    /// Blackouts and interviews together, sorted by `span.start`.
    pub exclusions: Vec<Exclusion>,
}

impl InterviewerState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            rules: Vec::new(),
            exclusions: Vec::new(),
        }
    }

    /// Only interviewers with a weekly template take part in scheduling.
    pub fn is_eligible(&self) -> bool {
        !self.rules.is_empty()
    }

    pub fn insert_rule(&mut self, rule: WeeklyRule) {
        let key = rule.sort_key();
        let pos = self.rules.partition_point(|r| r.sort_key() <= key);
        self.rules.insert(pos, rule);
    }

    pub fn remove_rule(&mut self, id: Ulid) -> Option<WeeklyRule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }

    /// Insert exclusion maintaining sort order by span.start.
    pub fn insert_exclusion(&mut self, exclusion: Exclusion) {
        let pos = self
            .exclusions
            .partition_point(|e| e.span.start <= exclusion.span.start);
        self.exclusions.insert(pos, exclusion);
    }

    pub fn remove_exclusion(&mut self, id: Ulid) -> Option<Exclusion> {
        let pos = self.exclusions.iter().position(|e| e.id == id)?;
        Some(self.exclusions.remove(pos))
    }

    /// Return only exclusions whose span overlaps the query window.
    /// Uses binary search to skip exclusions starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Exclusion> {
        let right_bound = self
            .exclusions
            .partition_point(|e| e.span.start < query.end);
        self.exclusions[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }

    /// Exclusions that have not ended by `now`; past ones no longer count
    /// against the per-interviewer cap.
    pub fn upcoming_exclusions(&self, now: &Timestamp) -> usize {
        self.exclusions.iter().filter(|e| e.span.end > *now).count()
    }

    pub fn interview_count(&self) -> usize {
        self.exclusions.iter().filter(|e| e.is_interview()).count()
    }
}

#[derive(Debug, Clone)]
pub struct CandidateState {
    pub access_id: Ulid,
    pub token: String,
    /// The live interview, if any.
    pub interview: Option<Ulid>,
    /// Set on first booking and never cleared, cancellation included.
    pub spent: bool,
}

/// The event types: flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    InterviewerCreated {
        id: Ulid,
        name: Option<String>,
    },
    InterviewerDeleted {
        id: Ulid,
    },
    RuleAdded {
        id: Ulid,
        interviewer_id: Ulid,
        weekday: u8,
        start_hour: u8,
        start_minute: u8,
        end_hour: u8,
        end_minute: u8,
    },
    RuleRemoved {
        id: Ulid,
        interviewer_id: Ulid,
    },
    BlackoutAdded {
        id: Ulid,
        interviewer_id: Ulid,
        start: Ms,
        end: Ms,
        reason: String,
    },
    BlackoutRemoved {
        id: Ulid,
        interviewer_id: Ulid,
    },
    CandidateRegistered {
        access_id: Ulid,
        token: String,
        spent: bool,
    },
    InterviewBooked {
        id: Ulid,
        interviewer_id: Ulid,
        access_id: Ulid,
        start: Ms,
        end: Ms,
    },
    InterviewCancelled {
        id: Ulid,
        interviewer_id: Ulid,
        access_id: Ulid,
    },
}

impl Event {
    pub fn rule_added(rule: &WeeklyRule) -> Self {
        let ((start_hour, start_minute), (end_hour, end_minute)) = rule.parts();
        Event::RuleAdded {
            id: rule.id,
            interviewer_id: rule.interviewer_id,
            weekday: rule.weekday_index(),
            start_hour,
            start_minute,
            end_hour,
            end_minute,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterviewerInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub rule_count: usize,
    pub interview_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlackoutInfo {
    pub id: Ulid,
    pub interviewer_id: Ulid,
    pub span: Span,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterviewInfo {
    pub id: Ulid,
    pub interviewer_id: Ulid,
    pub access_id: Ulid,
    pub span: Span,
}

/// Bookable slots of one local calendar day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaySlots {
    pub date: NaiveDate,
    pub slots: Vec<Span>,
}
