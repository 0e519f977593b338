use std::sync::Arc;

use chrono::Duration;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::check_no_overlap;
use super::template::resolve_local;
use super::{Engine, EngineError, SharedCandidateState};

/// Chooses which of several available interviewers gets the booking.
pub trait InterviewerPicker: Send + Sync {
    fn pick(&self, available: &[Ulid]) -> Option<Ulid>;
}

/// Uniform random choice.
pub struct RandomPicker;

impl InterviewerPicker for RandomPicker {
    fn pick(&self, available: &[Ulid]) -> Option<Ulid> {
        available.choose(&mut rand::thread_rng()).copied()
    }
}

/// Earliest instant a candidate may book, given the current time.
pub trait BookingWindow: Send + Sync {
    fn earliest_start(&self, now: &Timestamp) -> Timestamp;
}

/// Tomorrow at `hour` o'clock, local time.
pub struct NextDayAtHour {
    pub hour: u32,
}

impl BookingWindow for NextDayAtHour {
    fn earliest_start(&self, now: &Timestamp) -> Timestamp {
        now.date_naive()
            .succ_opt()
            .and_then(|day| day.and_hms_opt(self.hour, 0, 0))
            .and_then(|naive| resolve_local(now.timezone(), naive))
            .unwrap_or_else(|| *now + Duration::days(1))
    }
}

enum Outcome {
    Committed(InterviewInfo),
    /// The slot went to this exclusion after availability was computed.
    Conflict(Ulid),
    /// This interviewer can't take the booking; try the others.
    Skip(&'static str),
}

impl Engine {
    /// Book the slot starting at `start` for the candidate holding `token`.
    ///
    /// Picks one of the interviewers free for exactly that slot and commits under
    /// the interviewer's write lock. A slot taken concurrently is retried with a
    /// fresh availability check, up to `max_booking_attempts` times. Interviewers
    /// that were deleted or are full are left out of later attempts.
    pub async fn book_slot(
        &self,
        token: &str,
        start: Timestamp,
        now: Timestamp,
    ) -> Result<InterviewInfo, EngineError> {
        let zone = self.config.zone;
        let start = start.with_timezone(&zone);
        let now = now.with_timezone(&zone);

        let candidate = self.validate_access(token).await?;
        let earliest = self.window.earliest_start(&now);
        if start < earliest {
            return Err(EngineError::InvalidInput(format!(
                "slot {start} is before the booking window opens at {earliest}"
            )));
        }
        let slot = Span::new(start, start + self.config.slot_len());

        let attempts = self.config.max_booking_attempts;
        let mut skipped: Vec<Ulid> = Vec::new();
        for attempt in 1..=attempts {
            let mut available = self.interviewers_free_for_exact_slot(&slot).await?;
            available.retain(|id| !skipped.contains(id));
            let Some(interviewer_id) = self.picker.pick(&available) else {
                metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "no_availability")
                    .increment(1);
                return Err(EngineError::NoAvailability);
            };
            debug!("attempt {attempt}: {} free, picked {interviewer_id}", available.len());

            match self.try_commit(interviewer_id, &candidate, slot, &now).await {
                Ok(Outcome::Committed(interview)) => {
                    metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "committed")
                        .increment(1);
                    info!(
                        "booked interview {} with {interviewer_id} at {}",
                        interview.id, interview.span.start
                    );
                    return Ok(interview);
                }
                Ok(Outcome::Conflict(existing)) => {
                    metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "conflict")
                        .increment(1);
                    warn!(
                        "attempt {attempt}/{attempts}: slot {} on {interviewer_id} taken by {existing}",
                        slot.start
                    );
                }
                Ok(Outcome::Skip(reason)) => {
                    metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "skipped")
                        .increment(1);
                    warn!("attempt {attempt}/{attempts}: skipping {interviewer_id}: {reason}");
                    skipped.push(interviewer_id);
                }
                Err(e) => {
                    metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => e.kind())
                        .increment(1);
                    return Err(e);
                }
            }
        }

        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => "reservation_failed")
            .increment(1);
        Err(EngineError::ReservationFailed(attempts))
    }

    /// One commit attempt. Lock order: mutation gate, interviewer, candidate.
    /// Nothing is written unless every check passes.
    async fn try_commit(
        &self,
        interviewer_id: Ulid,
        candidate: &SharedCandidateState,
        slot: Span,
        now: &Timestamp,
    ) -> Result<Outcome, EngineError> {
        let _gate = self.mutation_gate.read().await;
        let Some(rs) = self.get_interviewer(&interviewer_id) else {
            return Ok(Outcome::Skip("interviewer deleted"));
        };
        let mut guard = tokio::time::timeout(self.config.commit_timeout, rs.clone().write_owned())
            .await
            .map_err(|_| EngineError::LockTimeout(interviewer_id))?;
        // A delete that held the lock before us has already removed the entry.
        let still_listed = self
            .state
            .get(&interviewer_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), &rs));
        if !still_listed {
            return Ok(Outcome::Skip("interviewer deleted"));
        }
        if guard.upcoming_exclusions(now) >= MAX_EXCLUSIONS_PER_INTERVIEWER {
            return Ok(Outcome::Skip("too many upcoming exclusions"));
        }
        match check_no_overlap(&guard, &slot) {
            Ok(()) => {}
            Err(EngineError::ReservationConflict(existing)) => return Ok(Outcome::Conflict(existing)),
            Err(e) => return Err(e),
        }

        let mut access = candidate.lock().await;
        if access.spent {
            return Err(EngineError::AlreadyBooked);
        }

        let id = Ulid::new();
        let event = Event::InterviewBooked {
            id,
            interviewer_id,
            access_id: access.access_id,
            start: slot.start_ms(),
            end: slot.end_ms(),
        };
        self.persist_and_apply_booking(&mut guard, &mut access, &event)
            .await?;
        Ok(Outcome::Committed(InterviewInfo {
            id,
            interviewer_id,
            access_id: access.access_id,
            span: slot,
        }))
    }
}
