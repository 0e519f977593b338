use std::sync::Arc;

use chrono::{Duration, TimeZone};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use ulid::Ulid;

use crate::model::*;

use super::availability::{free_blocks, merge_overlapping};
use super::{Engine, EngineError};

fn floor_minute(t: &Timestamp) -> Option<Timestamp> {
    let secs = t.timestamp().div_euclid(60) * 60;
    t.timezone().timestamp_opt(secs, 0).single()
}

fn ceil_minute(t: &Timestamp) -> Option<Timestamp> {
    let floor = floor_minute(t)?;
    Some(if floor == *t { floor } else { floor + Duration::minutes(1) })
}

/// Union of every interviewer's free blocks at whole-minute resolution.
/// Partial minutes at block edges are not counted; contiguous minutes
/// coalesce, and windows shorter than `coverage` are dropped.
pub fn union_free_windows(per_interviewer: &[Vec<Span>], coverage: Duration) -> Vec<Span> {
    let mut minutes: Vec<Span> = per_interviewer
        .iter()
        .flatten()
        .filter_map(|b| {
            let start = ceil_minute(&b.start)?;
            let end = floor_minute(&b.end)?;
            (start < end).then(|| Span::new(start, end))
        })
        .collect();
    minutes.sort_by_key(|s| s.start);
    let mut windows = merge_overlapping(&minutes);
    windows.retain(|w| w.duration() >= coverage);
    windows
}

/// Free blocks computed over exactly `slot` match it when they are that one slot.
pub fn is_exact_match(blocks: &[Span], slot: &Span) -> bool {
    matches!(blocks, [only] if only == slot)
}

impl Engine {
    /// Free blocks of every eligible interviewer over `range`, sorted by interviewer id.
    /// Each interviewer is computed on its own task; a semaphore bounds how many run at once.
    pub async fn per_interviewer_free_blocks(
        &self,
        range: &Span,
    ) -> Result<Vec<(Ulid, Vec<Span>)>, EngineError> {
        let range = range.in_zone(self.config.zone);
        let min_block = self.config.slot_len();
        let started = std::time::Instant::now();

        let interviewers: Vec<_> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let permits = Arc::new(Semaphore::new(self.config.availability_workers));
        let mut tasks = JoinSet::new();
        for (id, rs) in interviewers {
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| EngineError::Worker(e.to_string()))?;
                let guard = rs.read().await;
                if !guard.is_eligible() {
                    return Ok(None);
                }
                Ok::<_, EngineError>(Some((id, free_blocks(&guard, &range, min_block))))
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome: Result<Option<(Ulid, Vec<Span>)>, EngineError> =
                joined.map_err(|e| EngineError::Worker(e.to_string()))?;
            if let Some(entry) = outcome? {
                results.push(entry);
            }
        }
        results.sort_by_key(|(id, _)| *id);

        metrics::histogram!(crate::observability::AVAILABILITY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(results)
    }

    /// Minute-granularity windows during which at least one interviewer is free.
    pub async fn union_free_windows(&self, range: &Span) -> Result<Vec<Span>, EngineError> {
        let per: Vec<Vec<Span>> = self
            .per_interviewer_free_blocks(range)
            .await?
            .into_iter()
            .map(|(_, blocks)| blocks)
            .collect();
        Ok(union_free_windows(&per, self.config.coverage()))
    }

    /// Interviewers whose availability restricted to `slot` is exactly `slot`.
    /// Sorted by id.
    pub async fn interviewers_free_for_exact_slot(&self, slot: &Span) -> Result<Vec<Ulid>, EngineError> {
        let slot = slot.in_zone(self.config.zone);
        Ok(self
            .per_interviewer_free_blocks(&slot)
            .await?
            .into_iter()
            .filter(|(_, blocks)| is_exact_match(blocks, &slot))
            .map(|(id, _)| id)
            .collect())
    }
}
