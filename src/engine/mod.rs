mod aggregate;
mod availability;
mod conflict;
mod error;
mod exclusions;
mod mutations;
mod queries;
mod reservation;
mod template;

pub use aggregate::{is_exact_match, union_free_windows};
pub use availability::{free_blocks, merge_overlapping, subtract_exclusions};
pub use error::EngineError;
pub use exclusions::collect_exclusions;
pub use reservation::{BookingWindow, InterviewerPicker, NextDayAtHour, RandomPicker};
pub use template::expand_weekly_rules;
pub(crate) use conflict::now_in;
pub(crate) use template::resolve_local;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::SchedulerConfig;
use crate::model::*;
use crate::wal::Wal;

pub type SharedInterviewerState = Arc<RwLock<InterviewerState>>;
pub type SharedCandidateState = Arc<Mutex<CandidateState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch.
/// 4. Respond to every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedInterviewerState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Candidate accesses keyed by token.
    pub(super) candidates: DashMap<String, SharedCandidateState>,
    /// access_id → token
    pub(super) access_tokens: DashMap<Ulid, String>,
    /// Reverse lookup: entity (rule/blackout/interview) id → interviewer id
    pub(super) entity_to_interviewer: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared; compaction holds it exclusively so that no
    /// append can land between the state snapshot and the file swap.
    pub(super) mutation_gate: RwLock<()>,
    /// Held across the uniqueness check, WAL append and insert of new
    /// interviewers and candidates, so two registrations can't claim one key.
    pub(super) registry: Mutex<()>,
    pub config: SchedulerConfig,
    pub(super) picker: Arc<dyn InterviewerPicker>,
    pub(super) window: Arc<dyn BookingWindow>,
}

/// Apply an event directly to an InterviewerState (no locking; caller holds the lock).
fn apply_to_interviewer(
    rs: &mut InterviewerState,
    event: &Event,
    entity_map: &DashMap<Ulid, Ulid>,
    zone: Tz,
) {
    match event {
        Event::RuleAdded {
            id,
            interviewer_id,
            weekday,
            start_hour,
            start_minute,
            end_hour,
            end_minute,
        } => match WeeklyRule::new(
            *id,
            *interviewer_id,
            *weekday,
            *start_hour,
            *start_minute,
            *end_hour,
            *end_minute,
        ) {
            Ok(rule) => {
                rs.insert_rule(rule);
                entity_map.insert(*id, *interviewer_id);
            }
            Err(e) => warn!("skipping invalid rule {id}: {e}"),
        },
        Event::RuleRemoved { id, .. } => {
            rs.remove_rule(*id);
            entity_map.remove(id);
        }
        Event::BlackoutAdded {
            id,
            interviewer_id,
            start,
            end,
            reason,
        } => match Span::from_ms(zone, *start, *end) {
            Some(span) => {
                rs.insert_exclusion(Exclusion {
                    id: *id,
                    span,
                    kind: ExclusionKind::Blackout {
                        reason: reason.clone(),
                    },
                });
                entity_map.insert(*id, *interviewer_id);
            }
            None => warn!("skipping blackout {id} with unrepresentable span"),
        },
        Event::InterviewBooked {
            id,
            interviewer_id,
            access_id,
            start,
            end,
        } => match Span::from_ms(zone, *start, *end) {
            Some(span) => {
                rs.insert_exclusion(Exclusion {
                    id: *id,
                    span,
                    kind: ExclusionKind::Interview {
                        access_id: *access_id,
                    },
                });
                entity_map.insert(*id, *interviewer_id);
            }
            None => warn!("skipping interview {id} with unrepresentable span"),
        },
        Event::BlackoutRemoved { id, .. } | Event::InterviewCancelled { id, .. } => {
            rs.remove_exclusion(*id);
            entity_map.remove(id);
        }
        // Interviewer and candidate lifecycle is handled at the DashMap level, not here
        Event::InterviewerCreated { .. }
        | Event::InterviewerDeleted { .. }
        | Event::CandidateRegistered { .. } => {}
    }
}

/// Apply the candidate-side half of a booking event (caller holds the lock).
fn apply_to_candidate(candidate: &mut CandidateState, event: &Event) {
    match event {
        Event::InterviewBooked { id, .. } => {
            candidate.interview = Some(*id);
            candidate.spent = true;
        }
        Event::InterviewCancelled { id, .. } => {
            if candidate.interview == Some(*id) {
                candidate.interview = None;
            }
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: SchedulerConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let window = Arc::new(NextDayAtHour {
            hour: config.booking_cutoff_hour,
        });
        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            candidates: DashMap::new(),
            access_tokens: DashMap::new(),
            entity_to_interviewer: DashMap::new(),
            mutation_gate: RwLock::new(()),
            registry: Mutex::new(()),
            config,
            picker: Arc::new(RandomPicker),
            window,
        };
        let zone = engine.config.zone;

        // Replay events. We're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use blocking_read/blocking_write
        // here because this runs inside an async context.
        for event in &events {
            match event {
                Event::InterviewerCreated { id, name } => {
                    let rs = InterviewerState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::InterviewerDeleted { id } => {
                    if let Some((_, rs)) = engine.state.remove(id) {
                        let guard = rs.try_read().expect("replay: uncontended read");
                        engine.forget_entities(&guard);
                    }
                }
                Event::CandidateRegistered {
                    access_id,
                    token,
                    spent,
                } => {
                    engine.insert_candidate(CandidateState {
                        access_id: *access_id,
                        token: token.clone(),
                        interview: None,
                        spent: *spent,
                    });
                }
                other => {
                    if let Some(interviewer_id) = event_interviewer_id(other)
                        && let Some(rs) = engine.get_interviewer(&interviewer_id)
                    {
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        apply_to_interviewer(&mut guard, other, &engine.entity_to_interviewer, zone);
                    }
                    if let Some(access_id) = event_access_id(other)
                        && let Some(candidate) = engine.get_candidate_by_access(&access_id)
                    {
                        let mut guard = candidate.try_lock().expect("replay: uncontended lock");
                        apply_to_candidate(&mut guard, other);
                    }
                }
            }
        }

        if !events.is_empty() {
            info!(
                "replayed {} events: {} interviewers, {} candidates",
                events.len(),
                engine.state.len(),
                engine.candidates.len()
            );
        }
        Ok(engine)
    }

    /// Replace the interviewer picker (default: uniform random).
    pub fn with_picker(mut self, picker: Arc<dyn InterviewerPicker>) -> Self {
        self.picker = picker;
        self
    }

    /// Replace the booking-window policy (default: tomorrow at the cutoff hour).
    pub fn with_booking_window(mut self, window: Arc<dyn BookingWindow>) -> Self {
        self.window = window;
        self
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_interviewer(&self, id: &Ulid) -> Option<SharedInterviewerState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_interviewer_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_interviewer.get(entity_id).map(|e| *e.value())
    }

    pub(super) fn get_candidate_by_access(&self, access_id: &Ulid) -> Option<SharedCandidateState> {
        let token = self.access_tokens.get(access_id)?;
        self.candidates.get(token.value()).map(|e| e.value().clone())
    }

    pub(super) fn insert_candidate(&self, candidate: CandidateState) {
        self.access_tokens
            .insert(candidate.access_id, candidate.token.clone());
        self.candidates
            .insert(candidate.token.clone(), Arc::new(Mutex::new(candidate)));
    }

    /// Drop reverse-lookup entries for everything an interviewer owns.
    pub(super) fn forget_entities(&self, rs: &InterviewerState) {
        for rule in &rs.rules {
            self.entity_to_interviewer.remove(&rule.id);
        }
        for exclusion in &rs.exclusions {
            self.entity_to_interviewer.remove(&exclusion.id);
        }
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut InterviewerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_interviewer(rs, event, &self.entity_to_interviewer, self.config.zone);
        Ok(())
    }

    /// WAL-append + apply for events touching both an interviewer and a candidate.
    pub(super) async fn persist_and_apply_booking(
        &self,
        rs: &mut InterviewerState,
        candidate: &mut CandidateState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.persist_and_apply(rs, event).await?;
        apply_to_candidate(candidate, event);
        Ok(())
    }

    /// Lookup entity → interviewer, get interviewer, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<InterviewerState>), EngineError> {
        let interviewer_id = self
            .get_interviewer_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let rs = self
            .get_interviewer(&interviewer_id)
            .ok_or(EngineError::NotFound(interviewer_id))?;
        let guard = rs.write_owned().await;
        Ok((interviewer_id, guard))
    }
}

/// Extract the interviewer_id from an event (for non-lifecycle events).
fn event_interviewer_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::RuleAdded { interviewer_id, .. }
        | Event::RuleRemoved { interviewer_id, .. }
        | Event::BlackoutAdded { interviewer_id, .. }
        | Event::BlackoutRemoved { interviewer_id, .. }
        | Event::InterviewBooked { interviewer_id, .. }
        | Event::InterviewCancelled { interviewer_id, .. } => Some(*interviewer_id),
        Event::InterviewerCreated { .. }
        | Event::InterviewerDeleted { .. }
        | Event::CandidateRegistered { .. } => None,
    }
}

fn event_access_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::InterviewBooked { access_id, .. } | Event::InterviewCancelled { access_id, .. } => {
            Some(*access_id)
        }
        _ => None,
    }
}
