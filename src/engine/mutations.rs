use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_span;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_interviewer(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("interviewer name too long"));
            }
        let _gate = self.mutation_gate.read().await;
        let _registry = self.registry.lock().await;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.state.len() >= MAX_INTERVIEWERS {
            return Err(EngineError::LimitExceeded("too many interviewers"));
        }

        let event = Event::InterviewerCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        let rs = InterviewerState::new(id, name);
        self.state.insert(id, Arc::new(RwLock::new(rs)));
        Ok(())
    }

    /// Refused while the interviewer still has interviews; cancel them first.
    pub async fn delete_interviewer(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.mutation_gate.read().await;
        let rs = self.get_interviewer(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write().await;
        if guard.interview_count() > 0 {
            return Err(EngineError::HasInterviews(id));
        }

        let event = Event::InterviewerDeleted { id };
        self.wal_append(&event).await?;
        self.forget_entities(&guard);
        self.state.remove(&id);
        Ok(())
    }

    pub async fn add_rule(
        &self,
        id: Ulid,
        interviewer_id: Ulid,
        weekday: u8,
        start: (u8, u8),
        end: (u8, u8),
    ) -> Result<(), EngineError> {
        let rule = WeeklyRule::new(id, interviewer_id, weekday, start.0, start.1, end.0, end.1)?;
        let _gate = self.mutation_gate.read().await;
        if self.entity_to_interviewer.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let rs = self
            .get_interviewer(&interviewer_id)
            .ok_or(EngineError::NotFound(interviewer_id))?;
        let mut guard = rs.write().await;
        if guard.rules.len() >= MAX_RULES_PER_INTERVIEWER {
            return Err(EngineError::LimitExceeded("too many rules on interviewer"));
        }

        let event = Event::rule_added(&rule);
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.mutation_gate.read().await;
        let (interviewer_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::RuleRemoved { id, interviewer_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(interviewer_id)
    }

    pub async fn add_blackout(
        &self,
        id: Ulid,
        interviewer_id: Ulid,
        span: Span,
        reason: String,
    ) -> Result<(), EngineError> {
        let span = span.in_zone(self.config.zone);
        validate_span(&span, MAX_BLACKOUT_DAYS)?;
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("blackout reason too long"));
        }
        let _gate = self.mutation_gate.read().await;
        if self.entity_to_interviewer.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let rs = self
            .get_interviewer(&interviewer_id)
            .ok_or(EngineError::NotFound(interviewer_id))?;
        let mut guard = rs.write().await;
        if guard.exclusions.len() >= MAX_EXCLUSIONS_PER_INTERVIEWER {
            return Err(EngineError::LimitExceeded("too many exclusions on interviewer"));
        }

        let event = Event::BlackoutAdded {
            id,
            interviewer_id,
            start: span.start_ms(),
            end: span.end_ms(),
            reason,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_blackout(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.mutation_gate.read().await;
        let (interviewer_id, mut guard) = self.resolve_entity_write(&id).await?;
        if !guard.exclusions.iter().any(|e| e.id == id && e.is_blackout()) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BlackoutRemoved { id, interviewer_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(interviewer_id)
    }

    pub async fn register_candidate(&self, access_id: Ulid, token: String) -> Result<(), EngineError> {
        if token.is_empty() {
            return Err(EngineError::InvalidInput("token must not be empty".into()));
        }
        if token.len() > MAX_TOKEN_LEN {
            return Err(EngineError::LimitExceeded("token too long"));
        }
        let _gate = self.mutation_gate.read().await;
        let _registry = self.registry.lock().await;
        if self.access_tokens.contains_key(&access_id) {
            return Err(EngineError::AlreadyExists(access_id));
        }
        if self.candidates.contains_key(&token) {
            return Err(EngineError::InvalidInput("token already registered".into()));
        }
        if self.candidates.len() >= MAX_CANDIDATES {
            return Err(EngineError::LimitExceeded("too many candidates"));
        }

        let event = Event::CandidateRegistered {
            access_id,
            token: token.clone(),
            spent: false,
        };
        self.wal_append(&event).await?;
        self.insert_candidate(CandidateState {
            access_id,
            token,
            interview: None,
            spent: false,
        });
        Ok(())
    }

    /// Cancel an interview, freeing the interviewer's slot. The candidate's
    /// access stays spent.
    pub async fn cancel_interview(&self, id: Ulid) -> Result<InterviewInfo, EngineError> {
        let _gate = self.mutation_gate.read().await;
        let (interviewer_id, mut guard) = self.resolve_entity_write(&id).await?;
        let (span, access_id) = guard
            .exclusions
            .iter()
            .find_map(|e| match e.kind {
                ExclusionKind::Interview { access_id } if e.id == id => Some((e.span, access_id)),
                _ => None,
            })
            .ok_or(EngineError::NotFound(id))?;
        let candidate = self
            .get_candidate_by_access(&access_id)
            .ok_or(EngineError::NotFound(access_id))?;
        let mut access = candidate.lock().await;

        let event = Event::InterviewCancelled { id, interviewer_id, access_id };
        self.persist_and_apply_booking(&mut guard, &mut access, &event).await?;
        info!("cancelled interview {id} with {interviewer_id}");
        Ok(InterviewInfo { id, interviewer_id, access_id, span })
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    /// Candidates come first so that replayed bookings find their access.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.mutation_gate.write().await;
        let mut events = Vec::new();

        let candidates: Vec<_> = self.candidates.iter().map(|e| e.value().clone()).collect();
        for candidate in candidates {
            let c = candidate.lock().await;
            events.push(Event::CandidateRegistered {
                access_id: c.access_id,
                token: c.token.clone(),
                spent: c.spent,
            });
        }

        let mut interviewers: Vec<_> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        interviewers.sort_by_key(|(id, _)| *id);
        for (_, rs) in interviewers {
            let guard = rs.read().await;
            events.push(Event::InterviewerCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            for rule in &guard.rules {
                events.push(Event::rule_added(rule));
            }
            for exclusion in &guard.exclusions {
                events.push(match &exclusion.kind {
                    ExclusionKind::Blackout { reason } => Event::BlackoutAdded {
                        id: exclusion.id,
                        interviewer_id: guard.id,
                        start: exclusion.span.start_ms(),
                        end: exclusion.span.end_ms(),
                        reason: reason.clone(),
                    },
                    ExclusionKind::Interview { access_id } => Event::InterviewBooked {
                        id: exclusion.id,
                        interviewer_id: guard.id,
                        access_id: *access_id,
                        start: exclusion.span.start_ms(),
                        end: exclusion.span.end_ms(),
                    },
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
