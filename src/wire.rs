use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDateTime};
use chrono_tz::Tz;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, now_in, resolve_local};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability::{REQUEST_DURATION_SECONDS, REQUESTS_TOTAL, op_label};

/// One line of client input.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Availability {
        token: String,
        #[serde(default)]
        window_days: Option<u32>,
    },
    Book {
        token: String,
        start: String,
    },
    CreateInterviewer {
        #[serde(default)]
        id: Option<Ulid>,
        #[serde(default)]
        name: Option<String>,
    },
    DeleteInterviewer {
        id: Ulid,
    },
    AddRule {
        #[serde(default)]
        id: Option<Ulid>,
        interviewer_id: Ulid,
        weekday: u8,
        start_hour: u8,
        #[serde(default)]
        start_minute: u8,
        end_hour: u8,
        #[serde(default)]
        end_minute: u8,
    },
    RemoveRule {
        id: Ulid,
    },
    AddBlackout {
        #[serde(default)]
        id: Option<Ulid>,
        interviewer_id: Ulid,
        start: String,
        end: String,
        #[serde(default)]
        reason: String,
    },
    RemoveBlackout {
        id: Ulid,
    },
    RegisterCandidate {
        #[serde(default)]
        access_id: Option<Ulid>,
        token: String,
    },
    CancelInterview {
        id: Ulid,
    },
    ListInterviewers,
    FreeBlocks {
        interviewer_id: Ulid,
        start: String,
        end: String,
    },
    Interviews {
        interviewer_id: Ulid,
    },
}

/// Accepts `YYYY-MM-DD HH:MM` in the scheduling zone, or RFC 3339.
pub fn parse_timestamp(zone: Tz, s: &str) -> Result<Timestamp, EngineError> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&zone));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .map_err(|_| EngineError::InvalidInput(format!("bad timestamp {s:?}")))?;
    resolve_local(zone, naive)
        .ok_or_else(|| EngineError::InvalidInput(format!("no such local time {s:?}")))
}

fn parse_span(zone: Tz, start: &str, end: &str) -> Result<Span, EngineError> {
    let start = parse_timestamp(zone, start)?;
    let end = parse_timestamp(zone, end)?;
    if start >= end {
        return Err(EngineError::InvalidInput(format!("span must end after it starts ({start} >= {end})")));
    }
    Ok(Span::new(start, end))
}

fn span_json(span: &Span) -> Value {
    json!({ "start": span.start.to_rfc3339(), "end": span.end.to_rfc3339() })
}

fn spans_json(spans: &[Span]) -> Value {
    Value::Array(spans.iter().map(span_json).collect())
}

fn interview_json(i: &InterviewInfo) -> Value {
    json!({
        "id": i.id.to_string(),
        "interviewer_id": i.interviewer_id.to_string(),
        "access_id": i.access_id.to_string(),
        "start": i.span.start.to_rfc3339(),
        "end": i.span.end.to_rfc3339(),
    })
}

fn day_json(day: &DaySlots) -> Value {
    json!({ "date": day.date.to_string(), "slots": spans_json(&day.slots) })
}

fn interviewer_json(i: &InterviewerInfo) -> Value {
    json!({
        "id": i.id.to_string(),
        "name": i.name,
        "rule_count": i.rule_count,
        "interview_count": i.interview_count,
    })
}

fn error_json(kind: &str, message: &str) -> Value {
    json!({ "ok": false, "error": { "kind": kind, "message": message } })
}

/// Run one request against the engine and render its `data` payload.
pub async fn execute_request(engine: &Engine, req: Request, now: Timestamp) -> Result<Value, EngineError> {
    let zone = engine.config.zone;
    match req {
        Request::Availability { token, window_days } => {
            let days = engine
                .get_availability(&token, window_days.unwrap_or(engine.config.window_days), now)
                .await?;
            Ok(Value::Array(days.iter().map(day_json).collect()))
        }
        Request::Book { token, start } => {
            let start = parse_timestamp(zone, &start)?;
            let interview = engine.book_slot(&token, start, now).await?;
            Ok(interview_json(&interview))
        }
        Request::CreateInterviewer { id, name } => {
            let id = id.unwrap_or_else(Ulid::new);
            engine.create_interviewer(id, name).await?;
            Ok(json!({ "id": id.to_string() }))
        }
        Request::DeleteInterviewer { id } => {
            engine.delete_interviewer(id).await?;
            Ok(json!({ "id": id.to_string() }))
        }
        Request::AddRule {
            id,
            interviewer_id,
            weekday,
            start_hour,
            start_minute,
            end_hour,
            end_minute,
        } => {
            let id = id.unwrap_or_else(Ulid::new);
            engine
                .add_rule(id, interviewer_id, weekday, (start_hour, start_minute), (end_hour, end_minute))
                .await?;
            Ok(json!({ "id": id.to_string() }))
        }
        Request::RemoveRule { id } => {
            let interviewer_id = engine.remove_rule(id).await?;
            Ok(json!({ "id": id.to_string(), "interviewer_id": interviewer_id.to_string() }))
        }
        Request::AddBlackout {
            id,
            interviewer_id,
            start,
            end,
            reason,
        } => {
            let span = parse_span(zone, &start, &end)?;
            let id = id.unwrap_or_else(Ulid::new);
            engine.add_blackout(id, interviewer_id, span, reason).await?;
            Ok(json!({ "id": id.to_string() }))
        }
        Request::RemoveBlackout { id } => {
            let interviewer_id = engine.remove_blackout(id).await?;
            Ok(json!({ "id": id.to_string(), "interviewer_id": interviewer_id.to_string() }))
        }
        Request::RegisterCandidate { access_id, token } => {
            let access_id = access_id.unwrap_or_else(Ulid::new);
            engine.register_candidate(access_id, token).await?;
            Ok(json!({ "access_id": access_id.to_string() }))
        }
        Request::CancelInterview { id } => {
            let interview = engine.cancel_interview(id).await?;
            Ok(interview_json(&interview))
        }
        Request::ListInterviewers => {
            let all = engine.list_interviewers().await;
            Ok(Value::Array(all.iter().map(interviewer_json).collect()))
        }
        Request::FreeBlocks {
            interviewer_id,
            start,
            end,
        } => {
            let range = parse_span(zone, &start, &end)?;
            let blocks = engine.interviewer_free_blocks(interviewer_id, &range).await?;
            Ok(spans_json(&blocks))
        }
        Request::Interviews { interviewer_id } => {
            let interviews = engine.get_interviews(interviewer_id).await?;
            Ok(Value::Array(interviews.iter().map(interview_json).collect()))
        }
    }
}

/// Decode, execute, and encode one request line. Never fails: problems become
/// `{"ok": false, ...}` responses.
pub async fn handle_line(engine: &Engine, line: &str, now: Timestamp) -> Value {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => "unknown", "status" => "bad_request").increment(1);
            return error_json("bad_request", &e.to_string());
        }
    };
    let op = op_label(&req);
    let started = Instant::now();
    let result = execute_request(engine, req, now).await;
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());

    match result {
        Ok(data) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
            json!({ "ok": true, "data": data })
        }
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => e.kind()).increment(1);
            if e.is_client_error() {
                debug!("{op}: {e}");
            } else {
                error!("{op}: {e}");
            }
            error_json(e.kind(), &e.to_string())
        }
    }
}

/// Newline-delimited frames. An over-long line comes out as an `Err` item
/// rather than a decode error, because `Framed` stops reading after the first
/// decode error. The inner codec discards the rest of that line on its own.
struct RequestLines(LinesCodec);

impl RequestLines {
    fn new(max_length: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max_length))
    }
}

fn keep_going(
    decoded: Result<Option<String>, LinesCodecError>,
) -> Result<Option<Result<String, LinesCodecError>>, LinesCodecError> {
    match decoded {
        Ok(line) => Ok(line.map(Ok)),
        Err(LinesCodecError::MaxLineLengthExceeded) => {
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded)))
        }
        Err(e) => Err(e),
    }
}

impl Decoder for RequestLines {
    type Item = Result<String, LinesCodecError>;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        keep_going(self.0.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        keep_going(self.0.decode_eof(buf))
    }
}

impl Encoder<String> for RequestLines {
    type Error = LinesCodecError;

    fn encode(&mut self, line: String, buf: &mut BytesMut) -> Result<(), Self::Error> {
        self.0.encode(line, buf)
    }
}

/// Serve one client: one JSON request per line in, one JSON response per line out.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> Result<(), LinesCodecError> {
    let peer = socket.peer_addr().ok();
    let mut lines = Framed::new(socket, RequestLines::new(MAX_LINE_LEN));

    while let Some(frame) = lines.next().await {
        let response = match frame? {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&engine, &line, now_in(engine.config.zone)).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                error_json("bad_request", "request line too long")
            }
            Err(e) => return Err(e),
        };
        lines.send(response.to_string()).await?;
    }

    if let Some(peer) = peer {
        info!("connection from {peer} closed");
    }
    Ok(())
}
