use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use interviewd::config::SchedulerConfig;
use interviewd::engine::Engine;
use interviewd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("interviewd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("interviewd.wal"), SchedulerConfig::default()).unwrap());

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    lines: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            lines: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.lines.send(line.to_string()).await.unwrap();
        let reply = self.lines.next().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn call(&mut self, req: Value) -> Value {
        self.send_raw(&req.to_string()).await
    }

    /// Call and unwrap the `data` of a successful response.
    async fn ok(&mut self, req: Value) -> Value {
        let resp = self.call(req.clone()).await;
        assert_eq!(resp["ok"], true, "{req} failed: {resp}");
        resp["data"].clone()
    }
}

fn error_kind(resp: &Value) -> &str {
    assert_eq!(resp["ok"], false, "expected an error: {resp}");
    resp["error"]["kind"].as_str().unwrap()
}

/// An interviewer working 08:00-18:00 every day of the week.
async fn full_week_interviewer(client: &mut Client) -> String {
    let data = client.ok(json!({"op": "create_interviewer", "name": "Ana"})).await;
    let id = data["id"].as_str().unwrap().to_string();
    for weekday in 0..7 {
        client
            .ok(json!({
                "op": "add_rule",
                "interviewer_id": id,
                "weekday": weekday,
                "start_hour": 8,
                "end_hour": 18,
            }))
            .await;
    }
    id
}

async fn register(client: &mut Client, token: &str) {
    client.ok(json!({"op": "register_candidate", "token": token})).await;
}

async fn first_slot_start(client: &mut Client, token: &str) -> String {
    let days = client.ok(json!({"op": "availability", "token": token})).await;
    days[0]["slots"][0]["start"].as_str().unwrap().to_string()
}

// ── Administration ───────────────────────────────────────────

#[tokio::test]
async fn interviewer_rules_and_free_blocks() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let data = client.ok(json!({"op": "create_interviewer", "name": "Ana"})).await;
    let id = data["id"].as_str().unwrap().to_string();
    client
        .ok(json!({
            "op": "add_rule",
            "interviewer_id": id,
            "weekday": 0,
            "start_hour": 8,
            "start_minute": 0,
            "end_hour": 12,
            "end_minute": 0,
        }))
        .await;

    let list = client.ok(json!({"op": "list_interviewers"})).await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["id"], id.as_str());
    assert_eq!(list[0]["name"], "Ana");
    assert_eq!(list[0]["rule_count"], 1);

    // Monday 2024-04-01, with a blackout 09:00-10:00
    client
        .ok(json!({
            "op": "add_blackout",
            "interviewer_id": id,
            "start": "2024-04-01 09:00",
            "end": "2024-04-01 10:00",
            "reason": "dentist",
        }))
        .await;
    let blocks = client
        .ok(json!({
            "op": "free_blocks",
            "interviewer_id": id,
            "start": "2024-04-01 00:00",
            "end": "2024-04-02 00:00",
        }))
        .await;
    assert_eq!(
        blocks,
        json!([
            {"start": "2024-04-01T08:00:00-03:00", "end": "2024-04-01T09:00:00-03:00"},
            {"start": "2024-04-01T10:00:00-03:00", "end": "2024-04-01T12:00:00-03:00"},
        ])
    );
}

#[tokio::test]
async fn blackout_removal_restores_block() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let id = full_week_interviewer(&mut client).await;

    let data = client
        .ok(json!({
            "op": "add_blackout",
            "interviewer_id": id,
            "start": "2024-04-01T11:00:00-03:00",
            "end": "2024-04-01T12:00:00-03:00",
        }))
        .await;
    let blackout_id = data["id"].as_str().unwrap().to_string();

    let query = json!({
        "op": "free_blocks",
        "interviewer_id": id,
        "start": "2024-04-01 00:00",
        "end": "2024-04-02 00:00",
    });
    assert_eq!(client.ok(query.clone()).await.as_array().unwrap().len(), 2);

    let removed = client.ok(json!({"op": "remove_blackout", "id": blackout_id})).await;
    assert_eq!(removed["interviewer_id"], id.as_str());
    assert_eq!(client.ok(query).await.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn request_errors_carry_kind() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let resp = client.send_raw("this is not json").await;
    assert_eq!(error_kind(&resp), "bad_request");

    let resp = client.call(json!({"op": "teleport"})).await;
    assert_eq!(error_kind(&resp), "bad_request");

    let resp = client
        .call(json!({
            "op": "add_rule",
            "interviewer_id": Ulid::new().to_string(),
            "weekday": 0,
            "start_hour": 8,
            "end_hour": 12,
        }))
        .await;
    assert_eq!(error_kind(&resp), "not_found");

    let id = full_week_interviewer(&mut client).await;
    let resp = client
        .call(json!({
            "op": "add_rule",
            "interviewer_id": id,
            "weekday": 9,
            "start_hour": 8,
            "end_hour": 12,
        }))
        .await;
    assert_eq!(error_kind(&resp), "invalid_input");

    let resp = client
        .call(json!({
            "op": "add_blackout",
            "interviewer_id": id,
            "start": "2024-04-01 12:00",
            "end": "2024-04-01 11:00",
        }))
        .await;
    assert_eq!(error_kind(&resp), "invalid_input");

    let resp = client
        .call(json!({"op": "book", "token": "nobody", "start": "2030-01-01 10:00"}))
        .await;
    assert_eq!(error_kind(&resp), "unauthenticated");
    assert!(resp["error"]["message"].as_str().unwrap().len() > 0);
}

#[tokio::test]
async fn oversized_line_is_rejected_and_connection_survives() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let huge = format!("{{\"op\":\"list_interviewers\",\"pad\":\"{}\"}}", "x".repeat(70_000));
    let resp = client.send_raw(&huge).await;
    assert_eq!(error_kind(&resp), "bad_request");

    let list = client.ok(json!({"op": "list_interviewers"})).await;
    assert!(list.as_array().unwrap().is_empty());
}

// ── Candidate flow ───────────────────────────────────────────

#[tokio::test]
async fn availability_then_booking() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let id = full_week_interviewer(&mut client).await;
    register(&mut client, "tok-1").await;

    let days = client.ok(json!({"op": "availability", "token": "tok-1", "window_days": 3})).await;
    let days = days.as_array().unwrap();
    assert!(!days.is_empty());
    for day in days {
        assert!(!day["slots"].as_array().unwrap().is_empty());
    }

    let start = days[0]["slots"][0]["start"].as_str().unwrap().to_string();
    let interview = client.ok(json!({"op": "book", "token": "tok-1", "start": start})).await;
    assert_eq!(interview["interviewer_id"], id.as_str());
    assert_eq!(interview["start"], start.as_str());

    let interviews = client.ok(json!({"op": "interviews", "interviewer_id": id})).await;
    assert_eq!(interviews.as_array().unwrap().len(), 1);

    // the access is spent
    let resp = client.call(json!({"op": "availability", "token": "tok-1"})).await;
    assert_eq!(error_kind(&resp), "already_booked");
    let resp = client.call(json!({"op": "book", "token": "tok-1", "start": start})).await;
    assert_eq!(error_kind(&resp), "already_booked");
}

#[tokio::test]
async fn booked_slot_disappears_for_other_candidates() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    full_week_interviewer(&mut client).await;
    register(&mut client, "first").await;
    register(&mut client, "second").await;

    let start = first_slot_start(&mut client, "first").await;
    client.ok(json!({"op": "book", "token": "first", "start": start})).await;

    assert_ne!(first_slot_start(&mut client, "second").await, start);
    let resp = client.call(json!({"op": "book", "token": "second", "start": start})).await;
    assert_eq!(error_kind(&resp), "no_availability");
}

#[tokio::test]
async fn cancel_frees_slot_but_not_token() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let id = full_week_interviewer(&mut client).await;
    register(&mut client, "tok-a").await;
    register(&mut client, "tok-b").await;

    let start = first_slot_start(&mut client, "tok-a").await;
    let interview = client.ok(json!({"op": "book", "token": "tok-a", "start": start})).await;

    let resp = client.call(json!({"op": "delete_interviewer", "id": id})).await;
    assert_eq!(error_kind(&resp), "has_interviews");

    let cancelled = client
        .ok(json!({"op": "cancel_interview", "id": interview["id"]}))
        .await;
    assert_eq!(cancelled["start"], start.as_str());

    let resp = client.call(json!({"op": "book", "token": "tok-a", "start": start})).await;
    assert_eq!(error_kind(&resp), "already_booked");

    client.ok(json!({"op": "book", "token": "tok-b", "start": start})).await;
}

#[tokio::test]
async fn delete_idle_interviewer() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    let id = full_week_interviewer(&mut client).await;

    client.ok(json!({"op": "delete_interviewer", "id": id})).await;
    let list = client.ok(json!({"op": "list_interviewers"})).await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_across_connections() {
    let (addr, engine) = start_test_server().await;
    let mut admin = Client::connect(addr).await;
    let id = full_week_interviewer(&mut admin).await;
    for i in 0..10 {
        register(&mut admin, &format!("cand-{i}")).await;
    }
    let start = first_slot_start(&mut admin, "cand-0").await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let start = start.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client
                .call(json!({"op": "book", "token": format!("cand-{i}"), "start": start}))
                .await
        }));
    }

    let mut committed = 0;
    for h in handles {
        let resp = h.await.unwrap();
        if resp["ok"] == true {
            committed += 1;
        } else {
            let kind = error_kind(&resp);
            assert!(
                kind == "no_availability" || kind == "reservation_failed",
                "unexpected error {resp}"
            );
        }
    }
    assert_eq!(committed, 1);

    let interviewer_id: Ulid = id.parse().unwrap();
    assert_eq!(engine.get_interviews(interviewer_id).await.unwrap().len(), 1);
}
