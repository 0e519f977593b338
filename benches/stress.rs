use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::TimeZone;
use chrono_tz::America::Santiago;
use ulid::Ulid;

use interviewd::config::SchedulerConfig;
use interviewd::engine::Engine;
use interviewd::model::{Span, Timestamp};

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Saturday morning; the booking window opens Sunday 10:00.
fn now() -> Timestamp {
    Santiago.with_ymd_and_hms(2024, 3, 30, 9, 0, 0).unwrap()
}

fn fresh_engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("interviewd_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    Arc::new(Engine::new(dir.join(name), SchedulerConfig::default()).unwrap())
}

/// Interviewers working 08:00-18:00 every day, with a blackout each.
async fn setup(engine: &Engine, n_interviewers: usize, n_candidates: usize) {
    for i in 0..n_interviewers {
        let id = Ulid::new();
        engine.create_interviewer(id, Some(format!("interviewer-{i}"))).await.unwrap();
        for weekday in 0..7 {
            engine
                .add_rule(Ulid::new(), id, weekday, (8, 0), (18, 0))
                .await
                .unwrap();
        }
        let day = 1 + (i as u32 % 5);
        let span = Span::new(
            Santiago.with_ymd_and_hms(2024, 4, day, 12, 0, 0).unwrap(),
            Santiago.with_ymd_and_hms(2024, 4, day, 14, 0, 0).unwrap(),
        );
        engine.add_blackout(Ulid::new(), id, span, "lunch".into()).await.unwrap();
    }
    for i in 0..n_candidates {
        engine.register_candidate(Ulid::new(), format!("cand-{i}")).await.unwrap();
    }
    println!("  created {n_interviewers} interviewers, {n_candidates} candidates");
}

async fn phase1_availability(engine: &Engine) {
    let n = 200;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    let mut slots = 0;
    for i in 0..n {
        let t = Instant::now();
        let days = engine
            .get_availability(&format!("cand-{i}"), 8, now())
            .await
            .unwrap();
        latencies.push(t.elapsed());
        slots = days.iter().map(|d| d.slots.len()).sum();
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} queries ({slots} slots each) in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("availability latency", &mut latencies);
}

async fn phase2_spread_bookings(engine: Arc<Engine>, n_candidates: usize) {
    // candidates spread over the first 20 slots, so every slot is contended
    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_candidates {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let token = format!("cand-{i}");
            let days = engine.get_availability(&token, 8, now()).await.ok()?;
            let offset = i % 20;
            let slot = days.iter().flat_map(|d| d.slots.iter()).nth(offset)?.start;
            let t = Instant::now();
            let result = engine.book_slot(&token, slot, now()).await;
            Some((t.elapsed(), result.is_ok()))
        }));
    }

    let mut latencies = Vec::new();
    let mut committed = 0;
    let mut rejected = 0;
    for h in handles {
        if let Some((latency, ok)) = h.await.unwrap() {
            latencies.push(latency);
            if ok {
                committed += 1;
            } else {
                rejected += 1;
            }
        }
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_candidates} candidates: {committed} committed, {rejected} rejected in {:.2}s",
        elapsed.as_secs_f64()
    );
    print_latency("book latency", &mut latencies);
}

async fn phase3_single_slot_storm(n_interviewers: usize, n_candidates: usize) {
    let engine = fresh_engine("storm.wal");
    setup(&engine, n_interviewers, n_candidates).await;
    let slot = Santiago.with_ymd_and_hms(2024, 4, 1, 10, 0, 0).unwrap();

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_candidates {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let t = Instant::now();
            let result = engine.book_slot(&format!("cand-{i}"), slot, now()).await;
            (t.elapsed(), result.is_ok())
        }));
    }
    let mut latencies = Vec::new();
    let mut committed = 0;
    for h in handles {
        let (latency, ok) = h.await.unwrap();
        latencies.push(latency);
        committed += usize::from(ok);
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_candidates} candidates on one slot, {n_interviewers} interviewers: {committed} committed in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert!(committed <= n_interviewers, "an interviewer was double-booked");
    print_latency("contended book latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== interviewd stress benchmark ===\n");

    println!("[setup]");
    let engine = fresh_engine("bench.wal");
    setup(&engine, 50, 2000).await;

    println!("\n[phase 1] availability latency");
    phase1_availability(&engine).await;

    println!("\n[phase 2] concurrent bookings over spread slots");
    phase2_spread_bookings(engine.clone(), 1000).await;

    println!("\n[phase 3] single slot storm");
    phase3_single_slot_storm(5, 200).await;

    println!("\n=== benchmark complete ===");
}
