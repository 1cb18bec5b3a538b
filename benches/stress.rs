use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const HOUR: i64 = 3_600_000; // 1 hour in ms
const QUARTER: i64 = 90 * 24 * HOUR;

async fn connect_to(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("bookend")
        .password("bookend");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    connect_to(host, port, &format!("bench_{}", Ulid::new())).await
}

async fn create_court(client: &tokio_postgres::Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO courts (id, category, label) VALUES ('{id}', 'padel', 'bench court')"
        ))
        .await
        .unwrap();
    id
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let court = create_court(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let bid = Ulid::new();
        let s = (i as i64) * HOUR;
        let e = s + HOUR;
        let t = Instant::now();
        client
            .batch_execute(&format!(
                r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{bid}', '{court}', '{}', 'bench', {s}, {e})"#,
                Ulid::new(),
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();

        handles.push(tokio::spawn(async move {
            // Each task uses its own tenant (unique dbname from connect())
            let client = connect(&host, port).await;
            let court = create_court(&client).await;

            for j in 0..n_per_task {
                let bid = Ulid::new();
                let s = (j as i64) * HOUR;
                let e = s + HOUR;
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{bid}', '{court}', '{}', 'bench', {s}, {e})"#,
                        Ulid::new(),
                    ))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    // Writer tasks: continuously add bookings in the background
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            // Writers use their own tenant to avoid conflicts
            let client = connect(&host, port).await;
            let court = create_court(&client).await;
            let mut i = 0i64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let bid = Ulid::new();
                let s = (w as i64 * 100_000 + i) * HOUR;
                let e = s + HOUR;
                let _ = client
                    .batch_execute(&format!(
                        r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{bid}', '{court}', '{}', 'bench', {s}, {e})"#,
                        Ulid::new(),
                    ))
                    .await;
                i += 1;
            }
        }));
    }

    // Reader tasks: query the schedule and measure latency
    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let court = create_court(&client).await;
            // Add some bookings to make the schedule non-trivial
            for i in 0..50 {
                let bid = Ulid::new();
                let s = (i as i64) * HOUR;
                let e = s + HOUR;
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{bid}', '{court}', '{}', 'bench', {s}, {e})"#,
                        Ulid::new(),
                    ))
                    .await
                    .unwrap();
            }

            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        r#"SELECT * FROM schedule WHERE court_id = '{court}' AND start >= 0 AND "end" <= {QUARTER}"#
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("schedule query", &mut all_latencies);
}

async fn phase4_settlement(host: &str, port: u16) {
    let client = connect(host, port).await;

    let event = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, capacity, price, currency, start, "end") VALUES ('{event}', 5000, 1000, 'EUR', {s}, {e})"#,
            s = 10 * HOUR,
            e = 14 * HOUR,
        ))
        .await
        .unwrap();

    let n = 500;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for _ in 0..n {
        let user = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO ledger (id, user_id, kind, amount, currency, reference) VALUES ('{}', '{user}', 'credit_adjustment', 1000, 'EUR', 'bench topup')",
                Ulid::new(),
            ))
            .await
            .unwrap();
        let reg = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO registrations (id, event_id, user_id) VALUES ('{reg}', '{event}', '{user}')"
            ))
            .await
            .unwrap();

        let t = Instant::now();
        client
            .batch_execute(&format!(
                "INSERT INTO payments (id, purpose, method, amount, currency, registration_id) VALUES ('{}', 'event_payment', 'wallet', 1000, 'EUR', '{reg}')",
                Ulid::new(),
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} seats settled in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("settle latency", &mut latencies);
}

async fn phase5_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    // Storm connections share a small pool of tenants; each brings its own court
    let pool: Vec<String> = (0..8).map(|_| format!("bench_{}", Ulid::new())).collect();

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let dbname = pool[c % pool.len()].clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect_to(&host, port, &dbname).await;
            let court = create_court(&client).await;

            for i in 0..ops_per_conn {
                let bid = Ulid::new();
                let s = (i as i64) * HOUR;
                let e = s + HOUR;
                client
                    .batch_execute(&format!(
                        r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{bid}', '{court}', '{}', 'bench', {s}, {e})"#,
                        Ulid::new(),
                    ))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("BOOKEND_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("BOOKEND_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid BOOKEND_PORT");

    println!("=== bookend stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant (unique dbname) to avoid interference

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] schedule latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] registration settlement throughput");
    phase4_settlement(&host, port).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
