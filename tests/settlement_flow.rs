use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use bookend::engine::Policy;
use bookend::gateway::LocalGateway;
use bookend::tenant::TenantManager;
use bookend::wire;

const H: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("bookend_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(
        dir,
        1000,
        Policy::default(),
        Arc::new(LocalGateway),
    ));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "bookend".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_db(
    addr: SocketAddr,
    dbname: &str,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("bookend")
        .password("bookend");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn connect(
    addr: SocketAddr,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    connect_db(addr, "test").await
}

/// Wait for a notification with timeout.
async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

fn data_rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn create_court(client: &tokio_postgres::Client) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO courts (id, category, label) VALUES ('{id}', 'padel', 'Court 1')"
        ))
        .await
        .unwrap();
    id
}

async fn create_event(client: &tokio_postgres::Client, price: i64) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (id, capacity, price, currency, start, "end") VALUES ('{id}', 8, {price}, 'EUR', {start}, {end})"#,
            start = 10 * H,
            end = 14 * H,
        ))
        .await
        .unwrap();
    id
}

async fn credit_wallet(client: &tokio_postgres::Client, user: Ulid, amount: i64) {
    client
        .batch_execute(&format!(
            "INSERT INTO ledger (id, user_id, kind, amount, currency, reference) VALUES ('{}', '{user}', 'credit_adjustment', {amount}, 'EUR', 'opening balance')",
            Ulid::new(),
        ))
        .await
        .unwrap();
}

async fn eur_balance(client: &tokio_postgres::Client, user: Ulid) -> i64 {
    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM wallet_balance WHERE user_id = '{user}'"
            ))
            .await
            .unwrap(),
    );
    rows.iter()
        .find(|r| r.get("currency") == Some("EUR"))
        .and_then(|r| r.get("balance"))
        .map(|b| b.parse().unwrap())
        .unwrap_or(0)
}

// ── Catalog and booking over the wire ────────────────────────

#[tokio::test]
async fn connect_and_query() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO courts (id, category, label, location) VALUES ('{id}', 'tennis', 'Centre Court', 'North Hall')"
        ))
        .await
        .unwrap();

    let rows = data_rows(client.simple_query("SELECT * FROM courts").await.unwrap());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(rows[0].get("category"), Some("tennis"));
    assert_eq!(rows[0].get("label"), Some("Centre Court"));
    assert_eq!(rows[0].get("location"), Some("North Hall"));
}

#[tokio::test]
async fn booking_returns_row() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let court = create_court(&client).await;
    let rid = Ulid::new();
    let rows = data_rows(
        client
            .simple_query(&format!(
                r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{rid}', '{court}', '{}', 'alice', {start}, {end}) RETURNING *"#,
                Ulid::new(),
                start = 10 * H,
                end = 11 * H,
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(rid.to_string().as_str()));
    assert_eq!(rows[0].get("status"), Some("booked"));
    assert_eq!(rows[0].get("booked_by"), Some("alice"));
    assert_eq!(rows[0].get("start"), Some((10 * H).to_string().as_str()));
}

#[tokio::test]
async fn booking_conflict_reports_unavailable() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let court = create_court(&client).await;
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{}', '{court}', '{}', 'alice', {start}, {end})"#,
            Ulid::new(),
            Ulid::new(),
            start = 10 * H,
            end = 12 * H,
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{}', '{court}', '{}', 'bob', {start}, {end})"#,
            Ulid::new(),
            Ulid::new(),
            start = 11 * H,
            end = 13 * H,
        ))
        .await
        .unwrap_err();

    let db_err = err.as_db_error().unwrap();
    assert_eq!(db_err.code(), &SqlState::RAISE_EXCEPTION);
    assert!(db_err.message().contains("slot unavailable"));
}

#[tokio::test]
async fn cancel_booking_frees_slot() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let court = create_court(&client).await;
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{rid}', '{court}', '{}', 'alice', {start}, {end})"#,
            Ulid::new(),
            start = 10 * H,
            end = 11 * H,
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "UPDATE reservations SET status = 'cancelled' WHERE id = '{rid}'"
        ))
        .await
        .unwrap();

    // The window is bookable again.
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{}', '{court}', '{}', 'bob', {start}, {end})"#,
            Ulid::new(),
            Ulid::new(),
            start = 10 * H,
            end = 11 * H,
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_table_reports_syntax_error() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let err = client
        .batch_execute(&format!(
            "INSERT INTO spaceships (id) VALUES ('{}')",
            Ulid::new()
        ))
        .await
        .unwrap_err();

    let db_err = err.as_db_error().unwrap();
    assert_eq!(db_err.code(), &SqlState::SYNTAX_ERROR);
    assert!(db_err.message().contains("unknown table"));
}

#[tokio::test]
async fn schedule_merges_rows_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let court = create_court(&client).await;
    client
        .batch_execute(&format!(
            r#"INSERT INTO blackouts (id, court_id, start, "end", reason) VALUES ('{}', '{court}', {start}, {end}, 'cleaning')"#,
            Ulid::new(),
            start = 8 * H,
            end = 9 * H,
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{}', '{court}', '{}', 'alice', {start}, {end})"#,
            Ulid::new(),
            Ulid::new(),
            start = 10 * H,
            end = 11 * H,
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                r#"SELECT * FROM schedule WHERE court_id = '{court}' AND start >= 0 AND "end" <= {to}"#,
                to = 24 * H,
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("kind"), Some("blackout"));
    assert_eq!(rows[0].get("detail"), Some("cleaning"));
    assert_eq!(rows[1].get("kind"), Some("booked"));
    assert_eq!(rows[1].get("detail"), Some("alice"));
}

// ── Settlement over the wire ─────────────────────────────────

#[tokio::test]
async fn wallet_settlement_flow() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let event = create_event(&client, 2000).await;
    let user = Ulid::new();
    credit_wallet(&client, user, 5000).await;

    // The seat opens as a hold awaiting payment.
    let reg = Ulid::new();
    let rows = data_rows(
        client
            .simple_query(&format!(
                "INSERT INTO registrations (id, event_id, user_id) VALUES ('{reg}', '{event}', '{user}') RETURNING *"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status"), Some("pending"));
    assert_eq!(rows[0].get("payment_status"), None);
    assert!(rows[0].get("hold_expires_at").is_some());

    // Wallet settlement confirms it in one round trip.
    let rows = data_rows(
        client
            .simple_query(&format!(
                "INSERT INTO payments (id, purpose, method, amount, currency, registration_id) VALUES ('{}', 'event_payment', 'wallet', 2000, 'EUR', '{reg}') RETURNING *",
                Ulid::new(),
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status"), Some("succeeded"));
    assert_eq!(rows[0].get("method"), Some("wallet"));
    assert!(rows[0].get("settled_at").is_some());

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM registrations WHERE event_id = '{event}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status"), Some("confirmed"));
    assert_eq!(rows[0].get("payment_status"), Some("succeeded"));

    assert_eq!(eur_balance(&client, user).await, 3000);
}

#[tokio::test]
async fn insufficient_funds_records_failed_attempt() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let event = create_event(&client, 2500).await;
    let user = Ulid::new();
    credit_wallet(&client, user, 1000).await;

    let reg = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO registrations (id, event_id, user_id) VALUES ('{reg}', '{event}', '{user}')"
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!(
            "INSERT INTO payments (id, purpose, method, amount, currency, registration_id) VALUES ('{}', 'event_payment', 'wallet', 2500, 'EUR', '{reg}')",
            Ulid::new(),
        ))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().unwrap();
    assert_eq!(db_err.code(), &SqlState::RAISE_EXCEPTION);
    assert!(db_err.message().contains("insufficient funds"));

    // The refused attempt still left a FAILED row behind.
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM payments WHERE user_id = '{user}'"))
            .await
            .unwrap(),
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("failed"));

    assert_eq!(eur_balance(&client, user).await, 1000);
}

#[tokio::test]
async fn card_payment_webhook_flow() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let event = create_event(&client, 3000).await;
    let user = Ulid::new();
    let reg = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO registrations (id, event_id, user_id) VALUES ('{reg}', '{event}', '{user}')"
        ))
        .await
        .unwrap();

    let rows = data_rows(
        client
            .simple_query(&format!(
                "INSERT INTO payments (id, purpose, method, amount, currency, registration_id) VALUES ('{}', 'event_payment', 'card', 3000, 'EUR', '{reg}') RETURNING *",
                Ulid::new(),
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status"), Some("pending"));
    assert_eq!(rows[0].get("settled_at"), None);
    let external_ref = rows[0].get("external_ref").unwrap().to_string();
    assert!(external_ref.starts_with("pi_"));

    // The gateway's webhook closes it out.
    let rows = data_rows(
        client
            .simple_query(&format!(
                "UPDATE payments SET status = 'succeeded' WHERE external_ref = '{external_ref}' RETURNING *"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status"), Some("succeeded"));
    assert!(rows[0].get("settled_at").is_some());

    let rows = data_rows(
        client
            .simple_query(&format!(
                "SELECT * FROM registrations WHERE event_id = '{event}'"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status"), Some("confirmed"));
}

#[tokio::test]
async fn cancellation_refunds_wallet() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let event = create_event(&client, 1500).await;
    let user = Ulid::new();
    credit_wallet(&client, user, 5000).await;

    let reg = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO registrations (id, event_id, user_id) VALUES ('{reg}', '{event}', '{user}')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO payments (id, purpose, method, amount, currency, registration_id) VALUES ('{}', 'event_payment', 'wallet', 1500, 'EUR', '{reg}')",
            Ulid::new(),
        ))
        .await
        .unwrap();
    assert_eq!(eur_balance(&client, user).await, 3500);

    client
        .batch_execute(&format!(
            "UPDATE registrations SET status = 'cancelled' WHERE id = '{reg}'"
        ))
        .await
        .unwrap();

    assert_eq!(eur_balance(&client, user).await, 5000);
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM ledger WHERE user_id = '{user}'"))
            .await
            .unwrap(),
    );
    let refund = rows
        .iter()
        .find(|r| r.get("kind") == Some("credit_refund"))
        .expect("refund entry should be recorded");
    assert_eq!(refund.get("amount"), Some("1500"));
}

#[tokio::test]
async fn vendor_fee_flow() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let vendor = Ulid::new();
    credit_wallet(&client, vendor, 3000).await;

    let rows = data_rows(
        client
            .simple_query(&format!(
                "INSERT INTO payments (id, purpose, method, amount, currency, registration_id, user_id, reference) VALUES ('{}', 'vendor_fee', 'wallet', 900, 'EUR', NULL, '{vendor}', 'stall 12') RETURNING *",
                Ulid::new(),
            ))
            .await
            .unwrap(),
    );
    assert_eq!(rows[0].get("status"), Some("succeeded"));
    assert_eq!(rows[0].get("purpose"), Some("vendor_fee"));
    assert_eq!(rows[0].get("reference"), Some("stall 12"));

    assert_eq!(eur_balance(&client, vendor).await, 2100);
    let rows = data_rows(
        client
            .simple_query(&format!("SELECT * FROM ledger WHERE user_id = '{vendor}'"))
            .await
            .unwrap(),
    );
    assert!(rows.iter().any(|r| r.get("kind") == Some("debit_vendor_fee")));
}

// ── LISTEN / NOTIFY ──────────────────────────────────────────

#[tokio::test]
async fn listen_delivers_on_next_query() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let court = create_court(&client1).await;
    client1
        .batch_execute(&format!("LISTEN court_{court}"))
        .await
        .unwrap();

    let (client2, _rx2) = connect(addr).await;
    client2
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{}', '{court}', '{}', 'alice', {start}, {end})"#,
            Ulid::new(),
            Ulid::new(),
            start = 10 * H,
            end = 11 * H,
        ))
        .await
        .unwrap();

    // Notices ride ahead of the next response on the listening connection.
    client1.simple_query("SELECT * FROM courts").await.unwrap();

    let notif = recv_notification(&mut rx1, Duration::from_secs(5)).await;
    assert!(notif.is_some(), "expected notification");
    let notif = notif.unwrap();
    assert_eq!(notif.channel(), format!("court_{court}"));

    let parsed: serde_json::Value = serde_json::from_str(notif.payload())
        .expect("notification payload should be valid JSON");
    assert!(parsed.get("ReservationCreated").is_some());
}

#[tokio::test]
async fn listen_user_channel_sees_ledger_credit() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let user = Ulid::new();
    client1
        .batch_execute(&format!("LISTEN user_{user}"))
        .await
        .unwrap();

    let (client2, _rx2) = connect(addr).await;
    credit_wallet(&client2, user, 1000).await;

    client1.simple_query("SELECT * FROM courts").await.unwrap();

    let notif = recv_notification(&mut rx1, Duration::from_secs(5)).await;
    assert!(notif.is_some(), "expected notification");
    let notif = notif.unwrap();
    assert_eq!(notif.channel(), format!("user_{user}"));
    let parsed: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert!(parsed.get("LedgerAppended").is_some());
}

#[tokio::test]
async fn unlisten_stops_delivery() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let court = create_court(&client1).await;
    client1
        .batch_execute(&format!("LISTEN court_{court}"))
        .await
        .unwrap();
    client1
        .batch_execute(&format!("UNLISTEN court_{court}"))
        .await
        .unwrap();

    let (client2, _rx2) = connect(addr).await;
    client2
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{}', '{court}', '{}', 'alice', {start}, {end})"#,
            Ulid::new(),
            Ulid::new(),
            start = 10 * H,
            end = 11 * H,
        ))
        .await
        .unwrap();

    client1.simple_query("SELECT * FROM courts").await.unwrap();

    let notif = recv_notification(&mut rx1, Duration::from_millis(500)).await;
    assert!(notif.is_none(), "should not receive notification after UNLISTEN");
}

#[tokio::test]
async fn unlisten_all_clears_subscriptions() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;

    let court = create_court(&client1).await;
    let event = create_event(&client1, 0).await;
    client1
        .batch_execute(&format!("LISTEN court_{court}"))
        .await
        .unwrap();
    client1
        .batch_execute(&format!("LISTEN event_{event}"))
        .await
        .unwrap();
    client1.batch_execute("UNLISTEN *").await.unwrap();

    let (client2, _rx2) = connect(addr).await;
    client2
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{}', '{court}', '{}', 'alice', {start}, {end})"#,
            Ulid::new(),
            Ulid::new(),
            start = 10 * H,
            end = 11 * H,
        ))
        .await
        .unwrap();
    client2
        .batch_execute(&format!(
            "INSERT INTO registrations (id, event_id, user_id) VALUES ('{}', '{event}', '{}')",
            Ulid::new(),
            Ulid::new(),
        ))
        .await
        .unwrap();

    client1.simple_query("SELECT * FROM courts").await.unwrap();

    let notif = recv_notification(&mut rx1, Duration::from_millis(500)).await;
    assert!(notif.is_none(), "should not receive notifications after UNLISTEN *");
}

#[tokio::test]
async fn listen_rejects_unknown_channel_shape() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let err = client.batch_execute("LISTEN spaceship_42").await.unwrap_err();
    let db_err = err.as_db_error().unwrap();
    assert_eq!(
        db_err.code(),
        &SqlState::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION
    );
}

#[tokio::test]
async fn disconnect_cleans_up() {
    let (addr, _tm) = start_test_server().await;
    let (client1, rx1) = connect(addr).await;

    let court = create_court(&client1).await;
    client1
        .batch_execute(&format!("LISTEN court_{court}"))
        .await
        .unwrap();

    // Drop the subscriber mid-session; the server must shrug it off.
    drop(client1);
    drop(rx1);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (client2, _rx2) = connect(addr).await;
    client2
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, court_id, user_id, booked_by, start, "end") VALUES ('{}', '{court}', '{}', 'alice', {start}, {end})"#,
            Ulid::new(),
            Ulid::new(),
            start = 10 * H,
            end = 11 * H,
        ))
        .await
        .unwrap();
}

// ── Multi-tenancy ────────────────────────────────────────────

#[tokio::test]
async fn tenants_isolated_by_database_name() {
    let (addr, _tm) = start_test_server().await;
    let (alpha, _rx_a) = connect_db(addr, "alpha").await;
    let (beta, _rx_b) = connect_db(addr, "beta").await;

    create_court(&alpha).await;

    let rows = data_rows(alpha.simple_query("SELECT * FROM courts").await.unwrap());
    assert_eq!(rows.len(), 1);
    let rows = data_rows(beta.simple_query("SELECT * FROM courts").await.unwrap());
    assert!(rows.is_empty(), "tenant beta must not see tenant alpha's courts");
}
