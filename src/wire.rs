use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use ulid::Ulid;

use crate::auth::BookendAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::Notice;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// One LISTEN subscription held by a connection.
struct Listener {
    channel: String,
    rx: broadcast::Receiver<Notice>,
}

pub struct BookendHandler {
    tenants: Arc<TenantManager>,
    query_parser: Arc<BookendQueryParser>,
    listeners: Mutex<Vec<Listener>>,
}

impl BookendHandler {
    pub fn new(tenants: Arc<TenantManager>) -> Self {
        Self {
            tenants,
            query_parser: Arc::new(BookendQueryParser),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenants.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Push notices that arrived since the last query to the client. They
    /// ride ahead of the next response on this connection.
    async fn flush_notices<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let pending: Vec<Notice> = {
            let mut listeners = self.listeners.lock().expect("listener lock poisoned");
            let mut out = Vec::new();
            for l in listeners.iter_mut() {
                loop {
                    match l.rx.try_recv() {
                        Ok(notice) => out.push(notice),
                        Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            }
            out
        };
        for notice in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, notice.channel, notice.payload),
                ))
                .await?;
        }
        Ok(())
    }

    async fn run_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertCourt { id, category, label, location } => {
                engine
                    .create_court(id, category, label, location)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateCourt { id, label, location } => {
                engine
                    .update_court(id, label, location)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteCourt { id } => {
                engine.delete_court(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBlackout { id, court_id, start, end, reason } => {
                engine
                    .add_blackout(id, court_id, start, end, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteBlackout { id } => {
                engine.remove_blackout(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertReservation {
                id,
                court_id,
                user_id,
                booked_by,
                start,
                end,
                returning,
            } => {
                let info = engine
                    .book(id, court_id, user_id, booked_by, start, end)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    let schema = Arc::new(reservation_schema());
                    let row = encode_reservation(&schema, &info);
                    Ok(vec![Response::Query(QueryResponse::new(
                        schema,
                        stream::iter(vec![row]),
                    ))])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::CancelReservation { id } => {
                engine.cancel_slot(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertEvent { id, capacity, price, currency, start, end, status } => {
                engine
                    .create_event(id, capacity, price, currency, start, end, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateEvent { id, capacity, price, currency, start, end, status } => {
                engine
                    .update_event(id, capacity, price, currency, start, end, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteEvent { id } => {
                engine.delete_event(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertRegistration { id, event_id, user_id, returning } => {
                let info = engine
                    .register(id, event_id, user_id)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    let schema = Arc::new(registration_schema());
                    let row = encode_registration(&schema, &info);
                    Ok(vec![Response::Query(QueryResponse::new(
                        schema,
                        stream::iter(vec![row]),
                    ))])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::CancelRegistration { id } => {
                engine.cancel_registration(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertPayment {
                id,
                purpose,
                method,
                amount,
                currency,
                registration_id,
                user_id,
                reference,
                returning,
            } => {
                let payment = match purpose {
                    PaymentPurpose::EventPayment => {
                        let reg_id = registration_id
                            .ok_or_else(|| sql_err(SqlError::MissingColumn("registration_id")))?;
                        engine
                            .initiate_event_payment(id, reg_id, method, amount, currency)
                            .await
                            .map_err(engine_err)?
                    }
                    PaymentPurpose::VendorFee => {
                        let payer = user_id
                            .ok_or_else(|| sql_err(SqlError::MissingColumn("user_id")))?;
                        engine
                            .initiate_vendor_fee(id, payer, method, amount, currency, reference)
                            .await
                            .map_err(engine_err)?
                    }
                };
                if returning {
                    let schema = Arc::new(payment_schema());
                    let row = encode_payment(&schema, &payment);
                    Ok(vec![Response::Query(QueryResponse::new(
                        schema,
                        stream::iter(vec![row]),
                    ))])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::ConfirmPayment { external_ref, outcome, returning } => {
                let payment = engine
                    .confirm_external(&external_ref, outcome)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    let schema = Arc::new(payment_schema());
                    let row = encode_payment(&schema, &payment);
                    Ok(vec![Response::Query(QueryResponse::new(
                        schema,
                        stream::iter(vec![row]),
                    ))])
                } else {
                    Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
                }
            }
            Command::InsertLedgerCredit { id, user_id, kind, amount, currency, reference } => {
                engine
                    .credit_wallet(id, user_id, kind, amount, currency, reference)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectCourts => {
                let courts = engine.list_courts().await;
                let schema = Arc::new(court_schema());
                let rows: Vec<PgWireResult<DataRow>> =
                    courts.iter().map(|c| encode_court(&schema, c)).collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSchedule { court_id, from, to } => {
                let items = engine
                    .schedule(court_id, from, to)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(schedule_schema());
                let rows: Vec<PgWireResult<DataRow>> = items
                    .iter()
                    .map(|item| encode_schedule_item(&schema, item))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectReservations { court_id } => {
                let infos = engine
                    .list_reservations(court_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(reservation_schema());
                let rows: Vec<PgWireResult<DataRow>> = infos
                    .iter()
                    .map(|r| encode_reservation(&schema, r))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectEvents => {
                let events = engine.list_events().await;
                let schema = Arc::new(event_schema());
                let rows: Vec<PgWireResult<DataRow>> =
                    events.iter().map(|e| encode_event(&schema, e)).collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectRegistrations { event_id } => {
                let infos = engine
                    .list_registrations(event_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(registration_schema());
                let rows: Vec<PgWireResult<DataRow>> = infos
                    .iter()
                    .map(|r| encode_registration(&schema, r))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectPayments { user_id } => {
                let payments = engine.list_payments(user_id).await;
                let schema = Arc::new(payment_schema());
                let rows: Vec<PgWireResult<DataRow>> =
                    payments.iter().map(|p| encode_payment(&schema, p)).collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBalance { user_id } => {
                let balances = engine.wallet_balances(user_id).await;
                let schema = Arc::new(balance_schema());
                let rows: Vec<PgWireResult<DataRow>> =
                    balances.iter().map(|b| encode_balance(&schema, b)).collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectLedger { user_id } => {
                let entries = engine.ledger_history(user_id).await;
                let schema = Arc::new(ledger_schema());
                let rows: Vec<PgWireResult<DataRow>> = entries
                    .iter()
                    .map(|e| encode_ledger_entry(&schema, e))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                validate_channel(&channel)?;
                let mut listeners = self.listeners.lock().expect("listener lock poisoned");
                if !listeners.iter().any(|l| l.channel == channel) {
                    let rx = engine.notify.subscribe(&channel);
                    listeners.push(Listener { channel, rx });
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.listeners
                    .lock()
                    .expect("listener lock poisoned")
                    .retain(|l| l.channel != channel);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.listeners
                    .lock()
                    .expect("listener lock poisoned")
                    .clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

fn validate_channel(channel: &str) -> PgWireResult<()> {
    let rest = channel
        .strip_prefix("court_")
        .or_else(|| channel.strip_prefix("event_"))
        .or_else(|| channel.strip_prefix("user_"))
        .ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "42000".into(),
                format!("invalid channel: {channel} (expected court_{{id}}, event_{{id}} or user_{{id}})"),
            )))
        })?;
    Ulid::from_string(rest).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })?;
    Ok(())
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn court_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("category"),
        text_field("label"),
        text_field("location"),
    ]
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        text_field("court_id"),
        text_field("kind"),
        text_field("id"),
        int8_field("start"),
        int8_field("end"),
        text_field("detail"),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("court_id"),
        text_field("user_id"),
        text_field("booked_by"),
        int8_field("start"),
        int8_field("end"),
        text_field("status"),
        int8_field("created_at"),
    ]
}

fn event_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        FieldInfo::new("capacity".into(), None, None, Type::INT4, FieldFormat::Text),
        int8_field("price"),
        text_field("currency"),
        int8_field("start"),
        int8_field("end"),
        text_field("status"),
    ]
}

fn registration_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("event_id"),
        text_field("user_id"),
        text_field("status"),
        text_field("payment_status"),
        int8_field("hold_expires_at"),
        text_field("cancel_reason"),
        int8_field("created_at"),
        int8_field("updated_at"),
    ]
}

fn payment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("user_id"),
        text_field("purpose"),
        text_field("event_id"),
        text_field("registration_id"),
        text_field("method"),
        int8_field("amount"),
        text_field("currency"),
        text_field("status"),
        text_field("external_ref"),
        text_field("reference"),
        int8_field("created_at"),
        int8_field("settled_at"),
    ]
}

fn balance_schema() -> Vec<FieldInfo> {
    vec![
        text_field("user_id"),
        text_field("currency"),
        int8_field("balance"),
    ]
}

fn ledger_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("user_id"),
        text_field("kind"),
        int8_field("amount"),
        text_field("currency"),
        text_field("reference"),
        int8_field("created_at"),
    ]
}

// ── Row encoders ─────────────────────────────────────────────────

fn encode_court(schema: &Arc<Vec<FieldInfo>>, c: &CourtInfo) -> PgWireResult<DataRow> {
    let mut enc = DataRowEncoder::new(schema.clone());
    enc.encode_field(&c.id.to_string())?;
    enc.encode_field(&c.category.as_str().to_string())?;
    enc.encode_field(&c.label)?;
    enc.encode_field(&c.location)?;
    Ok(enc.take_row())
}

fn encode_schedule_item(schema: &Arc<Vec<FieldInfo>>, item: &ScheduleItem) -> PgWireResult<DataRow> {
    let mut enc = DataRowEncoder::new(schema.clone());
    enc.encode_field(&item.court_id.to_string())?;
    enc.encode_field(&item.kind.as_str().to_string())?;
    enc.encode_field(&item.kind.item_id().to_string())?;
    enc.encode_field(&item.span.start)?;
    enc.encode_field(&item.span.end)?;
    enc.encode_field(&item.kind.detail().to_string())?;
    Ok(enc.take_row())
}

fn encode_reservation(schema: &Arc<Vec<FieldInfo>>, r: &ReservationInfo) -> PgWireResult<DataRow> {
    let mut enc = DataRowEncoder::new(schema.clone());
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.court_id.to_string())?;
    enc.encode_field(&r.user_id.to_string())?;
    enc.encode_field(&r.booked_by)?;
    enc.encode_field(&r.span.start)?;
    enc.encode_field(&r.span.end)?;
    enc.encode_field(&r.status.as_str().to_string())?;
    enc.encode_field(&r.created_at)?;
    Ok(enc.take_row())
}

fn encode_event(schema: &Arc<Vec<FieldInfo>>, e: &EventInfo) -> PgWireResult<DataRow> {
    let mut enc = DataRowEncoder::new(schema.clone());
    enc.encode_field(&e.id.to_string())?;
    enc.encode_field(&e.capacity.map(|v| v as i32))?;
    enc.encode_field(&e.price_minor)?;
    enc.encode_field(&e.currency)?;
    enc.encode_field(&e.span.start)?;
    enc.encode_field(&e.span.end)?;
    enc.encode_field(&e.status.as_str().to_string())?;
    Ok(enc.take_row())
}

fn encode_registration(schema: &Arc<Vec<FieldInfo>>, r: &RegistrationInfo) -> PgWireResult<DataRow> {
    let mut enc = DataRowEncoder::new(schema.clone());
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.event_id.to_string())?;
    enc.encode_field(&r.user_id.to_string())?;
    enc.encode_field(&r.status.as_str().to_string())?;
    enc.encode_field(&r.payment_status.map(|s| s.as_str().to_string()))?;
    enc.encode_field(&r.hold_expires_at)?;
    enc.encode_field(&r.cancel_reason.map(|c| c.as_str().to_string()))?;
    enc.encode_field(&r.created_at)?;
    enc.encode_field(&r.updated_at)?;
    Ok(enc.take_row())
}

fn encode_payment(schema: &Arc<Vec<FieldInfo>>, p: &Payment) -> PgWireResult<DataRow> {
    let mut enc = DataRowEncoder::new(schema.clone());
    enc.encode_field(&p.id.to_string())?;
    enc.encode_field(&p.user_id.to_string())?;
    enc.encode_field(&p.purpose.as_str().to_string())?;
    enc.encode_field(&p.event_id.map(|u| u.to_string()))?;
    enc.encode_field(&p.registration_id.map(|u| u.to_string()))?;
    enc.encode_field(&p.method.as_str().to_string())?;
    enc.encode_field(&p.amount_minor)?;
    enc.encode_field(&p.currency)?;
    enc.encode_field(&p.status.as_str().to_string())?;
    enc.encode_field(&p.external_ref)?;
    enc.encode_field(&p.reference)?;
    enc.encode_field(&p.created_at)?;
    enc.encode_field(&p.settled_at)?;
    Ok(enc.take_row())
}

fn encode_balance(schema: &Arc<Vec<FieldInfo>>, b: &BalanceInfo) -> PgWireResult<DataRow> {
    let mut enc = DataRowEncoder::new(schema.clone());
    enc.encode_field(&b.user_id.to_string())?;
    enc.encode_field(&b.currency)?;
    enc.encode_field(&b.balance)?;
    Ok(enc.take_row())
}

fn encode_ledger_entry(schema: &Arc<Vec<FieldInfo>>, e: &WalletEntry) -> PgWireResult<DataRow> {
    let mut enc = DataRowEncoder::new(schema.clone());
    enc.encode_field(&e.id.to_string())?;
    enc.encode_field(&e.user_id.to_string())?;
    enc.encode_field(&e.kind.as_str().to_string())?;
    enc.encode_field(&e.amount_minor)?;
    enc.encode_field(&e.currency)?;
    enc.encode_field(&e.reference)?;
    enc.encode_field(&e.created_at)?;
    Ok(enc.take_row())
}

/// Best-effort schema prediction for Describe. Keyed on the table name in
/// the statement text; row-producing statements only.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") && !upper.contains("RETURNING") {
        return vec![];
    }
    if upper.contains("SCHEDULE") {
        schedule_schema()
    } else if upper.contains("WALLET_BALANCE") {
        balance_schema()
    } else if upper.contains("RESERVATIONS") {
        reservation_schema()
    } else if upper.contains("REGISTRATIONS") {
        registration_schema()
    } else if upper.contains("PAYMENTS") {
        payment_schema()
    } else if upper.contains("LEDGER") {
        ledger_schema()
    } else if upper.contains("COURTS") {
        court_schema()
    } else if upper.contains("EVENTS") {
        event_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for BookendHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.flush_notices(client).await?;
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BookendQueryParser;

#[async_trait]
impl QueryParser for BookendQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BookendHandler {
    type Statement = String;
    type QueryParser = BookendQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.flush_notices(client).await?;
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run_command(&engine, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BookendFactory {
    handler: Arc<BookendHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<BookendAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BookendFactory {
    pub fn new(tenants: Arc<TenantManager>, password: String) -> Self {
        let auth_source = BookendAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BookendHandler::new(tenants)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookendFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection to completion. Each connection gets its own
/// handler so LISTEN subscriptions stay connection-local.
pub async fn process_connection(
    socket: TcpStream,
    tenants: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(BookendFactory::new(tenants, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
