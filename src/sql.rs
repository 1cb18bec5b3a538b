use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
///
/// INSERT values are positional; the column list is documentation. RETURNING
/// is honored on the three row-producing inserts and on payment confirmation.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCourt {
        id: Ulid,
        category: CourtCategory,
        label: String,
        location: Option<String>,
    },
    UpdateCourt {
        id: Ulid,
        label: String,
        location: Option<String>,
    },
    DeleteCourt {
        id: Ulid,
    },
    InsertBlackout {
        id: Ulid,
        court_id: Ulid,
        start: Ms,
        end: Ms,
        reason: String,
    },
    DeleteBlackout {
        id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        court_id: Ulid,
        user_id: Ulid,
        booked_by: String,
        start: Ms,
        end: Ms,
        returning: bool,
    },
    CancelReservation {
        id: Ulid,
    },
    InsertEvent {
        id: Ulid,
        capacity: Option<u32>,
        price: i64,
        currency: String,
        start: Ms,
        end: Ms,
        status: EventStatus,
    },
    UpdateEvent {
        id: Ulid,
        capacity: Option<u32>,
        price: i64,
        currency: String,
        start: Ms,
        end: Ms,
        status: EventStatus,
    },
    DeleteEvent {
        id: Ulid,
    },
    InsertRegistration {
        id: Ulid,
        event_id: Ulid,
        user_id: Ulid,
        returning: bool,
    },
    CancelRegistration {
        id: Ulid,
    },
    InsertPayment {
        id: Ulid,
        purpose: PaymentPurpose,
        method: PaymentMethod,
        amount: i64,
        currency: String,
        registration_id: Option<Ulid>,
        user_id: Option<Ulid>,
        reference: Option<String>,
        returning: bool,
    },
    ConfirmPayment {
        external_ref: String,
        outcome: PaymentOutcome,
        returning: bool,
    },
    InsertLedgerCredit {
        id: Ulid,
        user_id: Ulid,
        kind: LedgerKind,
        amount: i64,
        currency: String,
        reference: String,
    },
    SelectCourts,
    SelectSchedule {
        court_id: Ulid,
        from: Ms,
        to: Ms,
    },
    SelectReservations {
        court_id: Ulid,
    },
    SelectEvents,
    SelectRegistrations {
        event_id: Ulid,
    },
    SelectPayments {
        user_id: Option<Ulid>,
    },
    SelectBalance {
        user_id: Ulid,
    },
    SelectLedger {
        user_id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    // Channel names are case-sensitive, so LISTEN/UNLISTEN never go through
    // the identifier-folding parser.
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN ") {
        let target = trimmed[9..].trim().trim_matches(';');
        return Ok(if target == "*" {
            Command::UnlistenAll
        } else {
            Command::Unlisten { channel: target.to_string() }
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, returning, .. } => {
            parse_update(table, assignments, selection, returning.is_some())
        }
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let returning = insert.returning.is_some();
    if returning && !matches!(table.as_str(), "reservations" | "registrations" | "payments") {
        return Err(SqlError::Unsupported(format!("RETURNING on {table}")));
    }

    match table.as_str() {
        "courts" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("courts", 3, values.len()));
            }
            let category = parse_string(&values[1])?;
            Ok(Command::InsertCourt {
                id: parse_ulid(&values[0])?,
                category: CourtCategory::parse(&category)
                    .ok_or_else(|| SqlError::Parse(format!("bad category: {category}")))?,
                label: parse_string(&values[2])?,
                location: if values.len() >= 4 {
                    parse_string_or_null(&values[3])?
                } else {
                    None
                },
            })
        }
        "blackouts" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("blackouts", 5, values.len()));
            }
            Ok(Command::InsertBlackout {
                id: parse_ulid(&values[0])?,
                court_id: parse_ulid(&values[1])?,
                start: parse_i64(&values[2])?,
                end: parse_i64(&values[3])?,
                reason: parse_string(&values[4])?,
            })
        }
        "reservations" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("reservations", 6, values.len()));
            }
            Ok(Command::InsertReservation {
                id: parse_ulid(&values[0])?,
                court_id: parse_ulid(&values[1])?,
                user_id: parse_ulid(&values[2])?,
                booked_by: parse_string(&values[3])?,
                start: parse_i64(&values[4])?,
                end: parse_i64(&values[5])?,
                returning,
            })
        }
        "events" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("events", 6, values.len()));
            }
            let status = if values.len() >= 7 {
                parse_event_status(&values[6])?
            } else {
                EventStatus::Open
            };
            Ok(Command::InsertEvent {
                id: parse_ulid(&values[0])?,
                capacity: parse_u32_or_null(&values[1])?,
                price: parse_i64(&values[2])?,
                currency: parse_string(&values[3])?,
                start: parse_i64(&values[4])?,
                end: parse_i64(&values[5])?,
                status,
            })
        }
        "registrations" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("registrations", 3, values.len()));
            }
            Ok(Command::InsertRegistration {
                id: parse_ulid(&values[0])?,
                event_id: parse_ulid(&values[1])?,
                user_id: parse_ulid(&values[2])?,
                returning,
            })
        }
        "payments" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("payments", 5, values.len()));
            }
            let purpose_str = parse_string(&values[1])?;
            let purpose = PaymentPurpose::parse(&purpose_str)
                .ok_or_else(|| SqlError::Parse(format!("bad purpose: {purpose_str}")))?;
            let method_str = parse_string(&values[2])?;
            let method = PaymentMethod::parse(&method_str)
                .ok_or_else(|| SqlError::Parse(format!("bad method: {method_str}")))?;
            let registration_id = if values.len() >= 6 {
                parse_ulid_or_null(&values[5])?
            } else {
                None
            };
            let user_id = if values.len() >= 7 {
                parse_ulid_or_null(&values[6])?
            } else {
                None
            };
            match purpose {
                PaymentPurpose::EventPayment if registration_id.is_none() => {
                    return Err(SqlError::Parse("event payment requires registration_id".into()));
                }
                PaymentPurpose::VendorFee if user_id.is_none() => {
                    return Err(SqlError::Parse("vendor fee requires user_id".into()));
                }
                _ => {}
            }
            Ok(Command::InsertPayment {
                id: parse_ulid(&values[0])?,
                purpose,
                method,
                amount: parse_i64(&values[3])?,
                currency: parse_string(&values[4])?,
                registration_id,
                user_id,
                reference: if values.len() >= 8 {
                    parse_string_or_null(&values[7])?
                } else {
                    None
                },
                returning,
            })
        }
        "ledger" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("ledger", 6, values.len()));
            }
            let kind_str = parse_string(&values[2])?;
            Ok(Command::InsertLedgerCredit {
                id: parse_ulid(&values[0])?,
                user_id: parse_ulid(&values[1])?,
                kind: LedgerKind::parse(&kind_str)
                    .ok_or_else(|| SqlError::Parse(format!("bad ledger kind: {kind_str}")))?,
                amount: parse_i64(&values[3])?,
                currency: parse_string(&values[4])?,
                reference: parse_string(&values[5])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if returning && table != "payments" {
        return Err(SqlError::Unsupported(format!("RETURNING on {table}")));
    }

    match table.as_str() {
        "courts" => {
            let id = extract_where_id(selection)?;
            let label = find_assignment(assignments, "label")
                .ok_or(SqlError::MissingColumn("label"))
                .and_then(parse_string)?;
            let location = match find_assignment(assignments, "location") {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            Ok(Command::UpdateCourt { id, label, location })
        }
        "events" => {
            let id = extract_where_id(selection)?;
            Ok(Command::UpdateEvent {
                id,
                capacity: find_assignment(assignments, "capacity")
                    .ok_or(SqlError::MissingColumn("capacity"))
                    .and_then(parse_u32_or_null)?,
                price: find_assignment(assignments, "price")
                    .ok_or(SqlError::MissingColumn("price"))
                    .and_then(parse_i64)?,
                currency: find_assignment(assignments, "currency")
                    .ok_or(SqlError::MissingColumn("currency"))
                    .and_then(parse_string)?,
                start: find_assignment(assignments, "start")
                    .ok_or(SqlError::MissingColumn("start"))
                    .and_then(parse_i64)?,
                end: find_assignment(assignments, "end")
                    .ok_or(SqlError::MissingColumn("end"))
                    .and_then(parse_i64)?,
                status: find_assignment(assignments, "status")
                    .ok_or(SqlError::MissingColumn("status"))
                    .and_then(parse_event_status)?,
            })
        }
        "reservations" => {
            let id = extract_where_id(selection)?;
            expect_status_assignment(assignments, "cancelled")?;
            Ok(Command::CancelReservation { id })
        }
        "registrations" => {
            let id = extract_where_id(selection)?;
            expect_status_assignment(assignments, "cancelled")?;
            Ok(Command::CancelRegistration { id })
        }
        "payments" => {
            let external_ref = extract_where_str_eq(selection, "external_ref")?
                .ok_or(SqlError::MissingFilter("external_ref"))?;
            let status = find_assignment(assignments, "status")
                .ok_or(SqlError::MissingColumn("status"))
                .and_then(parse_string)?;
            let outcome = PaymentOutcome::parse(&status)
                .ok_or_else(|| SqlError::Parse(format!("bad payment status: {status}")))?;
            Ok(Command::ConfirmPayment { external_ref, outcome, returning })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "courts" => Ok(Command::DeleteCourt { id }),
        "blackouts" => Ok(Command::DeleteBlackout { id }),
        "events" => Ok(Command::DeleteEvent { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "courts" => Ok(Command::SelectCourts),
        "events" => Ok(Command::SelectEvents),
        "schedule" => {
            let (mut court_id, mut from, mut to) = (None, None, None);
            if let Some(selection) = &select.selection {
                extract_schedule_filters(selection, &mut court_id, &mut from, &mut to)?;
            }
            Ok(Command::SelectSchedule {
                court_id: court_id.ok_or(SqlError::MissingFilter("court_id"))?,
                from: from.ok_or(SqlError::MissingFilter("start"))?,
                to: to.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        "reservations" => {
            let court_id = extract_where_ulid_eq(&select.selection, "court_id")?
                .ok_or(SqlError::MissingFilter("court_id"))?;
            Ok(Command::SelectReservations { court_id })
        }
        "registrations" => {
            let event_id = extract_where_ulid_eq(&select.selection, "event_id")?
                .ok_or(SqlError::MissingFilter("event_id"))?;
            Ok(Command::SelectRegistrations { event_id })
        }
        "payments" => {
            let user_id = extract_where_ulid_eq(&select.selection, "user_id")?;
            Ok(Command::SelectPayments { user_id })
        }
        "wallet_balance" => {
            let user_id = extract_where_ulid_eq(&select.selection, "user_id")?
                .ok_or(SqlError::MissingFilter("user_id"))?;
            Ok(Command::SelectBalance { user_id })
        }
        "ledger" => {
            let user_id = extract_where_ulid_eq(&select.selection, "user_id")?
                .ok_or(SqlError::MissingFilter("user_id"))?;
            Ok(Command::SelectLedger { user_id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_schedule_filters(
    expr: &Expr,
    court_id: &mut Option<Ulid>,
    from: &mut Option<Ms>,
    to: &mut Option<Ms>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_schedule_filters(left, court_id, from, to)?;
                extract_schedule_filters(right, court_id, from, to)?;
            }
            ast::BinaryOperator::Eq => {
                if expr_column_name(left).as_deref() == Some("court_id") {
                    *court_id = Some(parse_ulid_expr(right)?);
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *from = Some(parse_i64_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *to = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn find_assignment<'a>(assignments: &'a [ast::Assignment], col: &str) -> Option<&'a Expr> {
    assignments.iter().find_map(|a| match &a.target {
        ast::AssignmentTarget::ColumnName(name)
            if object_name_last(name).as_deref() == Some(col) =>
        {
            Some(&a.value)
        }
        _ => None,
    })
}

/// The only status transition accepted over the wire is a cancellation.
fn expect_status_assignment(
    assignments: &[ast::Assignment],
    expected: &str,
) -> Result<(), SqlError> {
    let status = find_assignment(assignments, "status")
        .ok_or(SqlError::MissingColumn("status"))
        .and_then(parse_string)?;
    if status != expected {
        return Err(SqlError::Unsupported(format!("status = '{status}'")));
    }
    Ok(())
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    extract_where_ulid_eq(selection, "id")?.ok_or(SqlError::MissingFilter("id"))
}

fn extract_where_ulid_eq(selection: &Option<Expr>, col: &str) -> Result<Option<Ulid>, SqlError> {
    let Some(sel) = selection else { return Ok(None) };
    match sel {
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            if expr_column_name(left).as_deref() == Some(col) {
                Ok(Some(parse_ulid_expr(right)?))
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}

fn extract_where_str_eq(selection: &Option<Expr>, col: &str) -> Result<Option<String>, SqlError> {
    let Some(sel) = selection else { return Ok(None) };
    match sel {
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            if expr_column_name(left).as_deref() == Some(col) {
                Ok(Some(parse_string(right)?))
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?,
            )),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    let v = parse_i64_expr(expr)?;
    u32::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_event_status(expr: &Expr) -> Result<EventStatus, SqlError> {
    let s = parse_string(expr)?;
    EventStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad event status: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
