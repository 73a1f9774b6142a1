use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::checkout::CheckoutRequest;
use crate::engine::ReservationFilter;
use crate::model::*;
use crate::policy;

/// LISTEN channels clients may subscribe to.
pub const CHANNELS: [&str; 3] = ["reservations", "closures", "clients"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation {
        submission: Submission,
        /// Present only for staff-entered bookings.
        status: Option<Status>,
        returning: bool,
    },
    UpdateReservation {
        id: Ulid,
        patch: ReservationPatch,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectSlots {
        date: NaiveDate,
    },
    InsertClosure {
        date: NaiveDate,
        kind: ClosureKind,
        note: Option<String>,
    },
    DeleteClosure {
        date: NaiveDate,
    },
    SelectClosures,
    InsertClients {
        rows: Vec<ClientRow>,
    },
    DeleteClient {
        email: String,
    },
    SelectClients,
    ImportClients {
        path: String,
    },
    SyncClients,
    InsertSubscription {
        endpoint: String,
        p256dh: String,
        auth: String,
    },
    DeleteSubscription {
        endpoint: String,
    },
    SelectSubscriptions,
    SelectEmailLog {
        reservation_id: Option<Ulid>,
    },
    InsertCheckout {
        request: CheckoutRequest,
        returning: bool,
    },
    SelectCheckouts,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRow {
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Row shape a command produces, used to describe statements before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSet {
    Reservations,
    ReservationReceipt,
    Slots,
    Closures,
    Clients,
    Subscriptions,
    EmailLog,
    Checkouts,
    CheckoutReceipt,
}

impl Command {
    /// Everything except the public booking form surface needs the admin role.
    pub fn requires_admin(&self) -> bool {
        !matches!(
            self,
            Command::InsertReservation { status: None, .. }
                | Command::SelectSlots { .. }
                | Command::InsertCheckout { .. }
        )
    }
}

fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &sql[keyword.len()..];
    (rest.is_empty() || rest.starts_with(char::is_whitespace)).then_some(rest.trim())
}

fn channel_name(raw: &str) -> Result<String, SqlError> {
    let channel = raw.trim().trim_end_matches(';').trim().trim_matches('"').to_lowercase();
    if CHANNELS.contains(&channel.as_str()) {
        Ok(channel)
    } else {
        Err(SqlError::UnknownChannel(channel))
    }
}

/// `COPY clients FROM '/path/to/file.csv' [options]`
fn parse_copy(rest: &str) -> Result<Command, SqlError> {
    let mut words = rest.splitn(3, char::is_whitespace);
    let table = words.next().unwrap_or("").to_lowercase();
    if table != "clients" {
        return Err(SqlError::Unsupported(format!("COPY {table}")));
    }
    let from = words.next().unwrap_or("");
    if !from.eq_ignore_ascii_case("FROM") {
        return Err(SqlError::Parse("expected COPY clients FROM '<path>'".into()));
    }
    let source = words.next().unwrap_or("").trim();
    let Some(quoted) = source.strip_prefix('\'') else {
        return Err(SqlError::Parse("COPY source must be a quoted server-side path".into()));
    };
    // Doubled quotes are escapes; the first lone quote closes the literal.
    let mut path = String::new();
    let mut chars = quoted.chars().peekable();
    loop {
        match chars.next() {
            Some('\'') if chars.peek() == Some(&'\'') => {
                chars.next();
                path.push('\'');
            }
            Some('\'') => break,
            Some(c) => path.push(c),
            None => return Err(SqlError::Parse("unterminated COPY path".into())),
        }
    }
    if path.is_empty() {
        return Err(SqlError::Parse("empty COPY path".into()));
    }
    Ok(Command::ImportClients { path })
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(rest) = strip_keyword(trimmed, "LISTEN") {
        return Ok(Command::Listen {
            channel: channel_name(rest)?,
        });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN") {
        if rest == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            channel: channel_name(rest)?,
        });
    }
    if let Some(rest) = strip_keyword(trimmed, "COPY") {
        return parse_copy(rest);
    }
    if let Some(rest) = strip_keyword(trimmed, "SYNC") {
        if rest.eq_ignore_ascii_case("CLIENTS") {
            return Ok(Command::SyncClients);
        }
        return Err(SqlError::Unsupported(format!("SYNC {rest}")));
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported(format!("{} statements in one query", stmts.len())));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result shape of a statement that may still contain `$n` placeholders.
pub fn describe(sql: &str) -> Option<ResultSet> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => {
            insert.returning.as_ref()?;
            match insert_table_name(insert).ok()?.as_str() {
                "reservations" => Some(ResultSet::ReservationReceipt),
                "checkouts" => Some(ResultSet::CheckoutReceipt),
                _ => None,
            }
        }
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            let table = table_factor_name(&select.from.first()?.relation).ok()?;
            select_result_set(&table)
        }
        _ => None,
    }
}

fn select_result_set(table: &str) -> Option<ResultSet> {
    match table {
        "reservations" => Some(ResultSet::Reservations),
        "slots" => Some(ResultSet::Slots),
        "closures" => Some(ResultSet::Closures),
        "clients" => Some(ResultSet::Clients),
        "push_subscriptions" => Some(ResultSet::Subscriptions),
        "email_log" => Some(ResultSet::EmailLog),
        "checkouts" => Some(ResultSet::Checkouts),
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column → value for one VALUES row. Columns must be named.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn new(table: &'static str, columns: &[ast::Ident], values: &'a [Expr], allowed: &[&str]) -> Result<Self, SqlError> {
        if columns.is_empty() {
            return Err(SqlError::Parse(format!("INSERT INTO {table} needs an explicit column list")));
        }
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        let mut cells = Vec::with_capacity(columns.len());
        for (col, value) in columns.iter().zip(values) {
            let name = col.value.to_lowercase();
            if !allowed.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(table, name));
            }
            cells.push((name, value));
        }
        Ok(Self { table, cells })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn text(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        self.get(column).map_or(Ok(None), |e| literal(e, column))
    }

    fn required(&self, column: &'static str) -> Result<String, SqlError> {
        self.text(column)?.ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "reservations" => {
            let row = Row::new(
                "reservations",
                &insert.columns,
                single_row(&rows, "reservations")?,
                &["name", "email", "phone", "date", "time", "party_size", "notes", "status"],
            )?;
            let submission = Submission {
                name: row.required("name")?,
                email: row.required("email")?,
                phone: row.text("phone")?,
                date: row.required("date")?,
                time: row.required("time")?,
                party_size: parse_i64(&row.required("party_size")?, "party_size")?,
                notes: row.text("notes")?,
            };
            let status = row
                .text("status")?
                .map(|s| s.parse::<Status>().map_err(|e| SqlError::BadValue("status", e)))
                .transpose()?;
            Ok(Command::InsertReservation {
                submission,
                status,
                returning,
            })
        }
        "closures" => {
            let row = Row::new("closures", &insert.columns, single_row(&rows, "closures")?, &["date", "kind", "note"])?;
            let kind = match row.text("kind")? {
                Some(k) => k.parse().map_err(|e| SqlError::BadValue("kind", e))?,
                None => ClosureKind::Closed,
            };
            Ok(Command::InsertClosure {
                date: parse_date(&row.required("date")?)?,
                kind,
                note: row.text("note")?,
            })
        }
        "clients" => {
            let mut out = Vec::with_capacity(rows.len());
            for values in &rows {
                let row = Row::new("clients", &insert.columns, values, &["email", "name", "phone"])?;
                out.push(ClientRow {
                    email: row.required("email")?,
                    name: row.text("name")?,
                    phone: row.text("phone")?,
                });
            }
            Ok(Command::InsertClients { rows: out })
        }
        "push_subscriptions" => {
            let row = Row::new(
                "push_subscriptions",
                &insert.columns,
                single_row(&rows, "push_subscriptions")?,
                &["endpoint", "p256dh", "auth"],
            )?;
            Ok(Command::InsertSubscription {
                endpoint: row.required("endpoint")?,
                p256dh: row.required("p256dh")?,
                auth: row.required("auth")?,
            })
        }
        "checkouts" => {
            let row = Row::new(
                "checkouts",
                &insert.columns,
                single_row(&rows, "checkouts")?,
                &["email", "description", "amount_cents", "quantity"],
            )?;
            let quantity = match row.text("quantity")? {
                Some(q) => u32::try_from(parse_i64(&q, "quantity")?)
                    .map_err(|_| SqlError::BadValue("quantity", format!("{q} out of range")))?,
                None => 1,
            };
            Ok(Command::InsertCheckout {
                request: CheckoutRequest {
                    email: row.required("email")?,
                    description: row.required("description")?,
                    amount_cents: parse_i64(&row.required("amount_cents")?, "amount_cents")?,
                    quantity,
                },
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn single_row<'a>(rows: &'a [Vec<Expr>], table: &'static str) -> Result<&'a [Expr], SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "reservations" {
        return Err(SqlError::Unsupported(format!("UPDATE {table}")));
    }
    let id = parse_ulid(&where_eq(selection, "id")?, "id")?;

    let mut patch = ReservationPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Parse("unsupported SET target".into()))?;
        let value = &assignment.value;
        match column.as_str() {
            "name" => patch.name = Some(non_null(value, "name")?),
            "email" => patch.email = Some(non_null(value, "email")?),
            "phone" => patch.phone = Some(literal(value, "phone")?),
            "date" => patch.date = Some(non_null(value, "date")?),
            "time" => patch.time = Some(non_null(value, "time")?),
            "party_size" => patch.party_size = Some(parse_i64(&non_null(value, "party_size")?, "party_size")?),
            "notes" => patch.notes = Some(literal(value, "notes")?),
            "status" => {
                let status = non_null(value, "status")?;
                patch.status = Some(status.parse().map_err(|e| SqlError::BadValue("status", e))?);
            }
            _ => return Err(SqlError::UnknownColumn("reservations", column)),
        }
    }
    Ok(Command::UpdateReservation { id, patch })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let selection = &delete.selection;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation {
            id: parse_ulid(&where_eq(selection, "id")?, "id")?,
        }),
        "closures" => Ok(Command::DeleteClosure {
            date: parse_date(&where_eq(selection, "date")?)?,
        }),
        "clients" => Ok(Command::DeleteClient {
            email: where_eq(selection, "email")?,
        }),
        "push_subscriptions" => Ok(Command::DeleteSubscription {
            endpoint: where_eq(selection, "endpoint")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// One `column <op> literal` term of an AND-only WHERE clause.
#[derive(Debug)]
struct Predicate {
    column: String,
    op: ast::BinaryOperator,
    value: String,
}

fn collect_predicates(expr: &Expr, out: &mut Vec<Predicate>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("WHERE term {expr}")))?;
            let value = literal(right, "filter")?
                .ok_or_else(|| SqlError::Unsupported(format!("NULL comparison on {column}")))?;
            out.push(Predicate {
                column,
                op: op.clone(),
                value,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE term {other}"))),
    }
}

fn predicates(selection: &Option<Expr>) -> Result<Vec<Predicate>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_predicates(expr, &mut out)?;
    }
    Ok(out)
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let preds = predicates(&select.selection)?;
    use ast::BinaryOperator::{Eq, Gt, GtEq, Lt, LtEq};

    let no_filters = |cmd: Command| {
        if preds.is_empty() {
            Ok(cmd)
        } else {
            Err(SqlError::Unsupported(format!("WHERE on {table}")))
        }
    };

    match table.as_str() {
        "reservations" => {
            let mut filter = ReservationFilter::default();
            for p in &preds {
                match (p.column.as_str(), &p.op) {
                    ("id", Eq) => filter.id = Some(parse_ulid(&p.value, "id")?),
                    ("date", Eq) => filter.date = Some(parse_date(&p.value)?),
                    ("date", GtEq) => filter.from = Some(parse_date(&p.value)?),
                    ("date", Gt) => {
                        let after = parse_date(&p.value)?;
                        let from = after.succ_opt().ok_or_else(|| {
                            SqlError::BadValue("date", format!("no date after {after}"))
                        })?;
                        filter.from = Some(from);
                    }
                    ("date", LtEq) => filter.to = Some(parse_date(&p.value)?),
                    ("date", Lt) => {
                        let before = parse_date(&p.value)?;
                        let to = before.pred_opt().ok_or_else(|| {
                            SqlError::BadValue("date", format!("no date before {before}"))
                        })?;
                        filter.to = Some(to);
                    }
                    ("status", Eq) => {
                        filter.status = Some(p.value.parse().map_err(|e| SqlError::BadValue("status", e))?)
                    }
                    ("email", Eq) => filter.email = Some(crate::clients::normalize_email(&p.value)),
                    (col, op) => return Err(SqlError::Unsupported(format!("filter {col} {op}"))),
                }
            }
            Ok(Command::SelectReservations { filter })
        }
        "slots" => {
            let date = preds
                .iter()
                .find(|p| p.column == "date" && p.op == Eq)
                .ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectSlots {
                date: parse_date(&date.value)?,
            })
        }
        "email_log" => {
            let mut reservation_id = None;
            for p in &preds {
                match (p.column.as_str(), &p.op) {
                    ("reservation_id", Eq) => reservation_id = Some(parse_ulid(&p.value, "reservation_id")?),
                    (col, op) => return Err(SqlError::Unsupported(format!("filter {col} {op}"))),
                }
            }
            Ok(Command::SelectEmailLog { reservation_id })
        }
        "closures" => no_filters(Command::SelectClosures),
        "clients" => no_filters(Command::SelectClients),
        "push_subscriptions" => no_filters(Command::SelectSubscriptions),
        "checkouts" => no_filters(Command::SelectCheckouts),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// The literal in `WHERE <column> = <literal>`, the only shape keyed writes accept.
fn where_eq(selection: &Option<Expr>, column: &'static str) -> Result<String, SqlError> {
    let preds = predicates(selection)?;
    match preds.as_slice() {
        [p] if p.column == column && p.op == ast::BinaryOperator::Eq => Ok(p.value.clone()),
        _ => Err(SqlError::MissingFilter(column)),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// Literal as text; `None` for NULL. Casts such as `'2026-10-20'::date` are looked through.
fn literal(expr: &Expr, column: &'static str) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) | Value::Number(s, _) => {
                Ok(Some(s.clone()))
            }
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::BadValue(column, format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(literal(expr, column)?.map(|s| format!("-{s}"))),
        Expr::Cast { expr, .. } | Expr::Nested(expr) => literal(expr, column),
        other => Err(SqlError::BadValue(column, format!("expected a literal, got {other}"))),
    }
}

fn non_null(expr: &Expr, column: &'static str) -> Result<String, SqlError> {
    literal(expr, column)?.ok_or(SqlError::BadValue(column, "may not be NULL".into()))
}

fn parse_i64(s: &str, column: &'static str) -> Result<i64, SqlError> {
    s.trim()
        .parse()
        .map_err(|_| SqlError::BadValue(column, format!("expected an integer, got {s:?}")))
}

fn parse_ulid(s: &str, column: &'static str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::BadValue(column, format!("bad ULID: {e}")))
}

fn parse_date(s: &str) -> Result<NaiveDate, SqlError> {
    policy::parse_date(s).map_err(|e| SqlError::BadValue("date", e))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    UnknownChannel(String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    BadValue(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {c} in {t}"),
            SqlError::UnknownChannel(c) => {
                write!(f, "unknown channel: {c} (expected one of {})", CHANNELS.join(", "))
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: column {c} is required"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue(col, msg) => write!(f, "bad value for {col}: {msg}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn date(s: &str) -> NaiveDate {
        policy::parse_date(s).unwrap()
    }

    #[test]
    fn parse_guest_submission() {
        let sql = "INSERT INTO reservations (name, email, phone, date, time, party_size, notes) \
                   VALUES ('Ada O''Brien', 'ada@example.com', NULL, '2026-10-20', '19:30', 4, 'window') RETURNING id, status";
        match parse_sql(sql).unwrap() {
            Command::InsertReservation {
                submission,
                status,
                returning,
            } => {
                assert_eq!(submission.name, "Ada O'Brien");
                assert_eq!(submission.phone, None);
                assert_eq!(submission.party_size, 4);
                assert_eq!(submission.notes.as_deref(), Some("window"));
                assert_eq!(status, None);
                assert!(returning);
            }
            other => panic!("expected InsertReservation, got {other:?}"),
        }
    }

    #[test]
    fn column_order_is_free() {
        let sql = "INSERT INTO reservations (party_size, time, date, email, name) VALUES ('2', '12:30', '2026-10-20', 'a@b.co', 'A')";
        let Command::InsertReservation { submission, .. } = parse_sql(sql).unwrap() else {
            panic!("expected InsertReservation");
        };
        assert_eq!(submission.party_size, 2);
        assert_eq!(submission.time, "12:30");
    }

    #[test]
    fn staff_booking_needs_admin() {
        let guest = parse_sql(
            "INSERT INTO reservations (name, email, date, time, party_size) VALUES ('A', 'a@b.co', '2026-10-20', '20:00', 2)",
        )
        .unwrap();
        assert!(!guest.requires_admin());

        let staff = parse_sql(
            "INSERT INTO reservations (name, email, date, time, party_size, status) VALUES ('A', 'a@b.co', '2026-10-20', '20:00', 2, 'pending')",
        )
        .unwrap();
        assert!(matches!(staff, Command::InsertReservation { status: Some(Status::Pending), .. }));
        assert!(staff.requires_admin());
        assert!(parse_sql("SELECT * FROM reservations").unwrap().requires_admin());
        assert!(!parse_sql("SELECT * FROM slots WHERE date = '2026-10-20'").unwrap().requires_admin());
    }

    #[test]
    fn insert_errors() {
        assert!(matches!(
            parse_sql("INSERT INTO reservations VALUES ('A')"),
            Err(SqlError::Parse(_))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO reservations (name, email) VALUES ('A', 'a@b.co')"),
            Err(SqlError::MissingColumn("reservations", "date"))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO reservations (name, table_no) VALUES ('A', 4)"),
            Err(SqlError::UnknownColumn("reservations", _))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO reservations (name, email) VALUES ('A')"),
            Err(SqlError::WrongArity("reservations", 2, 1))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO reservations (name, email, date, time, party_size) VALUES ('A', 'a@b.co', '2026-10-20', '20:00', 'two')"),
            Err(SqlError::BadValue("party_size", _))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO tables (id) VALUES (1)"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_update_reservation() {
        let sql = format!("UPDATE reservations SET status = 'confirmed', notes = NULL, party_size = 6 WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateReservation { id, patch } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(patch.status, Some(Status::Confirmed));
                assert_eq!(patch.notes, Some(None));
                assert_eq!(patch.party_size, Some(6));
                assert_eq!(patch.name, None);
            }
            other => panic!("expected UpdateReservation, got {other:?}"),
        }
        assert!(matches!(
            parse_sql("UPDATE reservations SET status = 'confirmed'"),
            Err(SqlError::MissingFilter("id"))
        ));
        assert!(matches!(
            parse_sql(&format!("UPDATE reservations SET status = 'maybe' WHERE id = '{ID}'")),
            Err(SqlError::BadValue("status", _))
        ));
    }

    #[test]
    fn parse_deletes() {
        assert!(matches!(
            parse_sql(&format!("DELETE FROM reservations WHERE id = '{ID}'")).unwrap(),
            Command::DeleteReservation { .. }
        ));
        assert_eq!(
            parse_sql("DELETE FROM closures WHERE date = '2026-12-25'").unwrap(),
            Command::DeleteClosure { date: date("2026-12-25") }
        );
        assert_eq!(
            parse_sql("DELETE FROM clients WHERE email = 'ada@example.com'").unwrap(),
            Command::DeleteClient { email: "ada@example.com".into() }
        );
        assert!(matches!(
            parse_sql("DELETE FROM clients WHERE name = 'Ada'"),
            Err(SqlError::MissingFilter("email"))
        ));
    }

    #[test]
    fn parse_reservation_filters() {
        let sql = "SELECT * FROM reservations WHERE date >= '2026-10-01' AND date < '2026-11-01' AND status = 'pending'";
        let Command::SelectReservations { filter } = parse_sql(sql).unwrap() else {
            panic!("expected SelectReservations");
        };
        assert_eq!(filter.from, Some(date("2026-10-01")));
        assert_eq!(filter.to, Some(date("2026-10-31")));
        assert_eq!(filter.status, Some(Status::Pending));

        let sql = "SELECT * FROM reservations WHERE email = 'ADA@example.com'";
        let Command::SelectReservations { filter } = parse_sql(sql).unwrap() else {
            panic!("expected SelectReservations");
        };
        assert_eq!(filter.email.as_deref(), Some("ada@example.com"));

        assert!(parse_sql("SELECT * FROM reservations WHERE party_size > 4").is_err());
        assert!(parse_sql("SELECT * FROM closures WHERE date = '2026-12-25'").is_err());
    }

    #[test]
    fn parse_slots_requires_date() {
        assert_eq!(
            parse_sql("SELECT * FROM slots WHERE date = '2026-10-20'::date").unwrap(),
            Command::SelectSlots { date: date("2026-10-20") }
        );
        assert!(matches!(parse_sql("SELECT * FROM slots"), Err(SqlError::MissingFilter("date"))));
    }

    #[test]
    fn parse_closure_insert() {
        assert_eq!(
            parse_sql("INSERT INTO closures (date, kind, note) VALUES ('2026-12-25', 'blocked', 'Christmas')").unwrap(),
            Command::InsertClosure {
                date: date("2026-12-25"),
                kind: ClosureKind::Closed,
                note: Some("Christmas".into()),
            }
        );
        assert!(matches!(
            parse_sql("INSERT INTO closures (date, kind) VALUES ('2026-12-25', 'sometimes')"),
            Err(SqlError::BadValue("kind", _))
        ));
    }

    #[test]
    fn parse_multi_row_clients() {
        let sql = "INSERT INTO clients (email, name) VALUES ('a@example.com', 'A'), ('b@example.com', NULL)";
        let Command::InsertClients { rows } = parse_sql(sql).unwrap() else {
            panic!("expected InsertClients");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].name, None);
        assert!(matches!(
            parse_sql("INSERT INTO closures (date) VALUES ('2026-12-25'), ('2026-12-26')"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_checkout_insert() {
        let sql = "INSERT INTO checkouts (email, description, amount_cents) VALUES ('a@example.com', 'Gift voucher', 5000) RETURNING *";
        let cmd = parse_sql(sql).unwrap();
        assert!(!cmd.requires_admin());
        match cmd {
            Command::InsertCheckout { request, returning } => {
                assert_eq!(request.amount_cents, 5000);
                assert_eq!(request.quantity, 1);
                assert!(returning);
            }
            other => panic!("expected InsertCheckout, got {other:?}"),
        }
    }

    #[test]
    fn parse_prefix_commands() {
        assert_eq!(
            parse_sql("LISTEN reservations;").unwrap(),
            Command::Listen { channel: "reservations".into() }
        );
        assert_eq!(parse_sql("unlisten *").unwrap(), Command::UnlistenAll);
        assert!(matches!(parse_sql("LISTEN bookings"), Err(SqlError::UnknownChannel(_))));
        assert_eq!(parse_sql("SYNC CLIENTS").unwrap(), Command::SyncClients);
        assert_eq!(
            parse_sql("COPY clients FROM '/tmp/it''s.csv' WITH (FORMAT csv)").unwrap(),
            Command::ImportClients { path: "/tmp/it's.csv".into() }
        );
        assert!(parse_sql("COPY reservations FROM '/tmp/x.csv'").is_err());
        assert!(parse_sql("COPY clients FROM STDIN").is_err());
        // A column that merely starts with a keyword is not a prefix command
        assert!(matches!(parse_sql("LISTENER"), Err(SqlError::Parse(_))));
    }

    #[test]
    fn describe_shapes() {
        assert_eq!(describe("SELECT * FROM reservations WHERE id = $1"), Some(ResultSet::Reservations));
        assert_eq!(describe("SELECT * FROM slots WHERE date = $1"), Some(ResultSet::Slots));
        assert_eq!(
            describe("INSERT INTO reservations (name) VALUES ($1) RETURNING id"),
            Some(ResultSet::ReservationReceipt)
        );
        assert_eq!(describe("INSERT INTO reservations (name) VALUES ($1)"), None);
        assert_eq!(describe("DELETE FROM clients WHERE email = $1"), None);
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn batches_are_rejected_whole() {
        let sql = format!(
            "UPDATE reservations SET status = 'confirmed' WHERE id = '{ID}'; \
             UPDATE reservations SET status = 'declined' WHERE id = '{ID}'"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
        // A single statement with a trailing semicolon is still one statement
        assert!(parse_sql("SELECT * FROM closures;").is_ok());
    }

    #[test]
    fn open_date_bounds_past_the_calendar_are_bad_values() {
        let max = NaiveDate::MAX.format("%Y-%m-%d");
        let min = NaiveDate::MIN.format("%Y-%m-%d");
        let after_max = format!("SELECT * FROM reservations WHERE date > '{max}'");
        let before_min = format!("SELECT * FROM reservations WHERE date < '{min}'");
        assert!(matches!(parse_sql(&after_max), Err(SqlError::BadValue("date", _))));
        assert!(matches!(parse_sql(&before_min), Err(SqlError::BadValue("date", _))));

        let inclusive = format!("SELECT * FROM reservations WHERE date <= '{max}'");
        let Command::SelectReservations { filter } = parse_sql(&inclusive).unwrap() else {
            panic!("expected SelectReservations");
        };
        assert_eq!(filter.to, Some(NaiveDate::MAX));
    }
}
