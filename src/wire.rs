use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::auth::{Credentials, Role, TavolaAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify;
use crate::observability;
use crate::policy::Slot;
use crate::sql::{self, Command, ResultSet, SqlError};

/// Process id reported in NOTIFY messages; unique per connection.
static NEXT_BACKEND_PID: AtomicI32 = AtomicI32::new(1);

fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub struct TavolaHandler {
    engine: Arc<Engine>,
    query_parser: Arc<TavolaQueryParser>,
    backend_pid: i32,
    /// LISTEN subscriptions of this connection.
    listeners: Mutex<Vec<(String, broadcast::Receiver<Event>)>>,
}

impl TavolaHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(TavolaQueryParser),
            backend_pid: NEXT_BACKEND_PID.fetch_add(1, Ordering::Relaxed),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn resolve_role<C: ClientInfo>(&self, client: &C) -> PgWireResult<Role> {
        let user = client.metadata().get("user").map(String::as_str).unwrap_or_default();
        Role::from_user(user).ok_or_else(|| user_error("28000", format!("role \"{user}\" does not exist")))
    }

    /// Parse, authorize and run one statement, recording query metrics.
    async fn run(&self, role: Role, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        if cmd.requires_admin() && role != Role::Admin {
            return Err(user_error(
                "42501",
                format!("permission denied for role {}", role.as_str()),
            ));
        }
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertReservation {
                submission,
                status,
                returning,
            } => {
                let r = match status {
                    None => engine.submit_reservation(&submission, local_now()).await,
                    Some(status) => engine.record_staff_booking(&submission, status).await,
                }
                .map_err(engine_err)?;
                if returning {
                    Ok(rows(ResultSet::ReservationReceipt, &[r], encode_receipt))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::UpdateReservation { id, patch } => {
                engine.update_reservation(id, &patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteReservation { id } => {
                engine.delete_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations { filter } => {
                let found = engine.reservations(&filter).await;
                Ok(rows(ResultSet::Reservations, &found, encode_reservation))
            }
            Command::SelectSlots { date } => {
                let slots = engine.slots(date, local_now());
                let dated: Vec<_> = slots.into_iter().map(|s| (date, s)).collect();
                Ok(rows(ResultSet::Slots, &dated, encode_slot))
            }
            Command::InsertClosure { date, kind, note } => {
                engine.set_closure(date, kind, note).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteClosure { date } => {
                engine.remove_closure(date).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectClosures => Ok(rows(ResultSet::Closures, &engine.closures(), encode_closure)),
            Command::InsertClients { rows: clients } => {
                for row in &clients {
                    engine
                        .upsert_client(&row.email, row.name.as_deref(), row.phone.as_deref())
                        .await
                        .map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(clients.len())))
            }
            Command::DeleteClient { email } => {
                engine.remove_client(&email).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectClients => Ok(rows(ResultSet::Clients, &engine.clients(), encode_client)),
            Command::ImportClients { path } => {
                let report = engine
                    .import_clients_csv(Path::new(&path))
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("COPY").with_rows(report.imported + report.merged)))
            }
            Command::SyncClients => {
                let report = engine.sync_clients_from_email_history().await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("SYNC").with_rows(report.imported + report.merged)))
            }
            Command::InsertSubscription { endpoint, p256dh, auth } => {
                engine
                    .add_subscription(&endpoint, &p256dh, &auth)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteSubscription { endpoint } => {
                engine.remove_subscription(&endpoint).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSubscriptions => Ok(rows(
                ResultSet::Subscriptions,
                &engine.subscriptions(),
                encode_subscription,
            )),
            Command::SelectEmailLog { reservation_id } => Ok(rows(
                ResultSet::EmailLog,
                &engine.email_log(reservation_id),
                encode_email,
            )),
            Command::InsertCheckout { request, returning } => {
                let checkout = engine.create_checkout(request).await.map_err(engine_err)?;
                if returning {
                    Ok(rows(ResultSet::CheckoutReceipt, &[checkout], encode_checkout_receipt))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::SelectCheckouts => Ok(rows(ResultSet::Checkouts, &engine.checkouts(), encode_checkout)),
            Command::Listen { channel } => {
                let mut listeners = self.listeners.lock().await;
                if !listeners.iter().any(|(c, _)| *c == channel) {
                    let rx = engine.notify.subscribe(&channel);
                    listeners.push((channel, rx));
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.listeners.lock().await.retain(|(c, _)| *c != channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listeners.lock().await.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    /// Send pending NOTIFY messages ahead of the statement's own response.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut listeners = self.listeners.lock().await;
            let mut pending = Vec::new();
            for (channel, rx) in listeners.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => pending.push((channel.clone(), notify::payload(&event))),
                        Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                            warn!("listener on {channel} lagged, {missed} notifications dropped");
                        }
                        Err(_) => break,
                    }
                }
            }
            pending
        };
        for (channel, payload) in pending {
            debug!("notify {channel}: {payload}");
            client
                .feed(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    self.backend_pid,
                    channel,
                    payload,
                )))
                .await?;
        }
        Ok(())
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int4(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn schema(set: ResultSet) -> Vec<FieldInfo> {
    match set {
        ResultSet::Reservations => vec![
            text("id"),
            text("name"),
            text("email"),
            text("phone"),
            text("date"),
            text("time"),
            int4("party_size"),
            text("notes"),
            text("status"),
            text("review_reason"),
            text("origin"),
            int8("confirmation_sent_at"),
            int8("created_at"),
            int8("updated_at"),
        ],
        ResultSet::ReservationReceipt => vec![text("id"), text("status"), text("review_reason")],
        ResultSet::Slots => vec![text("date"), text("time"), text("service"), text("mode")],
        ResultSet::Closures => vec![text("date"), text("kind"), text("note")],
        ResultSet::Clients => vec![
            text("email"),
            text("name"),
            text("phone"),
            text("source"),
            int4("bookings"),
            text("last_visit"),
            int8("first_seen"),
            int8("updated_at"),
        ],
        ResultSet::Subscriptions => vec![text("endpoint"), int8("created_at")],
        ResultSet::EmailLog => vec![
            text("id"),
            text("reservation_id"),
            text("template"),
            text("recipient"),
            text("status"),
            text("provider_id"),
            text("error"),
            int8("at"),
        ],
        ResultSet::Checkouts => vec![
            text("id"),
            text("email"),
            text("description"),
            int8("amount_cents"),
            int4("quantity"),
            text("currency"),
            text("session_id"),
            text("url"),
            int8("created_at"),
        ],
        ResultSet::CheckoutReceipt => vec![text("id"), text("url"), text("session_id")],
    }
}

fn rows<T>(
    set: ResultSet,
    items: &[T],
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema(set));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn clamp_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn encode_reservation(e: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    e.encode_field(&r.id.to_string())?;
    e.encode_field(&r.name)?;
    e.encode_field(&r.email)?;
    e.encode_field(&r.phone)?;
    e.encode_field(&r.date.to_string())?;
    e.encode_field(&r.time.format("%H:%M").to_string())?;
    e.encode_field(&clamp_i32(r.party_size))?;
    e.encode_field(&r.notes)?;
    e.encode_field(&r.status.as_str())?;
    e.encode_field(&r.review.map(|rr| rr.as_str()))?;
    e.encode_field(&r.origin.as_str())?;
    e.encode_field(&r.confirmation_sent_at)?;
    e.encode_field(&r.created_at)?;
    e.encode_field(&r.updated_at)
}

fn encode_receipt(e: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    e.encode_field(&r.id.to_string())?;
    e.encode_field(&r.status.as_str())?;
    e.encode_field(&r.review.map(|rr| rr.as_str()))
}

fn encode_slot(e: &mut DataRowEncoder, (date, slot): &(chrono::NaiveDate, Slot)) -> PgWireResult<()> {
    e.encode_field(&date.to_string())?;
    e.encode_field(&slot.time.format("%H:%M").to_string())?;
    e.encode_field(&slot.service.as_str())?;
    e.encode_field(&slot.mode.as_str())
}

fn encode_closure(e: &mut DataRowEncoder, c: &Closure) -> PgWireResult<()> {
    e.encode_field(&c.date.to_string())?;
    e.encode_field(&c.kind.as_str())?;
    e.encode_field(&c.note)
}

fn encode_client(e: &mut DataRowEncoder, c: &Client) -> PgWireResult<()> {
    e.encode_field(&c.email)?;
    e.encode_field(&c.name)?;
    e.encode_field(&c.phone)?;
    e.encode_field(&c.source.as_str())?;
    e.encode_field(&clamp_i32(c.bookings))?;
    e.encode_field(&c.last_visit.map(|d| d.to_string()))?;
    e.encode_field(&c.first_seen)?;
    e.encode_field(&c.updated_at)
}

fn encode_subscription(e: &mut DataRowEncoder, s: &PushSubscription) -> PgWireResult<()> {
    e.encode_field(&s.endpoint)?;
    e.encode_field(&s.created_at)
}

fn encode_email(e: &mut DataRowEncoder, m: &EmailRecord) -> PgWireResult<()> {
    let (status, provider_id, error) = match &m.outcome {
        EmailOutcome::Sent { provider_id } => ("sent", Some(provider_id.clone()), None),
        EmailOutcome::Failed { error } => ("failed", None, Some(error.clone())),
    };
    e.encode_field(&m.id.to_string())?;
    e.encode_field(&m.reservation_id.map(|id| id.to_string()))?;
    e.encode_field(&m.template.as_str())?;
    e.encode_field(&m.recipient)?;
    e.encode_field(&status)?;
    e.encode_field(&provider_id)?;
    e.encode_field(&error)?;
    e.encode_field(&m.at)
}

fn encode_checkout(e: &mut DataRowEncoder, c: &Checkout) -> PgWireResult<()> {
    e.encode_field(&c.id.to_string())?;
    e.encode_field(&c.email)?;
    e.encode_field(&c.description)?;
    e.encode_field(&c.amount_cents)?;
    e.encode_field(&clamp_i32(c.quantity))?;
    e.encode_field(&c.currency)?;
    e.encode_field(&c.session_id)?;
    e.encode_field(&c.url)?;
    e.encode_field(&c.created_at)
}

fn encode_checkout_receipt(e: &mut DataRowEncoder, c: &Checkout) -> PgWireResult<()> {
    e.encode_field(&c.id.to_string())?;
    e.encode_field(&c.url)?;
    e.encode_field(&c.session_id)
}

fn describe_schema(sql: &str) -> Vec<FieldInfo> {
    sql::describe(sql).map(schema).unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for TavolaHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let role = self.resolve_role(client)?;
        let result = self.run(role, query).await;
        self.deliver_notifications(client).await?;
        Ok(vec![result?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TavolaQueryParser;

#[async_trait]
impl QueryParser for TavolaQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TavolaHandler {
    type Statement = String;
    type QueryParser = TavolaQueryParser;

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
        let role = self.resolve_role(client)?;
        let sql = substitute_params(portal);
        let result = self.run(role, &sql).await;
        self.deliver_notifications(client).await?;
        result
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
        Ok(DescribeStatementResponse::new(param_types, describe_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(describe_schema(&target.statement.statement)))
    }
}

/// Byte ranges of `$N` placeholders outside quoted literals, with their index.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled quote closes and reopens, which leaves us inside.
            b'\'' => in_literal = !in_literal,
            b'$' if !in_literal => {
                let start = i;
                while i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..=i].parse::<usize>() {
                    found.push((start..i + 1, n));
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// Single pass over the statement; inserted values are never rescanned.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (span, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..span.start]);
        match param {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = span.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TavolaFactory {
    handler: Arc<TavolaHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<TavolaAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TavolaFactory {
    pub fn new(engine: Arc<Engine>, credentials: Credentials) -> Self {
        let auth_source = TavolaAuthSource::new(credentials);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TavolaHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TavolaFactory {
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

/// Serve one client connection until it closes. Each connection gets its own
/// handler so LISTEN state is never shared.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    credentials: Credentials,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = TavolaFactory::new(engine, credentials);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound { .. } => "02000",
        EngineError::Invalid(_) | EngineError::Rejected(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Import(_) => "22P04",
        EngineError::Checkout(_) | EngineError::Upstream(_) => "58000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        SqlError::BadValue(..) => "22P02",
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}
