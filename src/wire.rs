use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::auth::{CanchasAuthSource, Role};
use crate::calendar::weekday_name;
use crate::engine::{Engine, EngineError};
use crate::observability::{self, command_label};
use crate::sql::{self, Command, ReservaFilter, SqlError};

pub struct CanchasHandler {
    engine: Arc<Engine>,
    compact_threshold: u64,
    query_parser: Arc<CanchasQueryParser>,
}

impl CanchasHandler {
    pub fn new(engine: Arc<Engine>, compact_threshold: u64) -> Self {
        Self {
            engine,
            compact_threshold,
            query_parser: Arc::new(CanchasQueryParser),
        }
    }

    fn role<C: ClientInfo>(client: &C) -> Role {
        Role::for_user(client.metadata().get("user").map(String::as_str))
    }

    /// Role check, execution, metrics and opportunistic WAL compaction.
    async fn run(&self, role: Role, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = command_label(&cmd);
        if role == Role::Consumer && cmd.requires_admin() {
            metrics::counter!(observability::PERMISSION_DENIED_TOTAL, "command" => label).increment(1);
            return Err(user_error("42501", format!("permission denied for {label}")));
        }

        debug!(command = label, ?role, "executing");
        let is_write = cmd.is_write();
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        if is_write && result.is_ok() {
            if let Err(e) = self.engine.compact_if_needed(self.compact_threshold).await {
                warn!("WAL compaction failed: {e}");
            }
        }
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertCancha {
                id,
                local,
                name,
                price,
            } => {
                engine
                    .create_cancha(id, local, name, price)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::UpdateCancha { id, name, price } => {
                engine.update_cancha(id, name, price).await.map_err(engine_err)?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::DeleteCancha { id } => {
                engine.delete_cancha(id).await.map_err(engine_err)?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::SelectCanchas { local } => {
                let canchas = engine.list_canchas(local).await;
                rows(canchas_schema(), canchas, |enc, c| {
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&c.local.as_str())?;
                    enc.encode_field(&c.name)?;
                    enc.encode_field(&i64::from(c.price))
                })
            }
            Command::InsertLink {
                id,
                hub_id,
                member_id,
            } => {
                engine
                    .link_canchas(id, hub_id, member_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::DeleteLink { id } => {
                engine.unlink_canchas(id).await.map_err(engine_err)?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::SelectLinks => rows(links_schema(), engine.list_links(), |enc, l| {
                enc.encode_field(&l.id.to_string())?;
                enc.encode_field(&l.hub_id.to_string())?;
                enc.encode_field(&l.member_id.to_string())
            }),
            Command::InsertReserva(req) => {
                engine.confirm_reserva(req).await.map_err(engine_err)?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::BatchInsertReservas(reqs) => {
                let count = reqs.len();
                engine
                    .batch_confirm_reservas(reqs)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![tag("INSERT", count)])
            }
            Command::UpdateReserva { id, patch } => {
                engine.update_reserva(id, patch).await.map_err(engine_err)?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::DeleteReserva { id } => {
                engine.cancel_reserva(id).await.map_err(engine_err)?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::SelectReservas(filter) => {
                let reservas = match filter {
                    ReservaFilter::Cancha { cancha_id, date } => {
                        engine.reservas_for_cancha(cancha_id, date).await
                    }
                    ReservaFilter::Local { local, date } => {
                        engine.reservas_for_local(local, date).await
                    }
                    ReservaFilter::Fija { fija_id } => engine.reservas_for_fija(fija_id).await,
                };
                rows(reservas_schema(), reservas, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.cancha_id.to_string())?;
                    enc.encode_field(&r.date.to_string())?;
                    enc.encode_field(&(r.hour as i32))?;
                    enc.encode_field(&(r.hours as i32))?;
                    enc.encode_field(&r.contact.name)?;
                    enc.encode_field(&r.contact.phone)?;
                    enc.encode_field(&i64::from(r.price))?;
                    enc.encode_field(&r.fija_id.map(|f| f.to_string()))
                })
            }
            Command::InsertFija(req) => {
                let outcome = engine.create_fija(req).await.map_err(engine_err)?;
                Ok(vec![tag("INSERT", outcome.booked.len())])
            }
            Command::UpdateFija { id, patch } => {
                engine.update_fija(id, patch).await.map_err(engine_err)?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::DeleteFija { id } => {
                engine.delete_fija(id).await.map_err(engine_err)?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::SelectFijas { cancha_id } => {
                rows(fijas_schema(), engine.list_fijas(cancha_id), |enc, f| {
                    enc.encode_field(&f.id.to_string())?;
                    enc.encode_field(&f.cancha_id.to_string())?;
                    enc.encode_field(&weekday_name(f.weekday))?;
                    enc.encode_field(&(f.hour as i32))?;
                    enc.encode_field(&(f.hours as i32))?;
                    enc.encode_field(&f.contact.name)?;
                    enc.encode_field(&f.contact.phone)?;
                    enc.encode_field(&i64::from(f.price))
                })
            }
            Command::RenewFija { id } => {
                let outcome = engine.renew_fija(id).await.map_err(engine_err)?;
                Ok(vec![tag("RENEW", outcome.booked.len())])
            }
            Command::SelectAvailability {
                cancha_id,
                date,
                hours,
            } => {
                let starts = engine
                    .availability(cancha_id, date, hours)
                    .await
                    .map_err(engine_err)?;
                let cancha = cancha_id.to_string();
                let day = date.to_string();
                rows(availability_schema(), starts, |enc, hour| {
                    enc.encode_field(&cancha)?;
                    enc.encode_field(&day)?;
                    enc.encode_field(&(hour as i32))
                })
            }
            Command::SelectFijaPreview {
                cancha_id,
                weekday,
                hour,
                hours,
                start,
            } => {
                let occurrences = engine
                    .preview_fija(cancha_id, weekday, hour, hours, start)
                    .await
                    .map_err(engine_err)?;
                rows(fija_preview_schema(), occurrences, |enc, occ| {
                    enc.encode_field(&occ.date.to_string())?;
                    enc.encode_field(&if occ.is_free() { "libre" } else { "ocupada" })?;
                    enc.encode_field(&occ.conflict.map(|c| c.to_string()))
                })
            }
        }
    }
}

fn tag(command: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(command).with_rows(rows))
}

/// Encode one data row per item with the given schema.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(schema);
    let data: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(data)))])
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn canchas_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("local", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("price", Type::INT8),
    ]
}

fn links_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("hub_id", Type::VARCHAR),
        field("member_id", Type::VARCHAR),
    ]
}

fn reservas_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("cancha_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("hour", Type::INT4),
        field("hours", Type::INT4),
        field("name", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("price", Type::INT8),
        field("fija_id", Type::VARCHAR),
    ]
}

fn fijas_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("cancha_id", Type::VARCHAR),
        field("weekday", Type::VARCHAR),
        field("hour", Type::INT4),
        field("hours", Type::INT4),
        field("name", Type::VARCHAR),
        field("phone", Type::VARCHAR),
        field("price", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("cancha_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("hour", Type::INT4),
    ]
}

fn fija_preview_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("conflict_id", Type::VARCHAR),
    ]
}

/// Table named after the first `FROM` in a SELECT.
fn select_table(sql: &str) -> Option<String> {
    let mut tokens = sql.split_whitespace();
    if !tokens.next()?.eq_ignore_ascii_case("SELECT") {
        return None;
    }
    tokens.find(|t| t.eq_ignore_ascii_case("FROM"))?;
    tokens
        .next()
        .map(|t| t.trim_end_matches(';').to_lowercase())
}

/// Row description for a statement, known before its parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match select_table(sql).as_deref() {
        Some("canchas") => canchas_schema(),
        Some("links") => links_schema(),
        Some("reservas") => reservas_schema(),
        Some("reservas_fijas") => fijas_schema(),
        Some("availability") => availability_schema(),
        Some("fija_preview") => fija_preview_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CanchasHandler {
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
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(Self::role(&*client), cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CanchasQueryParser;

#[async_trait]
impl QueryParser for CanchasQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CanchasHandler {
    type Statement = String;
    type QueryParser = CanchasQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(Self::role(&*client), cmd)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "command produced no response".into()))
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. One left-to-right pass
/// over the statement, so inlined values are never scanned again and `$n`
/// inside a quoted literal is left alone.
fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_literal = !in_literal,
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let index = sql[start..end].parse::<usize>().ok();
                if let Some(param) = index.and_then(|n| n.checked_sub(1)).and_then(|n| params.get(n)) {
                    out.push_str(&sql[copied..i]);
                    match param {
                        Some(value) => {
                            out.push('\'');
                            out.push_str(&String::from_utf8_lossy(value.as_ref()).replace('\'', "''"));
                            out.push('\'');
                        }
                        None => out.push_str("NULL"),
                    }
                    copied = end;
                    i = end;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CanchasFactory {
    handler: Arc<CanchasHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CanchasAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CanchasFactory {
    pub fn new(engine: Arc<Engine>, auth: CanchasAuthSource, compact_threshold: u64) -> Self {
        Self {
            handler: Arc::new(CanchasHandler::new(engine, compact_threshold)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CanchasFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<CanchasFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict(_) => "23P01",
        EngineError::WalError(_) => "58030",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM canchas"), 0);
        assert_eq!(count_params("SELECT * FROM reservas WHERE cancha_id = $1 AND date = $2"), 2);
        assert_eq!(count_params("INSERT INTO reservas VALUES ($3, $1, $12)"), 12);
        assert_eq!(count_params("SELECT '$' FROM links"), 0);
    }

    #[test]
    fn schema_follows_from_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM availability WHERE cancha_id = $1"), ["cancha_id", "date", "hour"]);
        assert_eq!(names("select * from fija_preview;"), ["date", "status", "conflict_id"]);
        assert_eq!(names("SELECT * FROM reservas_fijas").len(), 8);
        assert!(names("INSERT INTO canchas VALUES ($1, $2, $3, $4)").is_empty());
        assert!(names("DELETE FROM reservas WHERE id = $1").is_empty());
    }

    #[test]
    fn conflicts_get_exclusion_sqlstate() {
        assert_eq!(engine_sqlstate(&EngineError::Conflict(Ulid::new())), "23P01");
        assert_eq!(engine_sqlstate(&EngineError::NotFound(Ulid::new())), "P0001");
        assert_eq!(engine_sqlstate(&EngineError::WalError("disk".into())), "58030");
    }

    #[test]
    fn inlines_params_without_rescanning_values() {
        let params: Vec<Option<&[u8]>> = vec![Some(&b"x' OR '1"[..]), Some(&b"costs $1"[..]), None];
        let sql = inline_params("SELECT * FROM t WHERE a = $1 AND b = $2 AND c = $3", &params);
        assert_eq!(sql, "SELECT * FROM t WHERE a = 'x'' OR ''1' AND b = 'costs $1' AND c = NULL");
    }

    #[test]
    fn inline_params_skips_quoted_and_unbound_placeholders() {
        let params: Vec<Option<&[u8]>> = vec![Some(&b"v"[..])];
        assert_eq!(inline_params("SELECT '$1', $1, $2", &params), "SELECT '$1', 'v', $2");
        assert_eq!(inline_params("SELECT $10", &params), "SELECT $10");
    }
}
