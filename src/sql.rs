use std::collections::HashMap;

use chrono::{NaiveDate, Weekday};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::calendar::parse_weekday;
use crate::model::*;

/// Which reservas a `SELECT ... FROM reservas` wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservaFilter {
    Cancha { cancha_id: Ulid, date: NaiveDate },
    Local { local: Local, date: NaiveDate },
    Fija { fija_id: Ulid },
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCancha {
        id: Ulid,
        local: Local,
        name: String,
        price: u32,
    },
    UpdateCancha {
        id: Ulid,
        name: Option<String>,
        price: Option<u32>,
    },
    DeleteCancha {
        id: Ulid,
    },
    SelectCanchas {
        local: Option<Local>,
    },
    InsertLink {
        id: Ulid,
        hub_id: Ulid,
        member_id: Ulid,
    },
    DeleteLink {
        id: Ulid,
    },
    SelectLinks,
    InsertReserva(NewReserva),
    BatchInsertReservas(Vec<NewReserva>),
    UpdateReserva {
        id: Ulid,
        patch: ReservaPatch,
    },
    DeleteReserva {
        id: Ulid,
    },
    SelectReservas(ReservaFilter),
    InsertFija(NewFija),
    UpdateFija {
        id: Ulid,
        patch: FijaPatch,
    },
    DeleteFija {
        id: Ulid,
    },
    SelectFijas {
        cancha_id: Option<Ulid>,
    },
    RenewFija {
        id: Ulid,
    },
    SelectAvailability {
        cancha_id: Ulid,
        date: NaiveDate,
        hours: u32,
    },
    SelectFijaPreview {
        cancha_id: Ulid,
        weekday: Weekday,
        hour: u32,
        hours: u32,
        start: Option<NaiveDate>,
    },
}

impl Command {
    /// Commands only the admin login may run.
    pub fn requires_admin(&self) -> bool {
        !matches!(
            self,
            Command::SelectCanchas { .. }
                | Command::SelectLinks
                | Command::InsertReserva(_)
                | Command::BatchInsertReservas(_)
                | Command::SelectReservas(_)
                | Command::SelectFijas { .. }
                | Command::SelectAvailability { .. }
                | Command::SelectFijaPreview { .. }
        )
    }

    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Command::SelectCanchas { .. }
                | Command::SelectLinks
                | Command::SelectReservas(_)
                | Command::SelectFijas { .. }
                | Command::SelectAvailability { .. }
                | Command::SelectFijaPreview { .. }
        )
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(arg) = strip_keyword(trimmed, "RENEW") {
        return Ok(Command::RenewFija {
            id: parse_ulid_str(arg.trim_matches('\''))?,
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Rest of `sql` after a leading keyword, case-insensitive.
fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace)).then(|| rest.trim())
}

// ── INSERT ────────────────────────────────────────────────────

/// Values are positional, in the column order documented per table.
fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "canchas" => {
            let v = single_row(&rows)?;
            arity("canchas", v, 4)?;
            Ok(Command::InsertCancha {
                id: parse_ulid(&v[0])?,
                local: parse_local(&v[1])?,
                name: parse_string(&v[2])?,
                price: parse_u32(&v[3])?,
            })
        }
        "links" => {
            let v = single_row(&rows)?;
            arity("links", v, 3)?;
            Ok(Command::InsertLink {
                id: parse_ulid(&v[0])?,
                hub_id: parse_ulid(&v[1])?,
                member_id: parse_ulid(&v[2])?,
            })
        }
        "reservas" => {
            let mut reservas = rows
                .iter()
                .enumerate()
                .map(|(i, row)| {
                    parse_reserva_row(row).map_err(|e| match e {
                        SqlError::Parse(msg) if rows.len() > 1 => SqlError::Parse(format!("row {i}: {msg}")),
                        other => other,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if reservas.len() == 1 {
                Ok(Command::InsertReserva(reservas.remove(0)))
            } else {
                Ok(Command::BatchInsertReservas(reservas))
            }
        }
        "reservas_fijas" => {
            let v = single_row(&rows)?;
            arity("reservas_fijas", v, 6)?;
            Ok(Command::InsertFija(NewFija {
                id: parse_ulid(&v[0])?,
                cancha_id: parse_ulid(&v[1])?,
                weekday: parse_weekday_expr(&v[2])?,
                hour: parse_u32(&v[3])?,
                contact: Contact {
                    name: parse_string(&v[4])?,
                    phone: parse_string(&v[5])?,
                },
                price: v.get(6).map(parse_u32_or_null).transpose()?.flatten(),
                hours: v.get(7).map(parse_u32_or_null).transpose()?.flatten().unwrap_or(1),
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(id, cancha_id, date, hour, name, phone[, price[, hours]])`
fn parse_reserva_row(v: &[Expr]) -> Result<NewReserva, SqlError> {
    arity("reservas", v, 6)?;
    Ok(NewReserva {
        id: parse_ulid(&v[0])?,
        cancha_id: parse_ulid(&v[1])?,
        date: parse_date(&v[2])?,
        hour: parse_u32(&v[3])?,
        contact: Contact {
            name: parse_string(&v[4])?,
            phone: parse_string(&v[5])?,
        },
        price: v.get(6).map(parse_u32_or_null).transpose()?.flatten(),
        hours: v.get(7).map(parse_u32_or_null).transpose()?.flatten().unwrap_or(1),
    })
}

fn single_row(rows: &[Vec<Expr>]) -> Result<&[Expr], SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported("multi-row INSERT on this table".into())),
    }
}

fn arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set: HashMap<String, &Expr> = HashMap::new();
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.insert(col, &a.value);
    }
    let mut take = |col: &str| set.remove(col);

    let cmd = match table.as_str() {
        "canchas" => Command::UpdateCancha {
            id,
            name: take("name").map(parse_string).transpose()?,
            price: take("price").map(parse_u32).transpose()?,
        },
        "reservas" => Command::UpdateReserva {
            id,
            patch: ReservaPatch {
                date: take("date").map(parse_date).transpose()?,
                hour: take("hour").map(parse_u32).transpose()?,
                hours: take("hours").map(parse_u32).transpose()?,
                name: take("name").map(parse_string).transpose()?,
                phone: take("phone").map(parse_string).transpose()?,
                price: take("price").map(parse_u32).transpose()?,
            },
        },
        "reservas_fijas" => Command::UpdateFija {
            id,
            patch: FijaPatch {
                weekday: take("weekday").map(parse_weekday_expr).transpose()?,
                hour: take("hour").map(parse_u32).transpose()?,
                hours: take("hours").map(parse_u32).transpose()?,
                name: take("name").map(parse_string).transpose()?,
                phone: take("phone").map(parse_string).transpose()?,
                price: take("price").map(parse_u32).transpose()?,
            },
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };

    if let Some(col) = set.keys().next() {
        return Err(SqlError::UnknownColumn(col.clone()));
    }
    Ok(cmd)
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "canchas" => Ok(Command::DeleteCancha { id }),
        "links" => Ok(Command::DeleteLink { id }),
        "reservas" => Ok(Command::DeleteReserva { id }),
        "reservas_fijas" => Ok(Command::DeleteFija { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = HashMap::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters);
    }
    let get = |col: &'static str| filters.get(col).copied();
    let require = |col: &'static str| get(col).ok_or(SqlError::MissingFilter(col));

    match table.as_str() {
        "canchas" => Ok(Command::SelectCanchas {
            local: get("local").map(parse_local).transpose()?,
        }),
        "links" => Ok(Command::SelectLinks),
        "reservas" => {
            let filter = if let Some(fija_id) = get("fija_id") {
                ReservaFilter::Fija { fija_id: parse_ulid(fija_id)? }
            } else if let Some(cancha_id) = get("cancha_id") {
                ReservaFilter::Cancha {
                    cancha_id: parse_ulid(cancha_id)?,
                    date: parse_date(require("date")?)?,
                }
            } else if let Some(local) = get("local") {
                ReservaFilter::Local {
                    local: parse_local(local)?,
                    date: parse_date(require("date")?)?,
                }
            } else {
                return Err(SqlError::MissingFilter("cancha_id, local or fija_id"));
            };
            Ok(Command::SelectReservas(filter))
        }
        "reservas_fijas" => Ok(Command::SelectFijas {
            cancha_id: get("cancha_id").map(parse_ulid).transpose()?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            cancha_id: parse_ulid(require("cancha_id")?)?,
            date: parse_date(require("date")?)?,
            hours: get("min_hours").map(parse_u32).transpose()?.unwrap_or(1),
        }),
        "fija_preview" => Ok(Command::SelectFijaPreview {
            cancha_id: parse_ulid(require("cancha_id")?)?,
            weekday: parse_weekday_expr(require("weekday")?)?,
            hour: parse_u32(require("hour")?)?,
            hours: get("hours").map(parse_u32).transpose()?.unwrap_or(1),
            start: get("start").map(parse_date).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `col = value` terms (and `col >= value` for `start`) joined by AND.
fn collect_filters<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, out);
                collect_filters(right, out);
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.insert(col, right);
                }
            }
            ast::BinaryOperator::GtEq => {
                if let Some(col) = expr_column_name(left).filter(|c| c == "start") {
                    out.insert(col, right);
                }
            }
            _ => {}
        },
        Expr::Nested(inner) => collect_filters(inner, out),
        _ => {}
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(values.rows.clone()),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(n, _)) => Ok(n.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_str(&parse_string(expr)?)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_local(expr: &Expr) -> Result<Local, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_weekday_expr(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = parse_string(expr)?;
    parse_weekday(&s).ok_or_else(|| SqlError::Parse(format!("bad weekday: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
