use sea_orm::sea_query::{
    self, LockType, MysqlQueryBuilder, PostgresQueryBuilder, QueryStatementWriter,
    SelectStatement, SqliteQueryBuilder,
};
use sea_orm::{ConnectionTrait, DatabaseBackend, QueryResult, Statement};
use sea_orm_migration::prelude::Iden;

use kestrel_dir_core::{DirResult, EntryId, LockMode};

#[derive(Iden, Clone, Copy)]
pub enum LdapEntries {
    Table,
    Id,
    ParentId,
    RdnNorm,
    RdnOrig,
    AttrsNorm,
    AttrsOrig,
    EntryUuid,
    CreatedAt,
    UpdatedAt,
}

/// One row per entry that currently has children.
#[derive(Iden, Clone, Copy)]
pub enum LdapContainers {
    Table,
    Id,
}

#[derive(Iden, Clone, Copy)]
pub enum LdapAssociations {
    Table,
    Name,
    OwnerId,
    MemberId,
}

/// Normalized document values, one row per value, used by filter predicates.
#[derive(Iden, Clone, Copy)]
pub enum LdapAttrValues {
    Table,
    EntryId,
    Attr,
    ValueNorm,
}

pub fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

pub fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

pub async fn exec<C, S>(conn: &C, stmt: &S) -> DirResult<()>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    exec_count(conn, stmt).await.map(|_| ())
}

/// Executes and returns the number of affected rows.
pub async fn exec_count<C, S>(conn: &C, stmt: &S) -> DirResult<u64>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let result = conn
        .execute_raw(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(result.rows_affected())
}

pub async fn query_all<C, S>(conn: &C, stmt: &S) -> DirResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    query_all_with(conn, None, stmt).await
}

pub async fn query_one<C, S>(conn: &C, stmt: &S) -> DirResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    query_one_with(conn, None, stmt).await
}

/// Prepends a bind-free `WITH` clause to the built statement.
fn with_prefix<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    with: Option<&str>,
    stmt: &S,
) -> Statement {
    let (sql, values) = build_stmt(backend, stmt);
    let sql = match with {
        Some(with) => format!("{with} {sql}"),
        None => sql,
    };
    Statement::from_sql_and_values(backend, sql, values)
}

pub async fn query_all_with<C, S>(
    conn: &C,
    with: Option<&str>,
    stmt: &S,
) -> DirResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    Ok(conn.query_all_raw(with_prefix(backend, with, stmt)).await?)
}

pub async fn query_one_with<C, S>(
    conn: &C,
    with: Option<&str>,
    stmt: &S,
) -> DirResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    Ok(conn.query_one_raw(with_prefix(backend, with, stmt)).await?)
}

/// Adds a row lock clause. SQLite has no row locks and serializes writers.
pub fn apply_lock(select: &mut SelectStatement, backend: DatabaseBackend, mode: LockMode) {
    if backend == DatabaseBackend::Sqlite {
        return;
    }
    match mode {
        LockMode::None => {}
        LockMode::Share => {
            select.lock(LockType::Share);
        }
        LockMode::Update => {
            select.lock(LockType::Update);
        }
    }
}

pub fn read_entry_id(row: &QueryResult, column: impl sea_query::Iden) -> DirResult<EntryId> {
    let value: i64 = row.try_get("", &col_name(column))?;
    Ok(EntryId(value))
}

pub fn read_opt_entry_id(
    row: &QueryResult,
    column: impl sea_query::Iden,
) -> DirResult<Option<EntryId>> {
    let value: Option<i64> = row.try_get("", &col_name(column))?;
    Ok(value.map(EntryId))
}
