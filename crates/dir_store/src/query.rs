//! Renders compiled filter predicates into `sea_query` conditions.
//!
//! Attribute assertions test membership in `ldap_attr_values` subqueries, so
//! one rendering serves SQLite, PostgreSQL and MySQL alike.

use sea_orm::DatabaseBackend;
use sea_orm::sea_query::{
    Cond, Condition, Expr, ExprTrait, LikeExpr, MysqlQueryBuilder, PostgresQueryBuilder, Query,
    SelectStatement, SqliteQueryBuilder, Value as SeaValue,
};

use crate::db::*;
use kestrel_dir_core::{
    BoundValue, Column, CompareOp, CompiledQuery, DirError, DirResult, Direction, ParamKey,
    Predicate,
};

fn always() -> Condition {
    Cond::all().add(Expr::cust("1 = 1"))
}

fn never() -> Condition {
    Cond::all().add(Expr::cust("1 = 0"))
}

fn bound(query: &CompiledQuery, key: ParamKey) -> DirResult<SeaValue> {
    match query.params.get(&key) {
        Some(BoundValue::Text(text)) => Ok(text.clone().into()),
        Some(BoundValue::Id(id)) => Ok(id.as_i64().into()),
        Some(BoundValue::Time(ts)) => Ok(ts.as_i64().into()),
        None => Err(DirError::system(format!("filter parameter {key} is unbound"))),
    }
}

fn compare(column: Expr, op: CompareOp, value: SeaValue) -> DirResult<Condition> {
    let cond = match op {
        CompareOp::Eq => Cond::all().add(column.eq(value)),
        CompareOp::Gte => Cond::all().add(column.gte(value)),
        CompareOp::Lte => Cond::all().add(column.lte(value)),
        CompareOp::Like => {
            let SeaValue::String(Some(pattern)) = value else {
                return Err(DirError::system("LIKE pattern must be text"));
            };
            Cond::all().add(column.like(LikeExpr::new(pattern.to_string()).escape('\\')))
        }
    };
    Ok(cond)
}

fn values_of(attr: &str) -> SelectStatement {
    Query::select()
        .column(LdapAttrValues::EntryId)
        .from(LdapAttrValues::Table)
        .and_where(Expr::col(LdapAttrValues::Attr).eq(attr))
        .to_owned()
}

fn entry_id() -> Expr {
    Expr::col((LdapEntries::Table, LdapEntries::Id))
}

/// Condition over `ldap_entries` rows matching the query's predicate.
/// Pending parameters must have been resolved first.
pub fn condition(query: &CompiledQuery) -> DirResult<Condition> {
    if !query.is_resolved() {
        return Err(DirError::system("filter has unresolved DN parameters"));
    }
    render(&query.predicate, query)
}

fn render(predicate: &Predicate, query: &CompiledQuery) -> DirResult<Condition> {
    let cond = match predicate {
        Predicate::Const(true) => always(),
        Predicate::Const(false) => never(),
        Predicate::And(children) => {
            let mut cond = Cond::all();
            for child in children {
                cond = cond.add(render(child, query)?);
            }
            cond
        }
        Predicate::Or(children) => {
            if children.is_empty() {
                return Ok(never());
            }
            let mut cond = Cond::any();
            for child in children {
                cond = cond.add(render(child, query)?);
            }
            cond
        }
        Predicate::Not(inner) => render(inner, query)?.not(),
        Predicate::Attr { attr, op, param } => {
            let mut subquery = values_of(attr);
            subquery.cond_where(compare(
                Expr::col(LdapAttrValues::ValueNorm),
                *op,
                bound(query, *param)?,
            )?);
            Cond::all().add(entry_id().in_subquery(subquery))
        }
        Predicate::Present { attr } => Cond::all().add(entry_id().in_subquery(values_of(attr))),
        Predicate::Column { column, op, param } => {
            let column = match column {
                Column::EntryUuid => LdapEntries::EntryUuid,
                Column::CreatedAt => LdapEntries::CreatedAt,
                Column::UpdatedAt => LdapEntries::UpdatedAt,
            };
            compare(
                Expr::col((LdapEntries::Table, column)),
                *op,
                bound(query, *param)?,
            )?
        }
        Predicate::Association {
            relation,
            direction,
            param,
        } => {
            let (candidate, target) = match direction {
                Direction::Owner => (LdapAssociations::OwnerId, LdapAssociations::MemberId),
                Direction::Member => (LdapAssociations::MemberId, LdapAssociations::OwnerId),
            };
            let mut subquery = Query::select()
                .column(candidate)
                .from(LdapAssociations::Table)
                .and_where(Expr::col(LdapAssociations::Name).eq(relation.as_str()))
                .to_owned();
            if let Some(param) = param {
                if query.unresolved.contains(param) {
                    return Ok(never());
                }
                subquery.and_where(Expr::col(target).eq(bound(query, *param)?));
            }
            Cond::all().add(entry_id().in_subquery(subquery))
        }
        Predicate::HasChildren => {
            let subquery = Query::select()
                .column(LdapContainers::Id)
                .from(LdapContainers::Table)
                .to_owned();
            Cond::all().add(entry_id().in_subquery(subquery))
        }
    };
    Ok(cond)
}

/// Ids matching the filter over the whole table, for diagnostics.
pub fn select_ids(query: &CompiledQuery) -> DirResult<SelectStatement> {
    Ok(Query::select()
        .column((LdapEntries::Table, LdapEntries::Id))
        .from(LdapEntries::Table)
        .cond_where(condition(query)?)
        .to_owned())
}

/// SQL text of the search selection with values inlined.
pub fn explain(backend: DatabaseBackend, query: &CompiledQuery) -> DirResult<String> {
    let select = select_ids(query)?;
    Ok(match backend {
        DatabaseBackend::Postgres => select.to_string(PostgresQueryBuilder),
        DatabaseBackend::MySql => select.to_string(MysqlQueryBuilder),
        _ => select.to_string(SqliteQueryBuilder),
    })
}
