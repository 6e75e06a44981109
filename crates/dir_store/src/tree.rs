//! Parent-pointer tree over `ldap_entries` with the container side table.
//!
//! The suffix entry is the single row whose `parent_id` is NULL; its RDN
//! columns hold the whole suffix DN. Every other row stores one RDN and the
//! id of its parent. `ldap_containers` holds the ids of entries that have at
//! least one child, so subtree walks only expand ids found there.

use std::collections::HashMap;
use std::sync::Arc;

use sea_orm::sea_query::{
    Cond, Condition, Expr, ExprTrait, Func, OnConflict, Order, Query, SelectStatement,
};
use sea_orm::sea_query;
use sea_orm::{ConnectionTrait, DatabaseBackend, QueryResult};
use sea_orm_migration::prelude::Iden;

use crate::db::*;
use kestrel_dir_core::schema::index_prefix;
use kestrel_dir_core::{
    DirError, DirResult, Dn, Document, EntryId, LockMode, Rdn, SchemaCatalog, Scope,
};

/// Rows per multi-row INSERT. Three binds a row stays well under the
/// SQLite limit of 32766 and the 65535 of PostgreSQL and MySQL.
pub const INSERT_CHUNK: usize = 500;

/// Already materialized DNs, shared across the rows of one operation.
pub type DnCache = HashMap<EntryId, Dn>;

#[derive(Clone, Debug)]
pub struct EntryRow {
    pub id: EntryId,
    pub parent_id: Option<EntryId>,
    pub rdn_norm: String,
    pub rdn_orig: String,
    pub attrs_norm: String,
    pub attrs_orig: String,
    pub entry_uuid: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EntryRow {
    fn from_row(row: &QueryResult) -> DirResult<Self> {
        Ok(Self {
            id: read_entry_id(row, LdapEntries::Id)?,
            parent_id: read_opt_entry_id(row, LdapEntries::ParentId)?,
            rdn_norm: row.try_get("", &col_name(LdapEntries::RdnNorm))?,
            rdn_orig: row.try_get("", &col_name(LdapEntries::RdnOrig))?,
            attrs_norm: row.try_get("", &col_name(LdapEntries::AttrsNorm))?,
            attrs_orig: row.try_get("", &col_name(LdapEntries::AttrsOrig))?,
            entry_uuid: row.try_get("", &col_name(LdapEntries::EntryUuid))?,
            created_at: row.try_get("", &col_name(LdapEntries::CreatedAt))?,
            updated_at: row.try_get("", &col_name(LdapEntries::UpdatedAt))?,
        })
    }
}

#[derive(Clone)]
pub struct Tree {
    backend: DatabaseBackend,
    catalog: Arc<SchemaCatalog>,
    suffix: Dn,
}

impl Tree {
    pub fn new(backend: DatabaseBackend, catalog: Arc<SchemaCatalog>, suffix: Dn) -> Self {
        Self {
            backend,
            catalog,
            suffix,
        }
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn suffix(&self) -> &Dn {
        &self.suffix
    }

    pub fn is_suffix(&self, dn: &Dn) -> bool {
        *dn == self.suffix
    }

    /// Whether `dn` names a position inside the served tree.
    pub fn contains(&self, dn: &Dn) -> bool {
        self.is_suffix(dn) || dn.is_descendant_of(&self.suffix)
    }

    /// `(rdn_norm, rdn_orig)` column values for an entry named `dn`.
    pub fn rdn_columns(&self, dn: &Dn) -> DirResult<(String, String)> {
        if self.is_suffix(dn) {
            return Ok((dn.norm_string(), dn.orig_string()));
        }
        let rdn = dn
            .rdn()
            .ok_or_else(|| DirError::no_such_object(dn.orig_string()))?;
        Ok((rdn.norm_string(), rdn.orig_string()))
    }

    fn select_entry() -> SelectStatement {
        Query::select()
            .from(LdapEntries::Table)
            .columns([
                LdapEntries::Id,
                LdapEntries::ParentId,
                LdapEntries::RdnNorm,
                LdapEntries::RdnOrig,
                LdapEntries::AttrsNorm,
                LdapEntries::AttrsOrig,
                LdapEntries::EntryUuid,
                LdapEntries::CreatedAt,
                LdapEntries::UpdatedAt,
            ])
            .to_owned()
    }

    /// The row named `rdn_norm` under `parent`; `None` addresses the suffix row.
    pub async fn child<C: ConnectionTrait>(
        &self,
        conn: &C,
        parent: Option<EntryId>,
        rdn_norm: &str,
        lock: LockMode,
    ) -> DirResult<Option<EntryRow>> {
        let mut select = Self::select_entry();
        match parent {
            Some(parent) => {
                select.and_where(Expr::col(LdapEntries::ParentId).eq(parent.as_i64()));
            }
            None => {
                select.and_where(Expr::col(LdapEntries::ParentId).is_null());
            }
        }
        select.and_where(Expr::col(LdapEntries::RdnNorm).eq(rdn_norm));
        apply_lock(&mut select, self.backend, lock);
        query_one(conn, &select)
            .await?
            .map(|row| EntryRow::from_row(&row))
            .transpose()
    }

    /// Walks from the suffix row down the RDNs of `dn`. Only the final row
    /// is locked.
    pub async fn locate<C: ConnectionTrait>(
        &self,
        conn: &C,
        dn: &Dn,
        lock: LockMode,
    ) -> DirResult<Option<EntryRow>> {
        if !self.contains(dn) {
            return Ok(None);
        }
        let tail = &dn.rdns()[self.suffix.depth()..];
        let root_lock = if tail.is_empty() { lock } else { LockMode::None };
        let Some(mut row) = self
            .child(conn, None, &self.suffix.norm_string(), root_lock)
            .await?
        else {
            return Ok(None);
        };
        for (pos, rdn) in tail.iter().enumerate() {
            let step_lock = if pos + 1 == tail.len() {
                lock
            } else {
                LockMode::None
            };
            match self
                .child(conn, Some(row.id), &rdn.norm_string(), step_lock)
                .await?
            {
                Some(next) => row = next,
                None => return Ok(None),
            }
        }
        Ok(Some(row))
    }

    pub async fn row_by_id<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: EntryId,
        lock: LockMode,
    ) -> DirResult<Option<EntryRow>> {
        let mut select = Self::select_entry();
        select.and_where(Expr::col(LdapEntries::Id).eq(id.as_i64()));
        apply_lock(&mut select, self.backend, lock);
        query_one(conn, &select)
            .await?
            .map(|row| EntryRow::from_row(&row))
            .transpose()
    }

    /// Locks `ids` one row at a time in ascending order. Returns the ids that
    /// still exist.
    pub async fn lock_ids<C: ConnectionTrait>(
        &self,
        conn: &C,
        ids: &[EntryId],
        mode: LockMode,
    ) -> DirResult<Vec<EntryId>> {
        let ordered = lock_order(ids);
        let mut locked = Vec::with_capacity(ordered.len());
        for id in ordered {
            let mut select = Query::select()
                .from(LdapEntries::Table)
                .column(LdapEntries::Id)
                .and_where(Expr::col(LdapEntries::Id).eq(id.as_i64()))
                .to_owned();
            apply_lock(&mut select, self.backend, mode);
            if query_one(conn, &select).await?.is_some() {
                locked.push(id);
            }
        }
        Ok(locked)
    }

    pub async fn has_children<C: ConnectionTrait>(&self, conn: &C, id: EntryId) -> DirResult<bool> {
        let select = Query::select()
            .from(LdapEntries::Table)
            .column(LdapEntries::Id)
            .and_where(Expr::col(LdapEntries::ParentId).eq(id.as_i64()))
            .limit(1)
            .to_owned();
        Ok(query_one(conn, &select).await?.is_some())
    }

    pub async fn is_container<C: ConnectionTrait>(&self, conn: &C, id: EntryId) -> DirResult<bool> {
        let select = Query::select()
            .from(LdapContainers::Table)
            .column(LdapContainers::Id)
            .and_where(Expr::col(LdapContainers::Id).eq(id.as_i64()))
            .to_owned();
        Ok(query_one(conn, &select).await?.is_some())
    }

    pub async fn ensure_container<C: ConnectionTrait>(&self, conn: &C, id: EntryId) -> DirResult<()> {
        let insert = Query::insert()
            .into_table(LdapContainers::Table)
            .columns([LdapContainers::Id])
            .values_panic([id.as_i64().into()])
            .on_conflict(
                OnConflict::columns([LdapContainers::Id])
                    .do_nothing()
                    .to_owned(),
            )
            .to_owned();
        exec(conn, &insert).await
    }

    /// Drops the container marker of `id` once its last child is gone.
    pub async fn prune_container<C: ConnectionTrait>(&self, conn: &C, id: EntryId) -> DirResult<()> {
        if self.has_children(conn, id).await? {
            return Ok(());
        }
        let delete = Query::delete()
            .from_table(LdapContainers::Table)
            .and_where(Expr::col(LdapContainers::Id).eq(id.as_i64()))
            .to_owned();
        exec(conn, &delete).await
    }

    /// Number of entries in `scope` below `base` that satisfy `filter`.
    pub async fn count_in_scope<C: ConnectionTrait>(
        &self,
        conn: &C,
        base: EntryId,
        scope: Scope,
        filter: Condition,
    ) -> DirResult<u64> {
        let select = Query::select()
            .expr_as(
                Func::count(Expr::col((LdapEntries::Table, LdapEntries::Id))),
                MatchCount,
            )
            .from(LdapEntries::Table)
            .cond_where(Cond::all().add(scope_condition(base, scope)).add(filter))
            .to_owned();
        let row = query_one_with(conn, scope_walk(base, scope).as_deref(), &select)
            .await?
            .ok_or_else(|| DirError::system("count query returned no row"))?;
        let count: i64 = row.try_get("", &col_name(MatchCount))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// One page of the entries counted by [`Tree::count_in_scope`], ascending
    /// by id.
    pub async fn page_in_scope<C: ConnectionTrait>(
        &self,
        conn: &C,
        base: EntryId,
        scope: Scope,
        filter: Condition,
        offset: u64,
        limit: u64,
    ) -> DirResult<Vec<EntryRow>> {
        let select = Self::select_entry()
            .cond_where(Cond::all().add(scope_condition(base, scope)).add(filter))
            .order_by((LdapEntries::Table, LdapEntries::Id), Order::Asc)
            .limit(limit)
            .offset(offset)
            .to_owned();
        query_all_with(conn, scope_walk(base, scope).as_deref(), &select)
            .await?
            .iter()
            .map(EntryRow::from_row)
            .collect()
    }

    /// Rebuilds the DN of `row` from its ancestors' original RDNs.
    pub async fn dn_of<C: ConnectionTrait>(
        &self,
        conn: &C,
        row: &EntryRow,
        cache: &mut DnCache,
    ) -> DirResult<Dn> {
        if let Some(dn) = cache.get(&row.id) {
            return Ok(dn.clone());
        }
        let mut chain = vec![(row.id, row.rdn_orig.clone())];
        let mut parent = row.parent_id;
        let mut dn = loop {
            let Some(parent_id) = parent else {
                break None;
            };
            if let Some(dn) = cache.get(&parent_id) {
                break Some(dn.clone());
            }
            let parent_row = self
                .row_by_id(conn, parent_id, LockMode::None)
                .await?
                .ok_or_else(|| DirError::system(format!("entry {parent_id} is missing")))?;
            chain.push((parent_row.id, parent_row.rdn_orig));
            parent = parent_row.parent_id;
        };
        for (id, rdn_orig) in chain.into_iter().rev() {
            let next = match dn {
                None => Dn::parse(&self.catalog, &rdn_orig)?,
                Some(parent_dn) => parent_dn.with_child(Rdn::parse(&self.catalog, &rdn_orig)?),
            };
            cache.insert(id, next.clone());
            dn = Some(next);
        }
        dn.ok_or_else(|| DirError::system(format!("entry {} has no name", row.id)))
    }

    pub async fn dn_of_id<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: EntryId,
        cache: &mut DnCache,
    ) -> DirResult<Dn> {
        if let Some(dn) = cache.get(&id) {
            return Ok(dn.clone());
        }
        let row = self
            .row_by_id(conn, id, LockMode::None)
            .await?
            .ok_or_else(|| DirError::system(format!("entry {id} is missing")))?;
        self.dn_of(conn, &row, cache).await
    }

    /// Replaces the filter index rows of `id` with the values of `norm`.
    pub async fn write_index<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: EntryId,
        norm: &Document,
    ) -> DirResult<()> {
        self.delete_index(conn, id).await?;
        let mut rows = Vec::new();
        for (name, value) in norm {
            let attr = self.catalog.resolve(name);
            for value in value.as_slice() {
                let indexed = match &attr {
                    Some(attr) => attr.index_value(value),
                    None => index_prefix(value),
                };
                rows.push((name.to_ascii_lowercase(), indexed));
            }
        }
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut insert = Query::insert()
                .into_table(LdapAttrValues::Table)
                .columns([
                    LdapAttrValues::EntryId,
                    LdapAttrValues::Attr,
                    LdapAttrValues::ValueNorm,
                ])
                .to_owned();
            for (key, value) in chunk {
                insert.values_panic([
                    id.as_i64().into(),
                    key.clone().into(),
                    value.clone().into(),
                ]);
            }
            exec(conn, &insert).await?;
        }
        Ok(())
    }

    pub async fn delete_index<C: ConnectionTrait>(&self, conn: &C, id: EntryId) -> DirResult<()> {
        let delete = Query::delete()
            .from_table(LdapAttrValues::Table)
            .and_where(Expr::col(LdapAttrValues::EntryId).eq(id.as_i64()))
            .to_owned();
        exec(conn, &delete).await
    }

    pub async fn delete_row<C: ConnectionTrait>(&self, conn: &C, id: EntryId) -> DirResult<()> {
        self.delete_index(conn, id).await?;
        let delete = Query::delete()
            .from_table(LdapEntries::Table)
            .and_where(Expr::col(LdapEntries::Id).eq(id.as_i64()))
            .to_owned();
        exec(conn, &delete).await
    }
}

/// Row ids in the order rows are locked: ascending, without repeats.
/// Every writer takes its locks in this order, so two writers never wait on
/// each other in a cycle.
pub fn lock_order(ids: &[EntryId]) -> Vec<EntryId> {
    let mut ordered = ids.to_vec();
    ordered.sort();
    ordered.dedup();
    ordered
}

#[derive(Iden, Clone, Copy)]
struct MatchCount;

/// Recursive table of the container ids at or below a search base.
#[derive(Iden, Clone, Copy)]
enum ScopeParents {
    Table,
    Id,
}

/// `WITH RECURSIVE` prefix for scopes that reach below the base's children.
/// The walk only expands ids carrying a container marker.
fn scope_walk(base: EntryId, scope: Scope) -> Option<String> {
    match scope {
        Scope::Base | Scope::One => None,
        Scope::Sub | Scope::Children => Some(format!(
            "WITH RECURSIVE scope_parents (id) AS (\
             SELECT id FROM ldap_containers WHERE id = {base} \
             UNION ALL \
             SELECT ldap_containers.id FROM ldap_entries \
             JOIN scope_parents ON ldap_entries.parent_id = scope_parents.id \
             JOIN ldap_containers ON ldap_containers.id = ldap_entries.id)",
            base = base.as_i64()
        )),
    }
}

/// Restricts `ldap_entries` to `scope` below `base`. Sub and children scopes
/// read the table produced by [`scope_walk`].
fn scope_condition(base: EntryId, scope: Scope) -> Condition {
    let id = Expr::col((LdapEntries::Table, LdapEntries::Id));
    let parent = Expr::col((LdapEntries::Table, LdapEntries::ParentId));
    let below = || {
        parent.clone().in_subquery(
            Query::select()
                .column(ScopeParents::Id)
                .from(ScopeParents::Table)
                .to_owned(),
        )
    };
    match scope {
        Scope::Base => Cond::all().add(id.eq(base.as_i64())),
        Scope::One => Cond::all().add(parent.clone().eq(base.as_i64())),
        Scope::Sub => Cond::any().add(id.eq(base.as_i64())).add(below()),
        Scope::Children => Cond::all().add(below()),
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::sea_query::{QueryStatementWriter, SqliteQueryBuilder};

    use super::*;

    #[test]
    fn locks_are_taken_in_ascending_id_order() {
        let ids = [EntryId(9), EntryId(2), EntryId(9), EntryId(5), EntryId(2)];
        assert_eq!(lock_order(&ids), vec![EntryId(2), EntryId(5), EntryId(9)]);
        let reversed: Vec<EntryId> = ids.iter().rev().copied().collect();
        assert_eq!(lock_order(&reversed), lock_order(&ids));
    }

    #[test]
    fn subtree_scopes_walk_containers_only() {
        assert!(scope_walk(EntryId(3), Scope::Base).is_none());
        assert!(scope_walk(EntryId(3), Scope::One).is_none());
        let walk = scope_walk(EntryId(3), Scope::Sub).expect("walk");
        assert!(walk.starts_with("WITH RECURSIVE scope_parents (id)"), "{walk}");
        assert!(walk.contains("WHERE id = 3"), "{walk}");
        assert!(walk.contains("JOIN ldap_containers"), "{walk}");

        let sql = Query::select()
            .column(LdapEntries::Id)
            .from(LdapEntries::Table)
            .cond_where(scope_condition(EntryId(3), Scope::Children))
            .to_string(SqliteQueryBuilder);
        assert!(sql.contains(r#"IN (SELECT "id" FROM "scope_parents")"#), "{sql}");
        assert!(!sql.contains(r#""ldap_entries"."id" = 3"#), "{sql}");
    }
}
