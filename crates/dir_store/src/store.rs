use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::sea_query::{Expr, ExprTrait, OnConflict, Query};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    DatabaseTransaction, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;

use crate::association::AssociationResolver;
use crate::cache::{CacheStats, QueryCache};
use crate::db::*;
use crate::migration::Migrator;
use crate::query;
use crate::tree::{DnCache, EntryRow, Tree};
use crate::{DatabaseConfig, DirConfig};
use kestrel_dir_core::schema::USER_PASSWORD;
use kestrel_dir_core::{
    AddEntry, CompileOptions, CompiledQuery, DirError, DirResult, Dn, Document, Entry, EntryId,
    EntryUuid, Filter, LockMode, ModifyEntry, Mutation, PageRequest, Repository,
    SchemaCatalog, Scope, SearchPage, Timestamp, decode_search_cookie, encode_search_cookie,
};

/// Sea-orm backed directory tree. Cheap to clone; clones share the pool and
/// the compiled filter cache.
#[derive(Clone)]
pub struct DirStore {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    tree: Tree,
    associations: AssociationResolver,
    root_dn: Option<Dn>,
    root_password: Option<String>,
    limits: StoreLimits,
    queries: Arc<QueryCache>,
}

#[derive(Clone, Copy, Debug)]
struct StoreLimits {
    max_page_size: u32,
    max_filter_depth: usize,
    lock_timeout_ms: Option<u64>,
}

impl StoreLimits {
    fn from_config(config: &DirConfig) -> Self {
        let limits = config.limits();
        Self {
            max_page_size: limits.max_page_size(),
            max_filter_depth: limits.max_filter_depth(),
            lock_timeout_ms: limits.lock_timeout_ms,
        }
    }
}

/// New parent and RDN columns written by a rename or move.
struct Placement {
    parent: EntryId,
    rdn_norm: String,
    rdn_orig: String,
}

impl DirStore {
    pub async fn connect(config: &DirConfig, base_dir: &Path) -> DirResult<Self> {
        let url = build_connection_url(config, base_dir)?;
        let mut options = ConnectOptions::new(url);
        let pool = config.pool.clone().unwrap_or_default();
        // SQLite has a single writer; one pooled connection avoids SQLITE_BUSY
        // on deferred transactions that upgrade to write.
        let max_connections = match config.database {
            DatabaseConfig::Sqlite { .. } => pool.max_connections.or(Some(1)),
            _ => pool.max_connections,
        };
        if let Some(max) = max_connections {
            options.max_connections(max);
        }
        if let Some(min) = pool.min_connections {
            options.min_connections(min);
        }
        if let Some(timeout_ms) = pool.connect_timeout_ms {
            options.connect_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(timeout_ms) = pool.acquire_timeout_ms {
            options.acquire_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(timeout_ms) = pool.idle_timeout_ms {
            options.idle_timeout(Duration::from_millis(timeout_ms));
        }
        let conn = Database::connect(options).await?;
        let backend = conn.get_database_backend();
        Migrator::up(&conn, None).await?;
        log::info!("connected {} directory store", config.backend_name());

        let mut builder = SchemaCatalog::builder();
        for extension in &config.directory.schema_extensions {
            builder = builder.definitions(extension.clone());
        }
        let catalog = Arc::new(builder.build()?);

        let suffix = Dn::parse(&catalog, &config.directory.suffix)?;
        if suffix.is_anonymous() {
            return Err(DirError::config("directory suffix must not be empty"));
        }
        let root_dn = match config.directory.root_dn.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Some(Dn::parse(&catalog, raw)?),
            _ => None,
        };

        let tree = Tree::new(backend, catalog, suffix);
        let associations =
            AssociationResolver::new(tree.clone(), config.directory.association_policy);
        let limits = StoreLimits::from_config(config);
        let queries = Arc::new(QueryCache::new(config.limits().query_cache_capacity()));
        Ok(Self {
            conn,
            backend,
            tree,
            associations,
            root_dn,
            root_password: config.directory.root_password.clone(),
            limits,
            queries,
        })
    }

    pub async fn connect_sqlite(path: &Path) -> DirResult<Self> {
        let config = DirConfig::default_sqlite(path.to_string_lossy());
        Self::connect(&config, path.parent().unwrap_or_else(|| Path::new("."))).await
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub fn schema(&self) -> &Arc<SchemaCatalog> {
        self.tree.catalog()
    }

    pub fn suffix(&self) -> &Dn {
        self.tree.suffix()
    }

    /// Parses a DN against this store's schema.
    pub fn parse_dn(&self, raw: &str) -> DirResult<Dn> {
        Dn::parse(self.schema(), raw)
    }

    /// Opens a transaction with the configured lock wait timeout applied.
    pub async fn begin(&self) -> DirResult<DatabaseTransaction> {
        let tx = self.conn.begin().await?;
        if let Some(timeout_ms) = self.limits.lock_timeout_ms {
            match self.backend {
                DatabaseBackend::Postgres => {
                    tx.execute_unprepared(&format!("SET LOCAL lock_timeout = {timeout_ms}"))
                        .await?;
                }
                DatabaseBackend::MySql => {
                    let secs = Ord::max(timeout_ms.div_ceil(1000), 1);
                    tx.execute_unprepared(&format!(
                        "SET SESSION innodb_lock_wait_timeout = {secs}"
                    ))
                    .await?;
                }
                _ => {}
            }
        }
        Ok(tx)
    }

    /// Compiles through the store's cache, using its association policy and
    /// depth limit.
    pub fn compile(&self, filter: &Filter) -> DirResult<CompiledQuery> {
        let options = CompileOptions {
            policy: self.associations.policy(),
            max_depth: self.limits.max_filter_depth,
        };
        self.queries.get_or_insert(&filter.to_string(), || {
            kestrel_dir_core::compile(self.schema(), filter, &options)
        })
    }

    pub fn compile_str(&self, raw: &str) -> DirResult<CompiledQuery> {
        self.compile(&Filter::parse(raw)?)
    }

    pub fn query_cache_stats(&self) -> CacheStats {
        self.queries.stats()
    }

    /// SQL of a resolved query, for diagnostics.
    pub fn explain(&self, query: &CompiledQuery) -> DirResult<String> {
        query::explain(self.backend, query)
    }

    /// Looks `dn` up on `conn`, locking the entry row with `lock`.
    pub async fn find_by_dn_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        dn: &Dn,
        lock: LockMode,
    ) -> DirResult<Entry> {
        let row = self
            .tree
            .locate(conn, dn, lock)
            .await?
            .ok_or_else(|| DirError::no_such_object(dn.orig_string()))?;
        let mut cache = DnCache::new();
        self.materialize(conn, row, &mut cache).await
    }

    async fn materialize<C: ConnectionTrait>(
        &self,
        conn: &C,
        row: EntryRow,
        cache: &mut DnCache,
    ) -> DirResult<Entry> {
        let dn = self.tree.dn_of(conn, &row, cache).await?;
        let attrs_norm: Document = serde_json::from_str(&row.attrs_norm)?;
        let attrs_orig: Document = serde_json::from_str(&row.attrs_orig)?;
        let relations = self.associations.load(conn, row.id, cache).await?;
        let has_subordinates = self.tree.is_container(conn, row.id).await?;
        Ok(Entry {
            id: row.id,
            parent_id: row.parent_id,
            dn,
            entry_uuid: EntryUuid::parse(&row.entry_uuid)?,
            created: Timestamp::from_i64(row.created_at),
            updated: Timestamp::from_i64(row.updated_at),
            attrs_norm,
            attrs_orig,
            relations,
            has_subordinates,
        })
    }

    /// Persists documents, value index and `modifyTimestamp` of a modified
    /// entry, plus its new position when renamed.
    async fn write_attributes<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: EntryId,
        modify: &ModifyEntry,
        placement: Option<Placement>,
    ) -> DirResult<()> {
        let (norm, orig) = modify.documents();
        let mut update = Query::update()
            .table(LdapEntries::Table)
            .value(LdapEntries::AttrsNorm, serde_json::to_string(&norm)?)
            .value(LdapEntries::AttrsOrig, serde_json::to_string(&orig)?)
            .value(LdapEntries::UpdatedAt, Timestamp::now().as_i64())
            .and_where(Expr::col(LdapEntries::Id).eq(id.as_i64()))
            .to_owned();
        if let Some(placement) = placement {
            update
                .value(LdapEntries::ParentId, placement.parent.as_i64())
                .value(LdapEntries::RdnNorm, placement.rdn_norm)
                .value(LdapEntries::RdnOrig, placement.rdn_orig);
        }
        exec(conn, &update).await?;
        self.tree.write_index(conn, id, &norm).await
    }

    /// Binds every pending DN parameter, memoizing lookups per search.
    async fn resolve_pending<C: ConnectionTrait>(
        &self,
        conn: &C,
        query: &mut CompiledQuery,
    ) -> DirResult<()> {
        let pending: Vec<_> = query
            .pending
            .iter()
            .map(|(key, dn)| (*key, dn.clone()))
            .collect();
        let mut resolved: HashMap<String, Option<EntryId>> = HashMap::new();
        for (key, raw) in pending {
            let id = match resolved.get(&raw) {
                Some(id) => *id,
                None => {
                    let id = match Dn::parse(self.schema(), &raw) {
                        Ok(dn) => self
                            .tree
                            .locate(conn, &dn, LockMode::None)
                            .await?
                            .map(|row| row.id),
                        Err(_) => None,
                    };
                    resolved.insert(raw, id);
                    id
                }
            };
            query.resolve(key, id);
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for DirStore {
    async fn insert(&self, entry: AddEntry) -> DirResult<EntryId> {
        entry.validate()?;
        let dn = entry.dn().clone();
        if !self.tree.contains(&dn) {
            return Err(DirError::no_such_object(dn.orig_string()));
        }
        let (rdn_norm, rdn_orig) = self.tree.rdn_columns(&dn)?;
        let (norm, orig) = entry.documents();
        let attrs_norm = serde_json::to_string(&norm)?;
        let attrs_orig = serde_json::to_string(&orig)?;
        let relations = entry.relations();
        let entry_uuid = EntryUuid::new();
        let now = Timestamp::now();

        let tx = self.begin().await?;
        let parent_id = if self.tree.is_suffix(&dn) {
            // The suffix row has a NULL parent, which the unique index ignores.
            if self
                .tree
                .child(&tx, None, &rdn_norm, LockMode::None)
                .await?
                .is_some()
            {
                return Err(DirError::AlreadyExists {
                    dn: dn.orig_string(),
                });
            }
            None
        } else {
            let parent_dn = dn
                .parent()
                .ok_or_else(|| DirError::no_such_object(dn.orig_string()))?;
            let parent = self
                .tree
                .locate(&tx, &parent_dn, LockMode::Share)
                .await?
                .ok_or_else(|| DirError::no_such_object(parent_dn.orig_string()))?;
            Some(parent.id)
        };

        let insert = Query::insert()
            .into_table(LdapEntries::Table)
            .columns([
                LdapEntries::ParentId,
                LdapEntries::RdnNorm,
                LdapEntries::RdnOrig,
                LdapEntries::AttrsNorm,
                LdapEntries::AttrsOrig,
                LdapEntries::EntryUuid,
                LdapEntries::CreatedAt,
                LdapEntries::UpdatedAt,
            ])
            .values_panic([
                parent_id.map(EntryId::as_i64).into(),
                rdn_norm.into(),
                rdn_orig.into(),
                attrs_norm.into(),
                attrs_orig.into(),
                entry_uuid.to_string().into(),
                now.as_i64().into(),
                now.as_i64().into(),
            ])
            .on_conflict(
                OnConflict::columns([LdapEntries::ParentId, LdapEntries::RdnNorm])
                    .do_nothing()
                    .to_owned(),
            )
            .to_owned();
        if exec_count(&tx, &insert).await? == 0 {
            return Err(DirError::AlreadyExists {
                dn: dn.orig_string(),
            });
        }

        let select = Query::select()
            .from(LdapEntries::Table)
            .column(LdapEntries::Id)
            .and_where(Expr::col(LdapEntries::EntryUuid).eq(entry_uuid.to_string()))
            .to_owned();
        let row = query_one(&tx, &select)
            .await?
            .ok_or_else(|| DirError::system(format!("inserted entry {dn} not found")))?;
        let id = read_entry_id(&row, LdapEntries::Id)?;

        if let Some(parent) = parent_id {
            self.tree.ensure_container(&tx, parent).await?;
        }
        self.tree.write_index(&tx, id, &norm).await?;
        self.associations.on_insert(&tx, id, &relations).await?;
        tx.commit().await?;
        log::debug!("added {dn} as entry {id}");
        Ok(id)
    }

    async fn find_by_dn(&self, dn: &Dn) -> DirResult<Entry> {
        self.find_by_dn_in(&self.conn, dn, LockMode::None).await
    }

    async fn update(&self, dn: &Dn, mutate: Mutation) -> DirResult<()> {
        let tx = self.begin().await?;
        let current = self.find_by_dn_in(&tx, dn, LockMode::Update).await?;
        let mut modify = ModifyEntry::from_entry(self.schema().clone(), &current);
        mutate(&mut modify)?;
        modify.validate()?;
        self.write_attributes(&tx, current.id, &modify, None).await?;
        self.associations
            .on_update(&tx, current.id, modify.changes())
            .await?;
        tx.commit().await?;
        log::debug!("modified {dn}");
        Ok(())
    }

    async fn update_dn(&self, old_dn: &Dn, new_dn: &Dn, keep_old_rdn: bool) -> DirResult<()> {
        if self.tree.is_suffix(old_dn) {
            return Err(DirError::unwilling("cannot rename or move the suffix entry"));
        }
        if new_dn.is_descendant_of(old_dn) {
            return Err(DirError::unwilling("cannot move an entry beneath itself"));
        }
        let new_parent_dn = new_dn
            .parent()
            .ok_or_else(|| DirError::unwilling("new DN has no parent"))?;
        if !self.tree.contains(&new_parent_dn) {
            return Err(DirError::no_such_object(new_parent_dn.orig_string()));
        }
        let (rdn_norm, rdn_orig) = self.tree.rdn_columns(new_dn)?;

        let tx = self.begin().await?;
        let found = self
            .tree
            .locate(&tx, old_dn, LockMode::None)
            .await?
            .ok_or_else(|| DirError::no_such_object(old_dn.orig_string()))?;
        let old_parent = found
            .parent_id
            .ok_or_else(|| DirError::unwilling("cannot rename or move the suffix entry"))?;
        let new_parent = if old_dn.parent().as_ref() == Some(&new_parent_dn) {
            old_parent
        } else {
            self.tree
                .locate(&tx, &new_parent_dn, LockMode::None)
                .await?
                .ok_or_else(|| DirError::no_such_object(new_parent_dn.orig_string()))?
                .id
        };
        let moving = new_parent != old_parent;

        let mut lock_set = vec![found.id];
        if moving {
            lock_set.extend([old_parent, new_parent]);
        }
        let locked = self.tree.lock_ids(&tx, &lock_set, LockMode::Update).await?;
        if !locked.contains(&new_parent) && moving {
            return Err(DirError::no_such_object(new_parent_dn.orig_string()));
        }
        let row = self
            .tree
            .row_by_id(&tx, found.id, LockMode::None)
            .await?
            .ok_or_else(|| DirError::no_such_object(old_dn.orig_string()))?;
        if row.parent_id != Some(old_parent) || row.rdn_norm != found.rdn_norm {
            return Err(DirError::system(format!("{old_dn} was moved concurrently")));
        }
        if let Some(existing) = self
            .tree
            .child(&tx, Some(new_parent), &rdn_norm, LockMode::None)
            .await?
            && existing.id != row.id
        {
            return Err(DirError::AlreadyExists {
                dn: new_dn.orig_string(),
            });
        }

        let mut cache = DnCache::new();
        let current = self.materialize(&tx, row, &mut cache).await?;
        let mut modify = ModifyEntry::from_entry(self.schema().clone(), &current);
        modify.rename_to(new_dn.clone(), keep_old_rdn)?;
        modify.validate()?;
        let placement = Placement {
            parent: new_parent,
            rdn_norm,
            rdn_orig,
        };
        self.write_attributes(&tx, current.id, &modify, Some(placement))
            .await?;
        self.associations
            .on_update(&tx, current.id, modify.changes())
            .await?;
        if moving {
            self.tree.ensure_container(&tx, new_parent).await?;
            self.tree.prune_container(&tx, old_parent).await?;
        }
        tx.commit().await?;
        log::debug!("renamed {old_dn} to {new_dn}");
        Ok(())
    }

    async fn delete_by_dn(&self, dn: &Dn) -> DirResult<()> {
        let tx = self.begin().await?;
        let found = self
            .tree
            .locate(&tx, dn, LockMode::None)
            .await?
            .ok_or_else(|| DirError::no_such_object(dn.orig_string()))?;
        let mut lock_set = vec![found.id];
        lock_set.extend(found.parent_id);
        self.tree.lock_ids(&tx, &lock_set, LockMode::Update).await?;
        let row = self
            .tree
            .row_by_id(&tx, found.id, LockMode::None)
            .await?
            .ok_or_else(|| DirError::no_such_object(dn.orig_string()))?;
        if row.parent_id != found.parent_id {
            return Err(DirError::system(format!("{dn} was moved concurrently")));
        }
        if self.tree.is_container(&tx, row.id).await? {
            return Err(DirError::NotAllowedOnNonLeaf {
                dn: dn.orig_string(),
            });
        }
        self.associations.on_delete(&tx, row.id).await?;
        self.tree.delete_row(&tx, row.id).await?;
        if let Some(parent) = row.parent_id {
            self.tree.prune_container(&tx, parent).await?;
        }
        tx.commit().await?;
        log::debug!("deleted {dn}");
        Ok(())
    }

    async fn search(
        &self,
        base: &Dn,
        scope: Scope,
        mut query: CompiledQuery,
        page: PageRequest,
    ) -> DirResult<SearchPage> {
        let offset = match page.cookie.as_deref() {
            Some(cookie) if !cookie.is_empty() => decode_search_cookie(cookie)?,
            _ => 0,
        };
        let size = page_size(page.size, self.limits.max_page_size);

        let tx = self.begin().await?;
        let base_row = self
            .tree
            .locate(&tx, base, LockMode::None)
            .await?
            .ok_or_else(|| DirError::no_such_object(base.orig_string()))?;
        self.resolve_pending(&tx, &mut query).await?;
        let filter = query::condition(&query)?;
        let match_count = self
            .tree
            .count_in_scope(&tx, base_row.id, scope, filter.clone())
            .await?;
        let rows = if offset < match_count {
            self.tree
                .page_in_scope(&tx, base_row.id, scope, filter, offset, size)
                .await?
        } else {
            Vec::new()
        };
        let mut cache = DnCache::new();
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(self.materialize(&tx, row, &mut cache).await?);
        }
        tx.commit().await?;

        let returned_count = entries.len() as u64;
        let end = offset.saturating_add(returned_count);
        let cookie = if end < match_count {
            Some(encode_search_cookie(end)?)
        } else {
            None
        };
        log::debug!("search {base} scope {scope:?}: {returned_count} of {match_count} matches");
        Ok(SearchPage {
            match_count,
            returned_count,
            entries,
            cookie,
        })
    }

    async fn find_credential_by_dn(&self, dn: &Dn) -> DirResult<Vec<String>> {
        if let (Some(root_dn), Some(password)) = (&self.root_dn, &self.root_password)
            && root_dn == dn
        {
            return Ok(vec![password.clone()]);
        }
        let entry = self.find_by_dn(dn).await?;
        Ok(entry.values(self.schema(), USER_PASSWORD))
    }
}

/// Rows per page: the requested size capped at `max`, or `max` when unset.
fn page_size(requested: Option<u32>, max: u32) -> u64 {
    let requested = requested.filter(|size| *size > 0).unwrap_or(max);
    u64::from(Ord::min(requested, max))
}

fn build_connection_url(config: &DirConfig, base_dir: &Path) -> DirResult<String> {
    match &config.database {
        DatabaseConfig::Sqlite { .. } => {
            let path = config.sqlite_path(base_dir)?;
            Ok(format!("sqlite://{}?mode=rwc", path.display()))
        }
        DatabaseConfig::Postgres { url } => Ok(url.clone()),
        DatabaseConfig::Mysql { url } => Ok(url.clone()),
    }
}
