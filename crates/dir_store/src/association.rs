//! Maintains `member` / `memberOf` edges in `ldap_associations`.

use std::collections::{BTreeMap, BTreeSet};

use sea_orm::ConnectionTrait;
use sea_orm::sea_query::{Cond, Expr, ExprTrait, OnConflict, Order, Query};

use crate::db::*;
use crate::tree::{DnCache, INSERT_CHUNK, Tree};
use kestrel_dir_core::{
    AssociationPolicy, ChangeLog, DirError, DirResult, Dn, EntryId, LockMode, RelationPair,
};

/// One stored edge: `name(owner) = member`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct Edge {
    name: String,
    owner: EntryId,
    member: EntryId,
}

#[derive(Clone)]
pub struct AssociationResolver {
    tree: Tree,
    relation: RelationPair,
    policy: AssociationPolicy,
}

impl AssociationResolver {
    pub fn new(tree: Tree, policy: AssociationPolicy) -> Self {
        let relation = tree.catalog().relation().clone();
        Self {
            tree,
            relation,
            policy,
        }
    }

    pub fn policy(&self) -> AssociationPolicy {
        self.policy
    }

    /// Edges implied by `entry` holding `target` in relation attribute `name`.
    fn edges(&self, name: &str, entry: EntryId, target: EntryId) -> Vec<Edge> {
        let primary = self.relation.primary.clone();
        let reverse = self.relation.reverse.clone();
        let (forward, backward) = if name == self.relation.primary {
            (
                Edge {
                    name: primary,
                    owner: entry,
                    member: target,
                },
                Edge {
                    name: reverse,
                    owner: target,
                    member: entry,
                },
            )
        } else {
            (
                Edge {
                    name: primary,
                    owner: target,
                    member: entry,
                },
                Edge {
                    name: reverse,
                    owner: entry,
                    member: target,
                },
            )
        };
        match self.policy {
            AssociationPolicy::TwoWay => vec![forward, backward],
            AssociationPolicy::OneWay => vec![forward],
        }
    }

    /// Resolves normalized DNs to ids. The first miss fails with its position.
    async fn resolve_targets<C: ConnectionTrait>(
        &self,
        conn: &C,
        name: &str,
        dns: &[String],
    ) -> DirResult<Vec<EntryId>> {
        let mut ids = Vec::with_capacity(dns.len());
        for (index, raw) in dns.iter().enumerate() {
            let invalid = || DirError::InvalidPerSyntax {
                attribute: name.to_string(),
                index,
            };
            let dn = Dn::parse(self.tree.catalog(), raw).map_err(|_| invalid())?;
            let row = self
                .tree
                .locate(conn, &dn, LockMode::None)
                .await?
                .ok_or_else(invalid)?;
            ids.push(row.id);
        }
        Ok(ids)
    }

    async fn insert_edges<C: ConnectionTrait>(&self, conn: &C, edges: &[Edge]) -> DirResult<()> {
        for chunk in edges.chunks(INSERT_CHUNK) {
            let mut insert = Query::insert()
                .into_table(LdapAssociations::Table)
                .columns([
                    LdapAssociations::Name,
                    LdapAssociations::OwnerId,
                    LdapAssociations::MemberId,
                ])
                .on_conflict(
                    OnConflict::columns([
                        LdapAssociations::Name,
                        LdapAssociations::OwnerId,
                        LdapAssociations::MemberId,
                    ])
                    .do_nothing()
                    .to_owned(),
                )
                .to_owned();
            for edge in chunk {
                insert.values_panic([
                    edge.name.clone().into(),
                    edge.owner.as_i64().into(),
                    edge.member.as_i64().into(),
                ]);
            }
            exec(conn, &insert).await?;
        }
        Ok(())
    }

    async fn delete_edges<C: ConnectionTrait>(&self, conn: &C, edges: &[Edge]) -> DirResult<()> {
        for edge in edges {
            let delete = Query::delete()
                .from_table(LdapAssociations::Table)
                .and_where(Expr::col(LdapAssociations::Name).eq(edge.name.as_str()))
                .and_where(Expr::col(LdapAssociations::OwnerId).eq(edge.owner.as_i64()))
                .and_where(Expr::col(LdapAssociations::MemberId).eq(edge.member.as_i64()))
                .to_owned();
            exec(conn, &delete).await?;
        }
        Ok(())
    }

    /// Resolves, share-locks and links the targets of one relation attribute.
    async fn link<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: EntryId,
        name: &str,
        dns: &[String],
    ) -> DirResult<()> {
        let targets = self.resolve_targets(conn, name, dns).await?;
        let locked = self.tree.lock_ids(conn, &targets, LockMode::Share).await?;
        if let Some(index) = targets.iter().position(|target| !locked.contains(target)) {
            return Err(DirError::InvalidPerSyntax {
                attribute: name.to_string(),
                index,
            });
        }
        let edges: BTreeSet<Edge> = targets
            .into_iter()
            .flat_map(|target| self.edges(name, id, target))
            .collect();
        let edges: Vec<Edge> = edges.into_iter().collect();
        self.insert_edges(conn, &edges).await
    }

    pub async fn on_insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: EntryId,
        relations: &BTreeMap<String, Vec<String>>,
    ) -> DirResult<()> {
        for (name, dns) in relations {
            if !dns.is_empty() {
                self.link(conn, id, name, dns).await?;
            }
        }
        Ok(())
    }

    /// Applies the relation part of a modification's change log.
    pub async fn on_update<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: EntryId,
        changes: &BTreeMap<String, ChangeLog>,
    ) -> DirResult<()> {
        for (name, log) in changes {
            if *name != self.relation.primary && *name != self.relation.reverse {
                continue;
            }
            if !log.removed.is_empty() {
                let mut edges = Vec::new();
                for raw in &log.removed {
                    let Ok(dn) = Dn::parse(self.tree.catalog(), raw) else {
                        continue;
                    };
                    // Edges to deleted entries are already gone.
                    if let Some(row) = self.tree.locate(conn, &dn, LockMode::None).await? {
                        edges.extend(self.edges(name, id, row.id));
                    }
                }
                self.delete_edges(conn, &edges).await?;
            }
            if !log.added.is_empty() {
                self.link(conn, id, name, &log.added).await?;
            }
        }
        Ok(())
    }

    pub async fn on_delete<C: ConnectionTrait>(&self, conn: &C, id: EntryId) -> DirResult<()> {
        let delete = Query::delete()
            .from_table(LdapAssociations::Table)
            .cond_where(
                Cond::any()
                    .add(Expr::col(LdapAssociations::OwnerId).eq(id.as_i64()))
                    .add(Expr::col(LdapAssociations::MemberId).eq(id.as_i64())),
            )
            .to_owned();
        exec(conn, &delete).await
    }

    /// Relation values of `id` keyed by canonical attribute name. In one-way
    /// mode the reverse attribute is read from the primary edges.
    pub async fn load<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: EntryId,
        cache: &mut DnCache,
    ) -> DirResult<BTreeMap<String, Vec<Dn>>> {
        let mut targets: BTreeMap<String, Vec<EntryId>> = BTreeMap::new();

        let owned = Query::select()
            .from(LdapAssociations::Table)
            .columns([LdapAssociations::Name, LdapAssociations::MemberId])
            .and_where(Expr::col(LdapAssociations::OwnerId).eq(id.as_i64()))
            .order_by(LdapAssociations::MemberId, Order::Asc)
            .to_owned();
        for row in query_all(conn, &owned).await? {
            let name: String = row.try_get("", &col_name(LdapAssociations::Name))?;
            let member = read_entry_id(&row, LdapAssociations::MemberId)?;
            targets.entry(name).or_default().push(member);
        }

        if self.policy == AssociationPolicy::OneWay {
            let reverse = Query::select()
                .from(LdapAssociations::Table)
                .column(LdapAssociations::OwnerId)
                .and_where(Expr::col(LdapAssociations::Name).eq(self.relation.primary.as_str()))
                .and_where(Expr::col(LdapAssociations::MemberId).eq(id.as_i64()))
                .order_by(LdapAssociations::OwnerId, Order::Asc)
                .to_owned();
            for row in query_all(conn, &reverse).await? {
                let owner = read_entry_id(&row, LdapAssociations::OwnerId)?;
                targets
                    .entry(self.relation.reverse.clone())
                    .or_default()
                    .push(owner);
            }
        }

        let mut relations = BTreeMap::new();
        for (name, ids) in targets {
            let mut dns = Vec::with_capacity(ids.len());
            for target in ids {
                dns.push(self.tree.dn_of_id(conn, target, cache).await?);
            }
            relations.insert(name, dns);
        }
        Ok(relations)
    }
}
