#![allow(dead_code)]

use std::path::Path;

use kestrel_dir_store::mapper::{WireAttribute, to_add_entry};
use kestrel_dir_store::{
    AssociationPolicy, DirConfig, DirResult, DirStore, Dn, EntryId, PageRequest, Repository,
    Scope,
};

pub const ROOT_PASSWORD: &str = "s3cret";

pub fn config(base: &Path, policy: AssociationPolicy) -> DirConfig {
    let mut config = DirConfig::default_sqlite(base.join("directory.sqlite").to_string_lossy());
    config.directory.association_policy = policy;
    config.directory.root_password = Some(ROOT_PASSWORD.to_string());
    config
}

pub async fn open(base: &Path) -> DirResult<DirStore> {
    open_with(base, AssociationPolicy::TwoWay).await
}

pub async fn open_with(base: &Path, policy: AssociationPolicy) -> DirResult<DirStore> {
    DirStore::connect(&config(base, policy), base).await
}

pub fn dn(store: &DirStore, raw: &str) -> Dn {
    store.parse_dn(raw).expect("dn")
}

pub fn attrs(pairs: Vec<(&str, Vec<&str>)>) -> Vec<WireAttribute> {
    pairs
        .into_iter()
        .map(|(name, values)| {
            (
                name.to_string(),
                values.into_iter().map(str::to_string).collect(),
            )
        })
        .collect()
}

pub async fn add(
    store: &DirStore,
    raw_dn: &str,
    pairs: Vec<(&str, Vec<&str>)>,
) -> DirResult<EntryId> {
    let entry = to_add_entry(store.schema(), raw_dn, attrs(pairs))?;
    store.insert(entry).await
}

pub async fn add_person(store: &DirStore, raw_dn: &str, cn: &str, sn: &str) -> DirResult<EntryId> {
    add(
        store,
        raw_dn,
        vec![
            ("objectClass", vec!["top", "person", "organizationalPerson", "inetOrgPerson"]),
            ("cn", vec![cn]),
            ("sn", vec![sn]),
        ],
    )
    .await
}

pub async fn add_unit(store: &DirStore, raw_dn: &str, ou: &str) -> DirResult<EntryId> {
    add(
        store,
        raw_dn,
        vec![("objectClass", vec!["top", "organizationalUnit"]), ("ou", vec![ou])],
    )
    .await
}

/// `dc=example,dc=com` with `ou=people` and `ou=groups` below it.
pub async fn seed(store: &DirStore) -> DirResult<()> {
    add(
        store,
        "dc=example,dc=com",
        vec![("objectClass", vec!["top", "domain"]), ("dc", vec!["example"])],
    )
    .await?;
    add_unit(store, "ou=People,dc=example,dc=com", "People").await?;
    add_unit(store, "ou=Groups,dc=example,dc=com", "Groups").await?;
    Ok(())
}

/// Normalized DNs of a search's entries, in result order.
pub async fn search_dns(
    store: &DirStore,
    base: &str,
    scope: Scope,
    filter: &str,
) -> DirResult<Vec<String>> {
    let query = store.compile_str(filter)?;
    let page = store
        .search(&dn(store, base), scope, query, PageRequest::all())
        .await?;
    Ok(page
        .entries
        .iter()
        .map(|entry| entry.dn.norm_string())
        .collect())
}
