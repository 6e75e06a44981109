use std::collections::HashSet;

use kestrel_dir_store::{DirConfig, DirError, DirResult, DirStore};
use sea_orm::{ConnectionTrait, DatabaseBackend, Statement};
use tempfile::tempdir;

async fn list_names(store: &DirStore, kind: &str) -> DirResult<HashSet<String>> {
    let rows = store
        .connection()
        .query_all_raw(Statement::from_string(
            DatabaseBackend::Sqlite,
            format!("SELECT name FROM sqlite_master WHERE type = '{kind}'"),
        ))
        .await
        .map_err(DirError::from)?;
    let mut names = HashSet::new();
    for row in rows {
        let name: String = row.try_get("", "name").map_err(DirError::from)?;
        names.insert(name);
    }
    Ok(names)
}

#[tokio::test]
async fn sqlite_migrations_create_directory_tables() -> DirResult<()> {
    let dir = tempdir().expect("tempdir");
    let base = dir.path();
    let config = DirConfig::default_sqlite(base.join("directory.sqlite").to_string_lossy());
    let store = DirStore::connect(&config, base).await?;

    let tables = list_names(&store, "table").await?;
    for table in [
        "ldap_entries",
        "ldap_containers",
        "ldap_associations",
        "ldap_attr_values",
    ] {
        assert!(tables.contains(table), "expected table '{table}' to exist");
    }
    let indexes = list_names(&store, "index").await?;
    for index in [
        "ldap_entries_parent_rdn_uidx",
        "ldap_entries_uuid_uidx",
        "ldap_associations_member_idx",
    ] {
        assert!(indexes.contains(index), "expected index '{index}' to exist");
    }

    // Idempotency check.
    drop(store);
    let _store = DirStore::connect(&config, base).await?;
    Ok(())
}

#[tokio::test]
async fn empty_suffix_is_a_config_error() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path();
    let config =
        DirConfig::default_sqlite(base.join("directory.sqlite").to_string_lossy()).with_suffix("");
    let err = DirStore::connect(&config, base).await.err().expect("empty suffix");
    assert!(matches!(err, DirError::Config { .. }), "{err}");
}
