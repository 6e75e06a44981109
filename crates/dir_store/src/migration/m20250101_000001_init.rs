use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

use crate::db::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();

        manager
            .create_table(
                Table::create()
                    .table(LdapEntries::Table)
                    .if_not_exists()
                    .col(serial_col(backend, LdapEntries::Id))
                    .col(ref_col(backend, LdapEntries::ParentId, true))
                    .col(ColumnDef::new(LdapEntries::RdnNorm).string_len(512).not_null())
                    .col(ColumnDef::new(LdapEntries::RdnOrig).string_len(512).not_null())
                    .col(ColumnDef::new(LdapEntries::AttrsNorm).text().not_null())
                    .col(ColumnDef::new(LdapEntries::AttrsOrig).text().not_null())
                    .col(ColumnDef::new(LdapEntries::EntryUuid).string_len(36).not_null())
                    .col(ColumnDef::new(LdapEntries::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(LdapEntries::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("ldap_entries_parent_rdn_uidx")
                    .table(LdapEntries::Table)
                    .col(LdapEntries::ParentId)
                    .col(LdapEntries::RdnNorm)
                    .unique()
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("ldap_entries_uuid_uidx")
                    .table(LdapEntries::Table)
                    .col(LdapEntries::EntryUuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LdapContainers::Table)
                    .if_not_exists()
                    .col(ref_col(backend, LdapContainers::Id, false))
                    .primary_key(
                        Index::create()
                            .name("pk_ldap_containers")
                            .col(LdapContainers::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LdapAssociations::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(LdapAssociations::Name).string_len(64).not_null())
                    .col(ref_col(backend, LdapAssociations::OwnerId, false))
                    .col(ref_col(backend, LdapAssociations::MemberId, false))
                    .primary_key(
                        Index::create()
                            .name("pk_ldap_associations")
                            .col(LdapAssociations::Name)
                            .col(LdapAssociations::OwnerId)
                            .col(LdapAssociations::MemberId),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("ldap_associations_member_idx")
                    .table(LdapAssociations::Table)
                    .col(LdapAssociations::Name)
                    .col(LdapAssociations::MemberId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(LdapAttrValues::Table)
                    .if_not_exists()
                    .col(ref_col(backend, LdapAttrValues::EntryId, false))
                    .col(ColumnDef::new(LdapAttrValues::Attr).string_len(128).not_null())
                    .col(ColumnDef::new(LdapAttrValues::ValueNorm).string_len(1024).not_null())
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("ldap_attr_values_entry_idx")
                    .table(LdapAttrValues::Table)
                    .col(LdapAttrValues::EntryId)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(attr_value_index(backend))
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(LdapAttrValues::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(LdapAssociations::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(LdapContainers::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(LdapEntries::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}

/// InnoDB caps index keys at 3072 bytes, so MySQL indexes a prefix of the
/// value column. Longer prefixes only matter for range scans.
const MYSQL_VALUE_PREFIX: u32 = 255;

fn attr_value_index(backend: DatabaseBackend) -> IndexCreateStatement {
    let mut index = Index::create()
        .name("ldap_attr_values_attr_value_idx")
        .table(LdapAttrValues::Table)
        .col(LdapAttrValues::Attr)
        .to_owned();
    match backend {
        DatabaseBackend::MySql => index.col((LdapAttrValues::ValueNorm, MYSQL_VALUE_PREFIX)),
        _ => index.col(LdapAttrValues::ValueNorm),
    };
    index
}

/// Auto-assigned entry id. SQLite needs `INTEGER` for rowid aliasing.
fn serial_col(backend: DatabaseBackend, col: impl Iden) -> ColumnDef {
    let mut col_def = ColumnDef::new(col);
    match backend {
        DatabaseBackend::Sqlite => {
            col_def.integer();
        }
        _ => {
            col_def.big_integer();
        }
    }
    col_def.not_null().auto_increment().primary_key();
    col_def.to_owned()
}

fn ref_col(backend: DatabaseBackend, col: impl Iden, nullable: bool) -> ColumnDef {
    let mut col_def = ColumnDef::new(col);
    match backend {
        DatabaseBackend::Sqlite => {
            col_def.integer();
        }
        _ => {
            col_def.big_integer();
        }
    }
    if nullable {
        col_def.null();
    } else {
        col_def.not_null();
    }
    col_def.to_owned()
}
