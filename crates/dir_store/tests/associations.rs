mod common;

use common::{add, add_person, dn, open, open_with, search_dns, seed};
use kestrel_dir_store::mapper::{Change, ChangeOp, apply_changes};
use kestrel_dir_store::{
    AssociationPolicy, DirError, DirResult, DirStore, ModifyEntry, Repository, Scope,
};
use tempfile::tempdir;

const ALICE: &str = "cn=alice,ou=people,dc=example,dc=com";
const BOB: &str = "cn=bob,ou=people,dc=example,dc=com";
const ADMINS: &str = "cn=admins,ou=groups,dc=example,dc=com";

async fn add_group(store: &DirStore, raw_dn: &str, cn: &str, members: Vec<&str>) -> DirResult<()> {
    add(
        store,
        raw_dn,
        vec![
            ("objectClass", vec!["top", "groupOfNames"]),
            ("cn", vec![cn]),
            ("member", members),
        ],
    )
    .await?;
    Ok(())
}

/// Normalized DNs held in relation attribute `name`, sorted.
async fn related(store: &DirStore, raw_dn: &str, name: &str) -> DirResult<Vec<String>> {
    let entry = store.find_by_dn(&dn(store, raw_dn)).await?;
    let mut dns: Vec<String> = entry
        .relations
        .get(name)
        .map(|targets| targets.iter().map(|target| target.norm_string()).collect())
        .unwrap_or_default();
    dns.sort();
    Ok(dns)
}

async fn member_of(store: &DirStore, raw_dn: &str) -> DirResult<Vec<String>> {
    related(store, raw_dn, "memberOf").await
}

async fn members(store: &DirStore, raw_dn: &str) -> DirResult<Vec<String>> {
    related(store, raw_dn, "member").await
}

#[tokio::test]
async fn group_insert_links_both_directions() -> DirResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    seed(&store).await?;
    add_person(&store, ALICE, "alice", "a").await?;
    add_person(&store, BOB, "bob", "b").await?;
    add_group(&store, ADMINS, "admins", vec!["CN=Alice,OU=People,DC=Example,DC=Com"]).await?;

    assert_eq!(members(&store, ADMINS).await?, vec![ALICE.to_string()]);
    assert_eq!(member_of(&store, ALICE).await?, vec![ADMINS.to_string()]);
    assert!(member_of(&store, BOB).await?.is_empty());

    let hits = search_dns(
        &store,
        "dc=example,dc=com",
        Scope::Sub,
        "(memberOf=cn=Admins,ou=Groups,dc=example,dc=com)",
    )
    .await?;
    assert_eq!(hits, vec![ALICE.to_string()]);
    Ok(())
}

#[tokio::test]
async fn membership_changes_follow_modifications() -> DirResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    seed(&store).await?;
    add_person(&store, ALICE, "alice", "a").await?;
    add_person(&store, BOB, "bob", "b").await?;
    add_group(&store, ADMINS, "admins", vec![ALICE]).await?;

    store
        .update(
            &dn(&store, ADMINS),
            Box::new(move |entry: &mut ModifyEntry| {
                apply_changes(
                    entry,
                    vec![
                        Change::new(ChangeOp::Add, "member", [BOB]),
                        Change::new(ChangeOp::Delete, "member", [ALICE]),
                    ],
                )
            }),
        )
        .await?;

    assert_eq!(members(&store, ADMINS).await?, vec![BOB.to_string()]);
    assert!(member_of(&store, ALICE).await?.is_empty());
    assert_eq!(member_of(&store, BOB).await?, vec![ADMINS.to_string()]);

    let err = store
        .update(
            &dn(&store, ADMINS),
            Box::new(|entry: &mut ModifyEntry| entry.delete("member", Vec::<String>::new())),
        )
        .await
        .expect_err("member is required");
    assert!(matches!(err, DirError::ObjectClassViolation { .. }), "{err}");
    assert_eq!(members(&store, ADMINS).await?, vec![BOB.to_string()]);
    Ok(())
}

#[tokio::test]
async fn unknown_member_reports_its_position() -> DirResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    seed(&store).await?;
    add_person(&store, ALICE, "alice", "a").await?;

    let err = add_group(
        &store,
        ADMINS,
        "admins",
        vec![ALICE, "cn=ghost,ou=people,dc=example,dc=com"],
    )
    .await
    .expect_err("ghost member");
    match err {
        DirError::InvalidPerSyntax { attribute, index } => {
            assert_eq!(attribute, "member");
            assert_eq!(index, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    let missing = store.find_by_dn(&dn(&store, ADMINS)).await.expect_err("rolled back");
    assert!(matches!(missing, DirError::NoSuchObject { .. }), "{missing}");
    assert!(member_of(&store, ALICE).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn member_of_is_not_user_modifiable() -> DirResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    seed(&store).await?;
    add_person(&store, ALICE, "alice", "a").await?;
    add_group(&store, ADMINS, "admins", vec![ALICE]).await?;

    let err = store
        .update(
            &dn(&store, ALICE),
            Box::new(|entry: &mut ModifyEntry| entry.add("memberOf", [ADMINS])),
        )
        .await
        .expect_err("operational");
    assert!(
        matches!(err, DirError::NoUserModificationAllowed { .. }),
        "{err}"
    );
    Ok(())
}

#[tokio::test]
async fn one_way_policy_derives_member_of_on_read() -> DirResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open_with(dir.path(), AssociationPolicy::OneWay).await?;
    seed(&store).await?;
    add_person(&store, ALICE, "alice", "a").await?;
    add_person(&store, BOB, "bob", "b").await?;
    add_group(&store, ADMINS, "admins", vec![ALICE, BOB]).await?;
    add_group(
        &store,
        "cn=ops,ou=groups,dc=example,dc=com",
        "ops",
        vec![BOB],
    )
    .await?;

    assert_eq!(member_of(&store, ALICE).await?, vec![ADMINS.to_string()]);
    assert_eq!(
        member_of(&store, BOB).await?,
        vec![
            ADMINS.to_string(),
            "cn=ops,ou=groups,dc=example,dc=com".to_string()
        ]
    );

    let hits = search_dns(
        &store,
        "ou=people,dc=example,dc=com",
        Scope::One,
        "(memberOf=cn=ops,ou=groups,dc=example,dc=com)",
    )
    .await?;
    assert_eq!(hits, vec![BOB.to_string()]);

    let groups = search_dns(
        &store,
        "ou=groups,dc=example,dc=com",
        Scope::One,
        &format!("(member={ALICE})"),
    )
    .await?;
    assert_eq!(groups, vec![ADMINS.to_string()]);
    Ok(())
}

#[tokio::test]
async fn deleting_an_entry_removes_its_edges() -> DirResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    seed(&store).await?;
    add_person(&store, ALICE, "alice", "a").await?;
    add_person(&store, BOB, "bob", "b").await?;
    add_group(&store, ADMINS, "admins", vec![ALICE, BOB]).await?;

    store.delete_by_dn(&dn(&store, ALICE)).await?;
    assert_eq!(members(&store, ADMINS).await?, vec![BOB.to_string()]);

    store.delete_by_dn(&dn(&store, ADMINS)).await?;
    assert!(member_of(&store, BOB).await?.is_empty());

    let stale = search_dns(
        &store,
        "dc=example,dc=com",
        Scope::Sub,
        &format!("(member={BOB})"),
    )
    .await?;
    assert!(stale.is_empty());

    let ghost = search_dns(
        &store,
        "dc=example,dc=com",
        Scope::Sub,
        &format!("(|(member={ALICE})(cn=bob))"),
    )
    .await?;
    assert_eq!(ghost, vec![BOB.to_string()]);
    Ok(())
}
