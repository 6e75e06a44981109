use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use crate::{AddEntry, CompiledQuery, DirError, DirResult, Dn, Entry, EntryId, ModifyEntry};

/// Row lock taken when reading an entry inside a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    None,
    Share,
    Update,
}

/// Search breadth relative to the base entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Base = 0,
    One = 1,
    Sub = 2,
    Children = 3,
}

impl TryFrom<u8> for Scope {
    type Error = DirError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Scope::Base),
            1 => Ok(Scope::One),
            2 => Ok(Scope::Sub),
            3 => Ok(Scope::Children),
            other => Err(DirError::unwilling(format!("unknown search scope {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationPolicy {
    /// `member` and `memberOf` edges are both stored.
    #[default]
    TwoWay,
    /// Only `member` edges are stored; `memberOf` is derived on read.
    OneWay,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// `None` returns every match, capped by the store's page limit.
    pub size: Option<u32>,
    pub cookie: Option<String>,
}

impl PageRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn first(size: u32) -> Self {
        Self {
            size: Some(size),
            cookie: None,
        }
    }

    pub fn next(size: u32, cookie: impl Into<String>) -> Self {
        Self {
            size: Some(size),
            cookie: Some(cookie.into()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SearchPage {
    pub entries: Vec<Entry>,
    /// Matches in scope before paging.
    pub match_count: u64,
    pub returned_count: u64,
    /// Present only when more matches remain.
    pub cookie: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchCursor {
    pub offset: u64,
}

pub fn encode_search_cookie(offset: u64) -> DirResult<String> {
    let payload = serde_json::to_vec(&SearchCursor { offset })?;
    Ok(URL_SAFE_NO_PAD.encode(payload))
}

pub fn decode_search_cookie(cookie: &str) -> DirResult<u64> {
    let decoded = URL_SAFE_NO_PAD
        .decode(cookie.as_bytes())
        .map_err(|_| DirError::unwilling("invalid paged results cookie"))?;
    let parsed: SearchCursor = serde_json::from_slice(&decoded)
        .map_err(|_| DirError::unwilling("invalid paged results cookie"))?;
    Ok(parsed.offset)
}

/// Caller-supplied modification applied inside the update transaction.
pub type Mutation = Box<dyn FnOnce(&mut ModifyEntry) -> DirResult<()> + Send>;

#[async_trait]
pub trait Repository {
    async fn insert(&self, entry: AddEntry) -> DirResult<EntryId>;

    async fn find_by_dn(&self, dn: &Dn) -> DirResult<Entry>;

    async fn update(&self, dn: &Dn, mutate: Mutation) -> DirResult<()>;

    async fn update_dn(&self, old_dn: &Dn, new_dn: &Dn, keep_old_rdn: bool) -> DirResult<()>;

    async fn delete_by_dn(&self, dn: &Dn) -> DirResult<()>;

    async fn search(
        &self,
        base: &Dn,
        scope: Scope,
        query: CompiledQuery,
        page: PageRequest,
    ) -> DirResult<SearchPage>;

    /// Password values usable for a simple bind as `dn`.
    async fn find_credential_by_dn(&self, dn: &Dn) -> DirResult<Vec<String>>;
}
