use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DirError, DirResult};

/// Surrogate key of a stored entry. Ids are assigned by the database in
/// ascending order and define the lock acquisition order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub i64);

impl EntryId {
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value of the `entryUUID` operational attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct EntryUuid(pub Uuid);

impl EntryUuid {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> DirResult<Self> {
        let uuid = Uuid::parse_str(value.trim())
            .map_err(|err| DirError::system(format!("invalid entryUUID '{value}': {err}")))?;
        Ok(Self(uuid))
    }
}

impl Default for EntryUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}
