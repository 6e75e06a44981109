use std::path::{Path, PathBuf};

use crate::config::DEFAULT_DB_NAME;
use crate::{DirConfig, DirResult, DirStore};

pub fn load_or_init_config(base: &Path) -> DirResult<DirConfig> {
    let default_sqlite = base.join(DEFAULT_DB_NAME);
    DirConfig::load_or_init(base, &default_sqlite)
}

pub async fn open_store(base: &Path) -> DirResult<DirStore> {
    let config = load_or_init_config(base)?;
    DirStore::connect(&config, base).await
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_DB_NAME)
}
