pub mod association;
pub mod cache;
pub mod config;
pub mod datastore;
mod db;
pub mod migration;
pub mod query;
pub mod store;
pub mod tree;

pub use kestrel_dir_core::*;

pub use association::AssociationResolver;
pub use cache::{CacheStats, QueryCache};
pub use config::{DatabaseConfig, DirConfig, DirectoryConfig, LimitsConfig, PoolConfig};
pub use datastore::{default_sqlite_path, load_or_init_config, open_store};
pub use store::DirStore;
