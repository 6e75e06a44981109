pub mod api;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod ids;
pub mod mapper;
pub mod query;
pub mod schema;
pub mod schema_def;
pub mod time;

pub use api::*;
pub use dn::{Ava, Dn, Rdn};
pub use entry::*;
pub use error::{DirError, DirResult, ErrorCategory};
pub use filter::Filter;
pub use ids::*;
pub use query::{
    BoundValue, Column, CompareOp, CompileOptions, CompiledQuery, Direction, ParamKey, Predicate,
    compile,
};
pub use schema::{AttributeType, MatchKind, ObjectClass, RelationPair, SchemaBuilder, SchemaCatalog};
pub use time::*;
