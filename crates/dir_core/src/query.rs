//! Filter compilation into a backend-neutral predicate.
//!
//! The store renders [`Predicate`] into SQL. Relation assertions carry a DN
//! that is only turned into an entry id right before execution; those
//! parameters sit in [`CompiledQuery::pending`] until resolved.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::schema::{AttributeType, MatchKind, CREATE_TIMESTAMP, ENTRY_UUID, HAS_SUBORDINATES, MODIFY_TIMESTAMP};
use crate::{AssociationPolicy, DirError, DirResult, EntryId, Filter, SchemaCatalog, Timestamp};

pub const DEFAULT_MAX_FILTER_DEPTH: usize = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompareOp {
    Eq,
    Gte,
    Lte,
    /// SQL `LIKE` with `\` as the escape character.
    Like,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Gte => ">=",
            CompareOp::Lte => "<=",
            CompareOp::Like => "LIKE",
        }
    }
}

/// Attributes kept in dedicated entry columns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Column {
    EntryUuid,
    CreatedAt,
    UpdatedAt,
}

/// Which side of an association edge the candidate entry is on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Candidate is the owner: `(name, candidate, target)`.
    Owner,
    /// Candidate is the member: `(name, target, candidate)`.
    Member,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ParamKey(pub usize);

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BoundValue {
    Text(String),
    Id(EntryId),
    Time(Timestamp),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Predicate {
    Const(bool),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// Comparison against the attribute value index. `attr` is the lowercased key.
    Attr {
        attr: String,
        op: CompareOp,
        param: ParamKey,
    },
    Present {
        attr: String,
    },
    Column {
        column: Column,
        op: CompareOp,
        param: ParamKey,
    },
    /// Edge existence; without a parameter any edge of the relation matches.
    Association {
        relation: String,
        direction: Direction,
        param: Option<ParamKey>,
    },
    HasChildren,
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Const(true) => f.write_str("TRUE"),
            Predicate::Const(false) => f.write_str("FALSE"),
            Predicate::And(children) => write_joined(f, children, "AND"),
            Predicate::Or(children) => write_joined(f, children, "OR"),
            Predicate::Not(inner) => write!(f, "(NOT {inner})"),
            Predicate::Attr { attr, op, param } => {
                write!(f, "{attr} {} :{param}", op.symbol())
            }
            Predicate::Present { attr } => write!(f, "{attr} PRESENT"),
            Predicate::Column { column, op, param } => {
                write!(f, "{column:?} {} :{param}", op.symbol())
            }
            Predicate::Association {
                relation,
                direction,
                param,
            } => match param {
                Some(param) => write!(f, "{relation}[{direction:?}] = :{param}"),
                None => write!(f, "{relation}[{direction:?}] PRESENT"),
            },
            Predicate::HasChildren => f.write_str("HAS CHILDREN"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, children: &[Predicate], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            write!(f, " {sep} ")?;
        }
        write!(f, "{child}")?;
    }
    f.write_str(")")
}

#[derive(Clone, Debug)]
pub struct CompileOptions {
    pub policy: AssociationPolicy,
    pub max_depth: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            policy: AssociationPolicy::default(),
            max_depth: DEFAULT_MAX_FILTER_DEPTH,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompiledQuery {
    pub predicate: Predicate,
    pub params: BTreeMap<ParamKey, BoundValue>,
    /// Parameter → normalized DN awaiting an entry id.
    pub pending: BTreeMap<ParamKey, String>,
    /// Pending parameters whose DN did not name an entry.
    pub unresolved: BTreeSet<ParamKey>,
}

impl CompiledQuery {
    /// Binds a pending parameter. `None` marks its branch non-matching.
    pub fn resolve(&mut self, key: ParamKey, id: Option<EntryId>) {
        self.pending.remove(&key);
        match id {
            Some(id) => {
                self.params.insert(key, BoundValue::Id(id));
            }
            None => {
                log::warn!("filter DN parameter {key} does not name an entry");
                self.unresolved.insert(key);
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.pending.is_empty()
    }
}

pub fn compile(
    catalog: &SchemaCatalog,
    filter: &Filter,
    options: &CompileOptions,
) -> DirResult<CompiledQuery> {
    if filter.depth() > options.max_depth {
        return Err(DirError::invalid_filter(format!(
            "filter nesting exceeds {} levels",
            options.max_depth
        )));
    }
    let mut compiler = Compiler {
        catalog,
        policy: options.policy,
        params: BTreeMap::new(),
        pending: BTreeMap::new(),
    };
    let predicate = compiler.node(filter);
    Ok(CompiledQuery {
        predicate,
        params: compiler.params,
        pending: compiler.pending,
        unresolved: BTreeSet::new(),
    })
}

struct Compiler<'a> {
    catalog: &'a SchemaCatalog,
    policy: AssociationPolicy,
    params: BTreeMap<ParamKey, BoundValue>,
    pending: BTreeMap<ParamKey, String>,
}

enum Assertion {
    Equal,
    Greater,
    Less,
}

impl Compiler<'_> {
    fn next_key(&self) -> ParamKey {
        ParamKey(self.params.len() + self.pending.len())
    }

    fn bind(&mut self, value: BoundValue) -> ParamKey {
        let key = self.next_key();
        self.params.insert(key, value);
        key
    }

    fn defer(&mut self, dn: String) -> ParamKey {
        let key = self.next_key();
        self.pending.insert(key, dn);
        key
    }

    fn node(&mut self, filter: &Filter) -> Predicate {
        match filter {
            Filter::And(children) if children.is_empty() => Predicate::Const(true),
            Filter::Or(children) if children.is_empty() => Predicate::Const(false),
            Filter::And(children) => {
                Predicate::And(children.iter().map(|child| self.node(child)).collect())
            }
            Filter::Or(children) => {
                Predicate::Or(children.iter().map(|child| self.node(child)).collect())
            }
            Filter::Not(inner) => Predicate::Not(Box::new(self.node(inner))),
            Filter::Equality { attr, value } | Filter::Approx { attr, value } => {
                self.assertion(attr, value, Assertion::Equal)
            }
            Filter::GreaterOrEqual { attr, value } => {
                self.assertion(attr, value, Assertion::Greater)
            }
            Filter::LessOrEqual { attr, value } => self.assertion(attr, value, Assertion::Less),
            Filter::Present { attr } => self.present(attr),
            Filter::Substrings {
                attr,
                initial,
                any,
                last,
            } => self.substrings(attr, initial.as_deref(), any, last.as_deref()),
        }
    }

    fn lookup(&self, name: &str) -> Option<std::sync::Arc<AttributeType>> {
        let attr = self.catalog.resolve(name);
        if attr.is_none() {
            log::warn!("ignoring filter on undefined attribute '{name}'");
        }
        attr
    }

    fn association(&self, attr: &AttributeType) -> (String, Direction) {
        let relation = self.catalog.relation();
        let reverse = attr.name == relation.reverse;
        match self.policy {
            AssociationPolicy::OneWay if reverse => (relation.primary.clone(), Direction::Member),
            _ => (attr.name.clone(), Direction::Owner),
        }
    }

    fn column(attr: &AttributeType) -> Option<Column> {
        if attr.is(ENTRY_UUID) {
            Some(Column::EntryUuid)
        } else if attr.is(CREATE_TIMESTAMP) {
            Some(Column::CreatedAt)
        } else if attr.is(MODIFY_TIMESTAMP) {
            Some(Column::UpdatedAt)
        } else {
            None
        }
    }

    fn assertion(&mut self, name: &str, value: &str, kind: Assertion) -> Predicate {
        let Some(attr) = self.lookup(name) else {
            return Predicate::Const(false);
        };
        let op = match kind {
            Assertion::Equal => CompareOp::Eq,
            Assertion::Greater => CompareOp::Gte,
            Assertion::Less => CompareOp::Lte,
        };

        if attr.relation {
            if op != CompareOp::Eq {
                log::warn!("ordering match on '{}' is not supported", attr.name);
                return Predicate::Const(false);
            }
            let Ok(norm) = self.catalog.normalize(&attr, value) else {
                log::warn!("ignoring filter on '{}' with invalid DN '{value}'", attr.name);
                return Predicate::Const(false);
            };
            let (relation, direction) = self.association(&attr);
            let param = self.defer(norm);
            return Predicate::Association {
                relation,
                direction,
                param: Some(param),
            };
        }

        if attr.is(HAS_SUBORDINATES) {
            return match (op, self.catalog.normalize(&attr, value).as_deref()) {
                (CompareOp::Eq, Ok("TRUE")) => Predicate::HasChildren,
                (CompareOp::Eq, Ok("FALSE")) => Predicate::Not(Box::new(Predicate::HasChildren)),
                _ => Predicate::Const(false),
            };
        }

        if let Some(column) = Self::column(&attr) {
            let bound = match column {
                Column::EntryUuid => self
                    .catalog
                    .normalize(&attr, value)
                    .ok()
                    .map(BoundValue::Text),
                Column::CreatedAt | Column::UpdatedAt => {
                    Timestamp::parse_generalized(value).map(BoundValue::Time)
                }
            };
            let Some(bound) = bound else {
                log::warn!("ignoring filter on '{}' with invalid value '{value}'", attr.name);
                return Predicate::Const(false);
            };
            let param = self.bind(bound);
            return Predicate::Column { column, op, param };
        }

        let Ok(norm) = self.catalog.normalize(&attr, value) else {
            log::warn!("ignoring filter on '{}' with invalid value '{value}'", attr.name);
            return Predicate::Const(false);
        };
        let param = self.bind(BoundValue::Text(attr.index_value(&norm)));
        Predicate::Attr {
            attr: attr.key(),
            op,
            param,
        }
    }

    fn present(&mut self, name: &str) -> Predicate {
        let Some(attr) = self.lookup(name) else {
            return Predicate::Const(false);
        };
        if attr.relation {
            let (relation, direction) = self.association(&attr);
            return Predicate::Association {
                relation,
                direction,
                param: None,
            };
        }
        if attr.is(HAS_SUBORDINATES) || Self::column(&attr).is_some() {
            return Predicate::Const(true);
        }
        Predicate::Present { attr: attr.key() }
    }

    fn substrings(
        &mut self,
        name: &str,
        initial: Option<&str>,
        any: &[String],
        last: Option<&str>,
    ) -> Predicate {
        let Some(attr) = self.lookup(name) else {
            return Predicate::Const(false);
        };
        if !attr.is_document_attribute() {
            log::warn!("substring match on '{}' is not supported", attr.name);
            return Predicate::Const(false);
        }
        if !matches!(attr.match_kind, MatchKind::CaseIgnore | MatchKind::CaseExact) {
            log::warn!("substring match on '{}' is not supported", attr.name);
            return Predicate::Const(false);
        }
        // Spaces at a part boundary are significant; runs of them fold to one.
        let normalize = |part: &str| -> Option<String> {
            let norm = self.catalog.normalize(&attr, part).ok()?;
            let lead = part.starts_with(char::is_whitespace);
            let trail = part.ends_with(char::is_whitespace);
            if norm.is_empty() {
                return Some(if lead { " ".to_string() } else { String::new() });
            }
            let mut out = String::with_capacity(norm.len() + 2);
            if lead {
                out.push(' ');
            }
            out.push_str(&escape_like(&norm));
            if trail {
                out.push(' ');
            }
            Some(out)
        };
        let mut pattern = String::new();
        if let Some(initial) = initial {
            let Some(part) = normalize(initial) else {
                return Predicate::Const(false);
            };
            pattern.push_str(&part);
        }
        pattern.push('%');
        for part in any {
            let Some(part) = normalize(part) else {
                return Predicate::Const(false);
            };
            pattern.push_str(&part);
            pattern.push('%');
        }
        if let Some(last) = last {
            let Some(part) = normalize(last) else {
                return Predicate::Const(false);
            };
            pattern.push_str(&part);
        }
        let param = self.bind(BoundValue::Text(pattern));
        Predicate::Attr {
            attr: attr.key(),
            op: CompareOp::Like,
            param,
        }
    }
}

/// Escapes `LIKE` wildcards so assertion text matches literally.
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::builtin().expect("catalog")
    }

    fn compile_str(catalog: &SchemaCatalog, raw: &str) -> CompiledQuery {
        let filter = Filter::parse(raw).expect("filter");
        compile(catalog, &filter, &CompileOptions::default()).expect("compile")
    }

    fn text(value: &str) -> BoundValue {
        BoundValue::Text(value.to_string())
    }

    #[test]
    fn conjunction_binds_parameters_in_order() {
        let catalog = catalog();
        let compiled = compile_str(&catalog, "(&(cn=Foo)(uid=BAR))");
        assert_eq!(
            compiled.predicate,
            Predicate::And(vec![
                Predicate::Attr {
                    attr: "cn".into(),
                    op: CompareOp::Eq,
                    param: ParamKey(0),
                },
                Predicate::Attr {
                    attr: "uid".into(),
                    op: CompareOp::Eq,
                    param: ParamKey(1),
                },
            ])
        );
        assert_eq!(compiled.params.get(&ParamKey(0)), Some(&text("foo")));
        assert_eq!(compiled.params.get(&ParamKey(1)), Some(&text("bar")));
        assert_eq!(
            compiled.predicate.to_string(),
            "(cn = :p0 AND uid = :p1)"
        );
        assert!(compiled.is_resolved());
    }

    #[test]
    fn substring_patterns_escape_wildcards() {
        let catalog = catalog();
        let compiled = compile_str(&catalog, "(cn=A_b*50%*Z)");
        assert!(matches!(
            compiled.predicate,
            Predicate::Attr {
                op: CompareOp::Like,
                ..
            }
        ));
        assert_eq!(
            compiled.params.get(&ParamKey(0)),
            Some(&text("a\\_b%50\\%%z"))
        );
        let compiled = compile_str(&catalog, "(description=*it's \\28a\\29 test.*)");
        assert_eq!(
            compiled.params.get(&ParamKey(0)),
            Some(&text("%it's (a) test.%"))
        );
    }

    #[test]
    fn substring_parts_keep_boundary_spaces() {
        let catalog = catalog();
        let compiled = compile_str(&catalog, "(cn=Alice *)");
        assert_eq!(compiled.params.get(&ParamKey(0)), Some(&text("alice %")));
        let compiled = compile_str(&catalog, "(cn=*  Lid   dell*x)");
        assert_eq!(compiled.params.get(&ParamKey(0)), Some(&text("% lid dell%x")));
        let compiled = compile_str(&catalog, "(cn=a* *b)");
        assert_eq!(compiled.params.get(&ParamKey(0)), Some(&text("a% %b")));
    }

    #[test]
    fn integer_assertions_bind_sortable_keys() {
        let catalog = catalog();
        let compiled = compile_str(&catalog, "(uidNumber>= 01000)");
        let Some(BoundValue::Text(thousand)) = compiled.params.get(&ParamKey(0)).cloned() else {
            panic!("expected a text parameter");
        };
        let nine_nine_nine = compile_str(&catalog, "(uidNumber=999)");
        let Some(BoundValue::Text(smaller)) = nine_nine_nine.params.get(&ParamKey(0)).cloned()
        else {
            panic!("expected a text parameter");
        };
        assert!(smaller < thousand);
        let negative = compile_str(&catalog, "(uidNumber=-5)");
        let Some(BoundValue::Text(negative)) = negative.params.get(&ParamKey(0)).cloned() else {
            panic!("expected a text parameter");
        };
        assert!(negative < smaller);

        assert_eq!(
            compile_str(&catalog, "(uidNumber=abc)").predicate,
            Predicate::Const(false)
        );
        assert_eq!(
            compile_str(&catalog, "(uidNumber=10*)").predicate,
            Predicate::Const(false)
        );
    }

    #[test]
    fn relation_values_become_pending_parameters() {
        let catalog = catalog();
        let mut compiled = compile_str(
            &catalog,
            "(&(objectClass=groupOfNames)(member=CN=Alice,DC=Example))",
        );
        assert_eq!(
            compiled.pending.get(&ParamKey(1)).map(String::as_str),
            Some("cn=alice,dc=example")
        );
        assert!(!compiled.is_resolved());
        compiled.resolve(ParamKey(1), Some(EntryId(42)));
        assert!(compiled.is_resolved());
        assert_eq!(
            compiled.params.get(&ParamKey(1)),
            Some(&BoundValue::Id(EntryId(42)))
        );

        let mut missing = compile_str(&catalog, "(member=cn=ghost,dc=example)");
        missing.resolve(ParamKey(0), None);
        assert!(missing.unresolved.contains(&ParamKey(0)));
    }

    #[test]
    fn one_way_policy_reverses_member_of() {
        let catalog = catalog();
        let filter = Filter::parse("(memberOf=cn=admins,dc=example)").expect("filter");
        let options = CompileOptions {
            policy: AssociationPolicy::OneWay,
            ..CompileOptions::default()
        };
        let compiled = compile(&catalog, &filter, &options).expect("compile");
        assert_eq!(
            compiled.predicate,
            Predicate::Association {
                relation: "member".into(),
                direction: Direction::Member,
                param: Some(ParamKey(0)),
            }
        );
        let two_way = compile_str(&catalog, "(memberOf=cn=admins,dc=example)");
        assert_eq!(
            two_way.predicate,
            Predicate::Association {
                relation: "memberOf".into(),
                direction: Direction::Owner,
                param: Some(ParamKey(0)),
            }
        );
    }

    #[test]
    fn unknown_attributes_never_match() {
        let catalog = catalog();
        let compiled = compile_str(&catalog, "(|(bogus=1)(cn=x))");
        assert_eq!(
            compiled.predicate,
            Predicate::Or(vec![
                Predicate::Const(false),
                Predicate::Attr {
                    attr: "cn".into(),
                    op: CompareOp::Eq,
                    param: ParamKey(0),
                },
            ])
        );
        let bad_dn = compile_str(&catalog, "(member=not a dn)");
        assert_eq!(bad_dn.predicate, Predicate::Const(false));
    }

    #[test]
    fn operational_attributes_use_columns_and_containers() {
        let catalog = catalog();
        let compiled = compile_str(&catalog, "(createTimestamp>=20240101000000Z)");
        assert!(matches!(
            compiled.predicate,
            Predicate::Column {
                column: Column::CreatedAt,
                op: CompareOp::Gte,
                ..
            }
        ));
        assert!(matches!(
            compiled.params.get(&ParamKey(0)),
            Some(BoundValue::Time(_))
        ));
        assert_eq!(
            compile_str(&catalog, "(hasSubordinates=TRUE)").predicate,
            Predicate::HasChildren
        );
        assert_eq!(
            compile_str(&catalog, "(entryUUID=*)").predicate,
            Predicate::Const(true)
        );
        assert_eq!(
            compile_str(&catalog, "(modifyTimestamp>=yesterday)").predicate,
            Predicate::Const(false)
        );
    }

    #[test]
    fn rejects_deep_filters() {
        let catalog = catalog();
        let mut filter = Filter::equality("cn", "x");
        for _ in 0..40 {
            filter = Filter::Not(Box::new(filter));
        }
        let err = compile(&catalog, &filter, &CompileOptions::default()).expect_err("too deep");
        assert!(matches!(err, DirError::InvalidFilter { .. }));
    }
}
