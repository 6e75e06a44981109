use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use unicode_normalization::UnicodeNormalization;

use crate::schema_def::{
    AttributeTypeDef, AttributeUsage, BUILTIN_SCHEMA, ObjectClassDef, ObjectClassKind,
    SchemaDefinitions,
};
use crate::{DirError, DirResult, Dn};

pub const OBJECT_CLASS: &str = "objectClass";
pub const EXTENSIBLE_OBJECT: &str = "extensibleObject";
pub const ENTRY_UUID: &str = "entryUUID";
pub const CREATE_TIMESTAMP: &str = "createTimestamp";
pub const MODIFY_TIMESTAMP: &str = "modifyTimestamp";
pub const HAS_SUBORDINATES: &str = "hasSubordinates";
pub const USER_PASSWORD: &str = "userPassword";

/// Longest indexed prefix of a value, in characters.
pub const MAX_INDEXED_VALUE: usize = 1024;

const DEFAULT_INDEPENDENT_COLUMNS: [&str; 3] = [ENTRY_UUID, CREATE_TIMESTAMP, MODIFY_TIMESTAMP];
const DEFAULT_RELATION: (&str, &str) = ("member", "memberOf");

/// How values of an attribute are compared and therefore normalized.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MatchKind {
    CaseIgnore,
    CaseExact,
    DistinguishedName,
    Boolean,
    Integer,
    Octet,
}

impl MatchKind {
    fn from_rule(rule: Option<&str>) -> Self {
        match rule.map(str::to_ascii_lowercase).as_deref() {
            Some(
                "caseignorematch"
                | "caseignoreia5match"
                | "caseignorelistmatch"
                | "objectidentifiermatch"
                | "telephonenumbermatch"
                | "uuidmatch",
            ) => MatchKind::CaseIgnore,
            Some("distinguishednamematch" | "uniquemembermatch") => MatchKind::DistinguishedName,
            Some("booleanmatch") => MatchKind::Boolean,
            Some("integermatch" | "integerorderingmatch") => MatchKind::Integer,
            Some("octetstringmatch") => MatchKind::Octet,
            _ => MatchKind::CaseExact,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AttributeType {
    pub oid: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub superior: Option<String>,
    pub equality: Option<String>,
    pub ordering: Option<String>,
    pub substr: Option<String>,
    pub syntax: Option<String>,
    pub single_value: bool,
    pub no_user_modification: bool,
    pub usage: AttributeUsage,
    pub independent_column: bool,
    pub relation: bool,
    pub match_kind: MatchKind,
}

impl AttributeType {
    /// Lowercased canonical name, used as the document and index key.
    pub fn key(&self) -> String {
        self.name.to_ascii_lowercase()
    }

    pub fn is_operational(&self) -> bool {
        self.usage != AttributeUsage::UserApplications
    }

    pub fn is(&self, name: &str) -> bool {
        self.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(name))
            || self.oid == name
    }

    /// Values live in the generic attribute document rather than in a
    /// dedicated column or the association table.
    pub fn is_document_attribute(&self) -> bool {
        !self.independent_column && !self.relation && !self.is(HAS_SUBORDINATES)
    }

    /// Form of a normalized value kept in the filter index. Integers use
    /// their sortable encoding and long values keep only a prefix.
    pub fn index_value(&self, norm: &str) -> String {
        if self.match_kind == MatchKind::Integer
            && let Some(key) = sortable_integer(norm)
        {
            return key;
        }
        index_prefix(norm)
    }
}

/// The first [`MAX_INDEXED_VALUE`] characters of `norm`.
pub fn index_prefix(norm: &str) -> String {
    match norm.char_indices().nth(MAX_INDEXED_VALUE) {
        Some((end, _)) => norm[..end].to_string(),
        None => norm.to_string(),
    }
}

#[derive(Clone, Debug)]
pub struct ObjectClass {
    pub oid: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub superiors: Vec<String>,
    pub kind: ObjectClassKind,
    pub must: Vec<String>,
    pub may: Vec<String>,
}

/// Canonical names of the attribute pair maintained as association edges.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelationPair {
    pub primary: String,
    pub reverse: String,
}

#[derive(Debug)]
pub struct SchemaCatalog {
    attributes: HashMap<String, Arc<AttributeType>>,
    object_classes: HashMap<String, Arc<ObjectClass>>,
    relation: RelationPair,
}

pub struct SchemaBuilder {
    definitions: Vec<String>,
    include_builtin: bool,
    independent_columns: Vec<String>,
    relation: (String, String),
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self {
            definitions: Vec::new(),
            include_builtin: true,
            independent_columns: DEFAULT_INDEPENDENT_COLUMNS
                .iter()
                .map(|name| name.to_string())
                .collect(),
            relation: (
                DEFAULT_RELATION.0.to_string(),
                DEFAULT_RELATION.1.to_string(),
            ),
        }
    }
}

impl SchemaBuilder {
    pub fn without_builtin(mut self) -> Self {
        self.include_builtin = false;
        self
    }

    pub fn definitions(mut self, text: impl Into<String>) -> Self {
        self.definitions.push(text.into());
        self
    }

    pub fn independent_columns<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.independent_columns = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn relation(mut self, primary: impl Into<String>, reverse: impl Into<String>) -> Self {
        self.relation = (primary.into(), reverse.into());
        self
    }

    pub fn build(self) -> DirResult<SchemaCatalog> {
        let mut defs = if self.include_builtin {
            SchemaDefinitions::parse(BUILTIN_SCHEMA)?
        } else {
            SchemaDefinitions::default()
        };
        for text in &self.definitions {
            defs.extend(SchemaDefinitions::parse(text)?);
        }

        let by_name = index_attribute_defs(&defs.attribute_types)?;
        let mut attributes = HashMap::new();
        for def in &defs.attribute_types {
            let resolved = Arc::new(resolve_attribute(def, &by_name)?);
            for alias in &resolved.aliases {
                attributes.insert(alias.to_ascii_lowercase(), resolved.clone());
            }
            attributes.insert(resolved.oid.clone(), resolved);
        }

        let mut catalog = SchemaCatalog {
            attributes,
            object_classes: HashMap::new(),
            relation: RelationPair {
                primary: String::new(),
                reverse: String::new(),
            },
        };
        catalog.mark_independent(&self.independent_columns)?;
        catalog.relation = catalog.mark_relation(&self.relation.0, &self.relation.1)?;

        for def in &defs.object_classes {
            let class = Arc::new(catalog.resolve_object_class(def)?);
            for alias in &class.aliases {
                catalog
                    .object_classes
                    .insert(alias.to_ascii_lowercase(), class.clone());
            }
            catalog.object_classes.insert(class.oid.clone(), class);
        }
        catalog.check_class_superiors()?;
        Ok(catalog)
    }
}

fn index_attribute_defs(defs: &[AttributeTypeDef]) -> DirResult<HashMap<String, &AttributeTypeDef>> {
    let mut by_name = HashMap::new();
    for def in defs {
        let keys = def
            .names
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .chain(std::iter::once(def.oid.clone()));
        for key in keys {
            if by_name.insert(key.clone(), def).is_some() {
                return Err(DirError::schema(format!(
                    "attribute type '{key}' defined twice"
                )));
            }
        }
    }
    Ok(by_name)
}

/// Walks the `SUP` chain filling unset matching rules and syntax.
fn resolve_attribute(
    def: &AttributeTypeDef,
    by_name: &HashMap<String, &AttributeTypeDef>,
) -> DirResult<AttributeType> {
    let mut equality = def.equality.clone();
    let mut ordering = def.ordering.clone();
    let mut substr = def.substr.clone();
    let mut syntax = def.syntax.clone();
    let mut seen = HashSet::from([def.oid.clone()]);
    let mut current = def.superior.clone();
    while let Some(sup) = current {
        let parent = by_name.get(&sup.to_ascii_lowercase()).ok_or_else(|| {
            DirError::schema(format!(
                "attribute type '{}' has undefined superior '{sup}'",
                def.names[0]
            ))
        })?;
        if !seen.insert(parent.oid.clone()) {
            return Err(DirError::schema(format!(
                "attribute type '{}' has a cyclic superior chain",
                def.names[0]
            )));
        }
        equality = equality.or_else(|| parent.equality.clone());
        ordering = ordering.or_else(|| parent.ordering.clone());
        substr = substr.or_else(|| parent.substr.clone());
        syntax = syntax.or_else(|| parent.syntax.clone());
        current = parent.superior.clone();
    }
    let match_kind = MatchKind::from_rule(equality.as_deref());
    Ok(AttributeType {
        oid: def.oid.clone(),
        name: def.names[0].clone(),
        aliases: def.names.clone(),
        description: def.description.clone(),
        superior: def.superior.clone(),
        equality,
        ordering,
        substr,
        syntax,
        single_value: def.single_value,
        no_user_modification: def.no_user_modification,
        usage: def.usage,
        independent_column: false,
        relation: false,
        match_kind,
    })
}

impl SchemaCatalog {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Built-in schema with the default independent columns and relation pair.
    pub fn builtin() -> DirResult<Self> {
        Self::builder().build()
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<AttributeType>> {
        self.attributes
            .get(&name.trim().to_ascii_lowercase())
            .cloned()
    }

    pub fn require(&self, name: &str) -> DirResult<Arc<AttributeType>> {
        self.resolve(name)
            .ok_or_else(|| DirError::undefined_type(name.trim()))
    }

    pub fn object_class(&self, name: &str) -> Option<Arc<ObjectClass>> {
        self.object_classes
            .get(&name.trim().to_ascii_lowercase())
            .cloned()
    }

    pub fn relation(&self) -> &RelationPair {
        &self.relation
    }

    pub fn attribute_types(&self) -> impl Iterator<Item = &Arc<AttributeType>> {
        self.attributes
            .iter()
            .filter(|(key, attr)| **key == attr.oid)
            .map(|(_, attr)| attr)
    }

    /// Normalizes an assertion or stored value per the attribute's equality rule.
    pub fn normalize(&self, attr: &AttributeType, value: &str) -> DirResult<String> {
        match attr.match_kind {
            MatchKind::Octet => Ok(value.to_string()),
            MatchKind::DistinguishedName => Dn::parse(self, value)
                .map(|dn| dn.norm_string())
                .map_err(|_| DirError::InvalidPerSyntax {
                    attribute: attr.name.clone(),
                    index: 0,
                }),
            MatchKind::Boolean => {
                let folded = normalize_text(value, false).to_ascii_uppercase();
                match folded.as_str() {
                    "TRUE" | "FALSE" => Ok(folded),
                    _ => Err(DirError::InvalidPerSyntax {
                        attribute: attr.name.clone(),
                        index: 0,
                    }),
                }
            }
            MatchKind::Integer => normalize_text(value, false)
                .parse::<i64>()
                .map(|number| number.to_string())
                .map_err(|_| DirError::InvalidPerSyntax {
                    attribute: attr.name.clone(),
                    index: 0,
                }),
            MatchKind::CaseIgnore => Ok(normalize_text(value, true)),
            MatchKind::CaseExact => Ok(normalize_text(value, false)),
        }
    }

    /// The class and all of its superiors, nearest first.
    pub fn class_chain(&self, name: &str) -> Vec<Arc<ObjectClass>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            let Some(class) = self.object_class(&current) else {
                continue;
            };
            if !seen.insert(class.oid.clone()) {
                continue;
            }
            pending.extend(class.superiors.iter().rev().cloned());
            chain.push(class);
        }
        chain
    }

    /// Enforces object class rules on a complete attribute set.
    ///
    /// `present` holds the lowercased keys of every attribute with at least one
    /// value; `object_classes` the raw `objectClass` values.
    pub fn check_object_classes(
        &self,
        object_classes: &[String],
        present: &BTreeSet<String>,
    ) -> DirResult<()> {
        if object_classes.is_empty() {
            return Err(DirError::object_class("no objectClass attribute"));
        }
        let mut classes = Vec::new();
        for value in object_classes {
            let class = self
                .object_class(value)
                .ok_or_else(|| DirError::object_class(format!("unknown object class '{value}'")))?;
            classes.push(class);
        }

        let structural: Vec<&Arc<ObjectClass>> = classes
            .iter()
            .filter(|class| class.kind == ObjectClassKind::Structural)
            .collect();
        if structural.is_empty() {
            return Err(DirError::object_class("no structural object class"));
        }
        // All structural classes must sit on the chain of the most specific one.
        let chains: Vec<Vec<String>> = structural
            .iter()
            .map(|class| {
                self.class_chain(&class.name)
                    .iter()
                    .map(|c| c.oid.clone())
                    .collect()
            })
            .collect();
        let deepest = chains
            .iter()
            .max_by_key(|chain| chain.len())
            .cloned()
            .unwrap_or_default();
        for class in &structural {
            if !deepest.contains(&class.oid) {
                return Err(DirError::object_class(format!(
                    "structural object class '{}' is not on a single superclass chain",
                    class.name
                )));
            }
        }

        let mut must = BTreeSet::new();
        let mut allowed = BTreeSet::new();
        let mut extensible = false;
        for class in &classes {
            for member in self.class_chain(&class.name) {
                if member.name.eq_ignore_ascii_case(EXTENSIBLE_OBJECT) {
                    extensible = true;
                }
                for name in &member.must {
                    must.insert(name.to_ascii_lowercase());
                    allowed.insert(name.to_ascii_lowercase());
                }
                for name in &member.may {
                    allowed.insert(name.to_ascii_lowercase());
                }
            }
        }
        if let Some(missing) = must.iter().find(|name| !present.contains(*name)) {
            return Err(DirError::object_class(format!(
                "missing required attribute '{missing}'"
            )));
        }
        if extensible {
            return Ok(());
        }
        for key in present {
            let operational = self
                .resolve(key)
                .map(|attr| attr.is_operational())
                .unwrap_or(false);
            if !operational && !allowed.contains(key) {
                return Err(DirError::object_class(format!(
                    "attribute '{key}' not allowed"
                )));
            }
        }
        Ok(())
    }

    fn mark_independent(&mut self, names: &[String]) -> DirResult<()> {
        for name in names {
            let mut attr = self.require(name)?.as_ref().clone();
            attr.independent_column = true;
            self.replace_attribute(attr);
        }
        Ok(())
    }

    fn mark_relation(&mut self, primary: &str, reverse: &str) -> DirResult<RelationPair> {
        let mut pair = Vec::new();
        for name in [primary, reverse] {
            let mut attr = self.require(name)?.as_ref().clone();
            if attr.match_kind != MatchKind::DistinguishedName {
                return Err(DirError::schema(format!(
                    "relation attribute '{name}' must use distinguishedNameMatch"
                )));
            }
            attr.relation = true;
            pair.push(attr.name.clone());
            self.replace_attribute(attr);
        }
        Ok(RelationPair {
            primary: pair[0].clone(),
            reverse: pair[1].clone(),
        })
    }

    fn replace_attribute(&mut self, attr: AttributeType) {
        let attr = Arc::new(attr);
        for alias in &attr.aliases {
            self.attributes
                .insert(alias.to_ascii_lowercase(), attr.clone());
        }
        self.attributes.insert(attr.oid.clone(), attr);
    }

    fn resolve_object_class(&self, def: &ObjectClassDef) -> DirResult<ObjectClass> {
        let canonical = |names: &[String]| -> DirResult<Vec<String>> {
            names
                .iter()
                .map(|name| {
                    self.resolve(name).map(|attr| attr.name.clone()).ok_or_else(|| {
                        DirError::schema(format!(
                            "object class '{}' references undefined attribute '{name}'",
                            def.names[0]
                        ))
                    })
                })
                .collect()
        };
        Ok(ObjectClass {
            oid: def.oid.clone(),
            name: def.names[0].clone(),
            aliases: def.names.clone(),
            description: def.description.clone(),
            superiors: def.superiors.clone(),
            kind: def.kind,
            must: canonical(&def.must)?,
            may: canonical(&def.may)?,
        })
    }

    fn check_class_superiors(&self) -> DirResult<()> {
        for class in self.object_classes.values() {
            for sup in &class.superiors {
                if self.object_class(sup).is_none() {
                    return Err(DirError::schema(format!(
                        "object class '{}' has undefined superior '{sup}'",
                        class.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Index form of a normalized integer: the sign bit flipped and zero padded
/// to 20 digits, so text order is numeric order.
pub fn sortable_integer(norm: &str) -> Option<String> {
    let number = norm.parse::<i64>().ok()?;
    Some(format!("{:020}", (number as u64) ^ (1 << 63)))
}

/// Trim, NFC, collapse whitespace runs, optionally case fold.
pub fn normalize_text(value: &str, fold_case: bool) -> String {
    let composed = value.trim().nfc().collect::<String>();
    let collapsed = composed.split_whitespace().collect::<Vec<_>>().join(" ");
    if fold_case {
        collapsed.to_lowercase()
    } else {
        collapsed
    }
}
