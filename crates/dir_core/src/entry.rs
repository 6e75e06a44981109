use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::schema::{
    AttributeType, CREATE_TIMESTAMP, ENTRY_UUID, HAS_SUBORDINATES, MODIFY_TIMESTAMP, OBJECT_CLASS,
};
use crate::{DirError, DirResult, Dn, EntryId, EntryUuid, SchemaCatalog, Timestamp};

/// Materialized attribute value, shaped once by the single-valued flag.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Single(String),
    Multi(Vec<String>),
}

impl AttrValue {
    /// `None` when there is nothing to store.
    pub fn from_values(attr: &AttributeType, mut values: Vec<String>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        if attr.single_value && values.len() == 1 {
            return values.pop().map(AttrValue::Single);
        }
        Some(AttrValue::Multi(values))
    }

    pub fn as_slice(&self) -> &[String] {
        match self {
            AttrValue::Single(value) => std::slice::from_ref(value),
            AttrValue::Multi(values) => values,
        }
    }
}

/// Canonical attribute name → value, as stored in the document columns.
pub type Document = BTreeMap<String, AttrValue>;

/// Normalized values added and removed by a modification, per attribute.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChangeLog {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ChangeLog {
    fn record_added(&mut self, value: &str) {
        if let Some(pos) = self.removed.iter().position(|v| v == value) {
            self.removed.remove(pos);
        } else {
            self.added.push(value.to_string());
        }
    }

    fn record_removed(&mut self, value: &str) {
        if let Some(pos) = self.added.iter().position(|v| v == value) {
            self.added.remove(pos);
        } else {
            self.removed.push(value.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
struct Values {
    orig: Vec<String>,
    norm: Vec<String>,
}

/// Schema-checked attribute storage shared by [`AddEntry`] and [`ModifyEntry`].
#[derive(Clone, Debug)]
struct AttrSet {
    catalog: Arc<SchemaCatalog>,
    values: BTreeMap<String, Values>,
}

impl AttrSet {
    fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self {
            catalog,
            values: BTreeMap::new(),
        }
    }

    fn writable(&self, name: &str) -> DirResult<Arc<AttributeType>> {
        let attr = self.catalog.require(name)?;
        if attr.no_user_modification {
            return Err(DirError::NoUserModificationAllowed {
                name: attr.name.clone(),
            });
        }
        Ok(attr)
    }

    /// Normalizes a request value list, rejecting duplicates within it.
    fn prepare(&self, attr: &AttributeType, values: Vec<String>) -> DirResult<Values> {
        let mut prepared = Values::default();
        for (index, orig) in values.into_iter().enumerate() {
            let norm = self.catalog.normalize(attr, &orig).map_err(|err| match err {
                DirError::InvalidPerSyntax { attribute, .. } => {
                    DirError::InvalidPerSyntax { attribute, index }
                }
                other => other,
            })?;
            if prepared.norm.contains(&norm) {
                return Err(DirError::MoreThanOnce {
                    name: attr.name.clone(),
                    value: orig,
                });
            }
            prepared.orig.push(orig);
            prepared.norm.push(norm);
        }
        Ok(prepared)
    }

    fn current(&self, attr: &AttributeType) -> Option<&Values> {
        self.values.get(&attr.name)
    }

    fn has_norm(&self, attr: &AttributeType, norm: &str) -> bool {
        self.current(attr)
            .map(|values| values.norm.iter().any(|v| v == norm))
            .unwrap_or(false)
    }

    fn push(&mut self, attr: &AttributeType, incoming: Values) -> DirResult<()> {
        let entry = self.values.entry(attr.name.clone()).or_default();
        if attr.single_value && entry.norm.len() + incoming.norm.len() > 1 {
            return Err(DirError::MultipleValuesProvided {
                name: attr.name.clone(),
            });
        }
        entry.orig.extend(incoming.orig);
        entry.norm.extend(incoming.norm);
        Ok(())
    }

    fn remove_norm(&mut self, attr: &AttributeType, norm: &str) -> bool {
        let Some(values) = self.values.get_mut(&attr.name) else {
            return false;
        };
        let Some(pos) = values.norm.iter().position(|v| v == norm) else {
            return false;
        };
        values.norm.remove(pos);
        values.orig.remove(pos);
        if values.norm.is_empty() {
            self.values.remove(&attr.name);
        }
        true
    }

    fn take(&mut self, attr: &AttributeType) -> Option<Values> {
        self.values.remove(&attr.name)
    }

    fn present_keys(&self) -> BTreeSet<String> {
        self.values
            .keys()
            .map(|name| name.to_ascii_lowercase())
            .collect()
    }

    fn object_classes(&self) -> Vec<String> {
        self.values
            .get(OBJECT_CLASS)
            .map(|values| values.orig.clone())
            .unwrap_or_default()
    }

    fn check_schema(&self) -> DirResult<()> {
        let classes = self.object_classes();
        if classes.is_empty() {
            return Err(DirError::object_class("objectClass attribute is required"));
        }
        self.catalog.check_object_classes(&classes, &self.present_keys())
    }

    fn documents(&self) -> (Document, Document) {
        let mut norm = Document::new();
        let mut orig = Document::new();
        for (name, values) in &self.values {
            let Some(attr) = self.catalog.resolve(name) else {
                continue;
            };
            if !attr.is_document_attribute() {
                continue;
            }
            if let Some(value) = AttrValue::from_values(&attr, values.norm.clone()) {
                norm.insert(name.clone(), value);
            }
            if let Some(value) = AttrValue::from_values(&attr, values.orig.clone()) {
                orig.insert(name.clone(), value);
            }
        }
        (norm, orig)
    }

    /// Normalized DN values of relation attributes, in request order.
    fn relations(&self) -> BTreeMap<String, Vec<String>> {
        self.values
            .iter()
            .filter(|(name, _)| {
                self.catalog
                    .resolve(name)
                    .map(|attr| attr.relation)
                    .unwrap_or(false)
            })
            .map(|(name, values)| (name.clone(), values.norm.clone()))
            .collect()
    }

    fn orig_values(&self, name: &str) -> Vec<String> {
        self.catalog
            .resolve(name)
            .and_then(|attr| self.values.get(&attr.name))
            .map(|values| values.orig.clone())
            .unwrap_or_default()
    }
}

fn check_rdn_present(dn: &Dn, attrs: &AttrSet, on_rdn: bool) -> DirResult<()> {
    let Some(rdn) = dn.rdn() else {
        return Ok(());
    };
    for ava in rdn.avas() {
        let attr = attrs.catalog.require(&ava.attr)?;
        if !attrs.has_norm(&attr, &ava.norm_value) {
            return Err(if on_rdn {
                DirError::NotAllowedOnRdn {
                    name: attr.name.clone(),
                }
            } else {
                DirError::NamingViolation {
                    message: format!("RDN value {}={} is not an attribute value", attr.name, ava.orig_value),
                }
            });
        }
    }
    Ok(())
}

/// A new entry assembled from an add request.
#[derive(Clone, Debug)]
pub struct AddEntry {
    dn: Dn,
    attrs: AttrSet,
}

impl AddEntry {
    pub fn new(catalog: Arc<SchemaCatalog>, dn: Dn) -> DirResult<Self> {
        if dn.is_anonymous() {
            return Err(DirError::NamingViolation {
                message: "cannot add an entry with an empty DN".to_string(),
            });
        }
        Ok(Self {
            dn,
            attrs: AttrSet::new(catalog),
        })
    }

    pub fn add<I, S>(&mut self, name: &str, values: I) -> DirResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let attr = self.attrs.writable(name)?;
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(DirError::InvalidPerSyntax {
                attribute: attr.name.clone(),
                index: 0,
            });
        }
        let prepared = self.attrs.prepare(&attr, values)?;
        for (orig, norm) in prepared.orig.iter().zip(&prepared.norm) {
            if self.attrs.has_norm(&attr, norm) {
                return Err(DirError::MoreThanOnce {
                    name: attr.name.clone(),
                    value: orig.clone(),
                });
            }
        }
        self.attrs.push(&attr, prepared)
    }

    /// Object class rules plus presence of the RDN values.
    pub fn validate(&self) -> DirResult<()> {
        self.attrs.check_schema()?;
        check_rdn_present(&self.dn, &self.attrs, false)
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.attrs.catalog
    }

    /// `(normalized, original)` documents without relation or column attributes.
    pub fn documents(&self) -> (Document, Document) {
        self.attrs.documents()
    }

    pub fn relations(&self) -> BTreeMap<String, Vec<String>> {
        self.attrs.relations()
    }

    pub fn values(&self, name: &str) -> Vec<String> {
        self.attrs.orig_values(name)
    }
}

/// A stored entry being modified. Tracks normalized value changes per attribute.
#[derive(Clone, Debug)]
pub struct ModifyEntry {
    dn: Dn,
    attrs: AttrSet,
    changes: BTreeMap<String, ChangeLog>,
}

impl ModifyEntry {
    pub fn from_entry(catalog: Arc<SchemaCatalog>, entry: &Entry) -> Self {
        let mut attrs = AttrSet::new(catalog);
        for (name, orig) in &entry.attrs_orig {
            let norm = entry
                .attrs_norm
                .get(name)
                .map(|value| value.as_slice().to_vec())
                .unwrap_or_default();
            attrs.values.insert(
                name.clone(),
                Values {
                    orig: orig.as_slice().to_vec(),
                    norm,
                },
            );
        }
        for (name, targets) in &entry.relations {
            if targets.is_empty() {
                continue;
            }
            attrs.values.insert(
                name.clone(),
                Values {
                    orig: targets.iter().map(Dn::orig_string).collect(),
                    norm: targets.iter().map(Dn::norm_string).collect(),
                },
            );
        }
        Self {
            dn: entry.dn.clone(),
            attrs,
            changes: BTreeMap::new(),
        }
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.attrs.catalog
    }

    pub fn add<I, S>(&mut self, name: &str, values: I) -> DirResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let attr = self.attrs.writable(name)?;
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(DirError::InvalidPerSyntax {
                attribute: attr.name.clone(),
                index: 0,
            });
        }
        let prepared = self.attrs.prepare(&attr, values)?;
        for (orig, norm) in prepared.orig.iter().zip(&prepared.norm) {
            if self.attrs.has_norm(&attr, norm) {
                return Err(DirError::AttributeOrValueExists {
                    name: attr.name.clone(),
                    value: orig.clone(),
                });
            }
        }
        let added = prepared.norm.clone();
        self.attrs.push(&attr, prepared)?;
        let log = self.changes.entry(attr.name.clone()).or_default();
        for norm in &added {
            log.record_added(norm);
        }
        Ok(())
    }

    /// Without values the whole attribute goes; otherwise exactly the listed values.
    pub fn delete<I, S>(&mut self, name: &str, values: I) -> DirResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let attr = self.attrs.writable(name)?;
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            let removed = self
                .attrs
                .take(&attr)
                .ok_or_else(|| DirError::no_such_attribute(attr.name.clone()))?;
            let log = self.changes.entry(attr.name.clone()).or_default();
            for norm in &removed.norm {
                log.record_removed(norm);
            }
            return Ok(());
        }
        let prepared = self.attrs.prepare(&attr, values)?;
        if let Some(missing) = prepared
            .norm
            .iter()
            .zip(&prepared.orig)
            .find(|(norm, _)| !self.attrs.has_norm(&attr, norm))
        {
            return Err(DirError::no_such_attribute(format!(
                "{}: {}",
                attr.name, missing.1
            )));
        }
        let log = self.changes.entry(attr.name.clone()).or_default();
        for norm in &prepared.norm {
            self.attrs.remove_norm(&attr, norm);
            log.record_removed(norm);
        }
        Ok(())
    }

    /// Replaces all values; an empty list deletes the attribute if present.
    pub fn replace<I, S>(&mut self, name: &str, values: I) -> DirResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let attr = self.attrs.writable(name)?;
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        let prepared = self.attrs.prepare(&attr, values)?;
        if attr.single_value && prepared.norm.len() > 1 {
            return Err(DirError::MultipleValuesProvided {
                name: attr.name.clone(),
            });
        }
        let previous = self.attrs.take(&attr).unwrap_or_default();
        let log = self.changes.entry(attr.name.clone()).or_default();
        for norm in previous.norm.iter().filter(|v| !prepared.norm.contains(v)) {
            log.record_removed(norm);
        }
        for norm in prepared.norm.iter().filter(|v| !previous.norm.contains(v)) {
            log.record_added(norm);
        }
        if !prepared.norm.is_empty() {
            self.attrs.push(&attr, prepared)?;
        }
        Ok(())
    }

    /// Moves the entry to `new_dn`, adding the new RDN values and, unless
    /// `keep_old_rdn`, dropping the old ones.
    pub fn rename_to(&mut self, new_dn: Dn, keep_old_rdn: bool) -> DirResult<()> {
        let catalog = self.attrs.catalog.clone();
        let old_rdn = self.dn.rdn().cloned();
        let new_rdn = new_dn
            .rdn()
            .cloned()
            .ok_or_else(|| DirError::unwilling("new DN is empty"))?;
        if !keep_old_rdn && let Some(old_rdn) = old_rdn {
            for ava in old_rdn.avas() {
                let still_named = new_rdn
                    .avas()
                    .iter()
                    .any(|new| new.attr == ava.attr && new.norm_value == ava.norm_value);
                if still_named {
                    continue;
                }
                let attr = catalog.require(&ava.attr)?;
                if self.attrs.remove_norm(&attr, &ava.norm_value) {
                    self.changes
                        .entry(attr.name.clone())
                        .or_default()
                        .record_removed(&ava.norm_value);
                }
            }
        }
        for ava in new_rdn.avas() {
            let attr = catalog.require(&ava.attr)?;
            if self.attrs.has_norm(&attr, &ava.norm_value) {
                continue;
            }
            self.attrs.push(
                &attr,
                Values {
                    orig: vec![ava.orig_value.clone()],
                    norm: vec![ava.norm_value.clone()],
                },
            )?;
            self.changes
                .entry(attr.name.clone())
                .or_default()
                .record_added(&ava.norm_value);
        }
        self.dn = new_dn;
        Ok(())
    }

    /// RDN values must survive and object class rules must still hold.
    pub fn validate(&self) -> DirResult<()> {
        check_rdn_present(&self.dn, &self.attrs, true)?;
        self.attrs.check_schema()
    }

    /// Per-attribute log of normalized values added and removed so far.
    pub fn changes(&self) -> &BTreeMap<String, ChangeLog> {
        &self.changes
    }

    pub fn change(&self, name: &str) -> Option<&ChangeLog> {
        self.changes.get(name).filter(|log| !log.is_empty())
    }

    pub fn documents(&self) -> (Document, Document) {
        self.attrs.documents()
    }

    pub fn relations(&self) -> BTreeMap<String, Vec<String>> {
        self.attrs.relations()
    }

    pub fn values(&self, name: &str) -> Vec<String> {
        self.attrs.orig_values(name)
    }

    /// Whether any document attribute changed, as opposed to relations only.
    pub fn document_changed(&self) -> bool {
        self.changes.iter().any(|(name, log)| {
            !log.is_empty()
                && self
                    .attrs
                    .catalog
                    .resolve(name)
                    .map(|attr| attr.is_document_attribute())
                    .unwrap_or(false)
        })
    }
}

/// A stored entry as read back from the repository.
#[derive(Clone, Debug)]
pub struct Entry {
    pub id: EntryId,
    pub parent_id: Option<EntryId>,
    pub dn: Dn,
    pub entry_uuid: EntryUuid,
    pub created: Timestamp,
    pub updated: Timestamp,
    pub attrs_norm: Document,
    pub attrs_orig: Document,
    /// Relation attribute → referenced entries, forward and reverse.
    pub relations: BTreeMap<String, Vec<Dn>>,
    pub has_subordinates: bool,
}

impl Entry {
    /// Original values of any attribute, operational ones included.
    pub fn values(&self, catalog: &SchemaCatalog, name: &str) -> Vec<String> {
        let Some(attr) = catalog.resolve(name) else {
            return Vec::new();
        };
        if attr.is(ENTRY_UUID) {
            return vec![self.entry_uuid.to_string()];
        }
        if attr.is(CREATE_TIMESTAMP) {
            return vec![self.created.to_generalized()];
        }
        if attr.is(MODIFY_TIMESTAMP) {
            return vec![self.updated.to_generalized()];
        }
        if attr.is(HAS_SUBORDINATES) {
            let flag = if self.has_subordinates { "TRUE" } else { "FALSE" };
            return vec![flag.to_string()];
        }
        if attr.relation {
            return self
                .relations
                .get(&attr.name)
                .map(|targets| targets.iter().map(Dn::orig_string).collect())
                .unwrap_or_default();
        }
        self.attrs_orig
            .get(&attr.name)
            .map(|value| value.as_slice().to_vec())
            .unwrap_or_default()
    }

    /// Names of attributes that currently hold values.
    pub fn attribute_names(&self, catalog: &SchemaCatalog) -> Vec<String> {
        let mut names: Vec<String> = self.attrs_orig.keys().cloned().collect();
        names.extend(
            self.relations
                .iter()
                .filter(|(_, targets)| !targets.is_empty())
                .map(|(name, _)| name.clone()),
        );
        for name in [ENTRY_UUID, CREATE_TIMESTAMP, MODIFY_TIMESTAMP, HAS_SUBORDINATES] {
            if let Some(attr) = catalog.resolve(name) {
                names.push(attr.name.clone());
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Arc<SchemaCatalog> {
        Arc::new(SchemaCatalog::builtin().expect("catalog"))
    }

    fn person(catalog: &Arc<SchemaCatalog>) -> AddEntry {
        let dn = Dn::parse(catalog, "cn=Alice,dc=example").expect("dn");
        let mut entry = AddEntry::new(catalog.clone(), dn).expect("entry");
        entry
            .add("objectClass", ["top", "inetOrgPerson"])
            .expect("oc");
        entry.add("cn", ["Alice"]).expect("cn");
        entry.add("sn", ["Liddell"]).expect("sn");
        entry
    }

    fn stored(add: &AddEntry) -> Entry {
        let (attrs_norm, attrs_orig) = add.documents();
        Entry {
            id: EntryId(7),
            parent_id: Some(EntryId(1)),
            dn: add.dn().clone(),
            entry_uuid: EntryUuid::new(),
            created: Timestamp(0),
            updated: Timestamp(0),
            attrs_norm,
            attrs_orig,
            relations: BTreeMap::new(),
            has_subordinates: false,
        }
    }

    #[test]
    fn add_rejects_schema_violations() {
        let catalog = catalog();
        let mut entry = person(&catalog);
        assert!(matches!(
            entry.add("bogus", ["x"]),
            Err(DirError::UndefinedType { .. })
        ));
        assert!(matches!(
            entry.add("entryUUID", ["x"]),
            Err(DirError::NoUserModificationAllowed { .. })
        ));
        assert!(matches!(
            entry.add("mail", ["a@x", "A@X"]),
            Err(DirError::MoreThanOnce { .. })
        ));
        assert!(matches!(
            entry.add("displayName", ["one", "two"]),
            Err(DirError::MultipleValuesProvided { .. })
        ));
        entry.add("displayName", ["one"]).expect("first");
        assert!(matches!(
            entry.add("displayName", ["two"]),
            Err(DirError::MultipleValuesProvided { .. })
        ));
        assert!(matches!(
            entry.add("member", ["not a dn"]),
            Err(DirError::InvalidPerSyntax { index: 0, .. })
        ));
    }

    #[test]
    fn validate_requires_object_class_and_rdn_values() {
        let catalog = catalog();
        let dn = Dn::parse(&catalog, "cn=Bob,dc=example").expect("dn");
        let mut entry = AddEntry::new(catalog.clone(), dn).expect("entry");
        entry.add("cn", ["Bob"]).expect("cn");
        assert!(matches!(
            entry.validate(),
            Err(DirError::ObjectClassViolation { .. })
        ));
        entry.add("objectClass", ["person"]).expect("oc");
        assert!(matches!(
            entry.validate(),
            Err(DirError::ObjectClassViolation { .. })
        ));
        entry.add("sn", ["Builder"]).expect("sn");
        entry.validate().expect("valid");

        let dn = Dn::parse(&catalog, "cn=Carol,dc=example").expect("dn");
        let mut unnamed = AddEntry::new(catalog.clone(), dn).expect("entry");
        unnamed.add("objectClass", ["person"]).expect("oc");
        unnamed.add("cn", ["Someone Else"]).expect("cn");
        unnamed.add("sn", ["X"]).expect("sn");
        assert!(matches!(
            unnamed.validate(),
            Err(DirError::NamingViolation { .. })
        ));
    }

    #[test]
    fn documents_shape_values_by_single_valued_flag() {
        let catalog = catalog();
        let mut entry = person(&catalog);
        entry.add("displayName", ["Alice L"]).expect("display");
        entry.add("mail", ["Alice@Example.com"]).expect("mail");
        let (norm, orig) = entry.documents();
        assert_eq!(
            norm.get("displayName"),
            Some(&AttrValue::Single("alice l".to_string()))
        );
        assert_eq!(
            orig.get("mail"),
            Some(&AttrValue::Multi(vec!["Alice@Example.com".to_string()]))
        );
        assert_eq!(
            norm.get("mail"),
            Some(&AttrValue::Multi(vec!["alice@example.com".to_string()]))
        );
        let json = serde_json::to_string(&norm).expect("json");
        let back: Document = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, norm);
    }

    #[test]
    fn relations_are_kept_out_of_documents() {
        let catalog = catalog();
        let dn = Dn::parse(&catalog, "cn=admins,dc=example").expect("dn");
        let mut group = AddEntry::new(catalog.clone(), dn).expect("group");
        group.add("objectClass", ["groupOfNames"]).expect("oc");
        group.add("cn", ["admins"]).expect("cn");
        group
            .add("member", ["CN=Alice,DC=Example", "cn=bob,dc=example"])
            .expect("member");
        group.validate().expect("valid");
        let (norm, _) = group.documents();
        assert!(!norm.contains_key("member"));
        assert_eq!(
            group.relations().get("member"),
            Some(&vec![
                "cn=alice,dc=example".to_string(),
                "cn=bob,dc=example".to_string()
            ])
        );
    }

    #[test]
    fn modify_tracks_changes() {
        let catalog = catalog();
        let add = person(&catalog);
        let mut modify = ModifyEntry::from_entry(catalog.clone(), &stored(&add));
        modify.add("mail", ["a@example.com", "b@example.com"]).expect("add");
        modify.delete("mail", ["A@example.com"]).expect("delete");
        modify.replace("sn", ["Smith"]).expect("replace");
        let mail = modify.change("mail").expect("mail log");
        assert_eq!(mail.added, vec!["b@example.com".to_string()]);
        assert!(mail.removed.is_empty());
        let sn = modify.change("sn").expect("sn log");
        assert_eq!(sn.added, vec!["smith".to_string()]);
        assert_eq!(sn.removed, vec!["liddell".to_string()]);
        assert!(modify.document_changed());
        modify.validate().expect("still valid");
    }

    #[test]
    fn modify_delete_and_replace_edge_cases() {
        let catalog = catalog();
        let add = person(&catalog);
        let mut modify = ModifyEntry::from_entry(catalog.clone(), &stored(&add));
        assert!(matches!(
            modify.delete("mail", Vec::<String>::new()),
            Err(DirError::NoSuchAttribute { .. })
        ));
        assert!(matches!(
            modify.delete("sn", ["nope"]),
            Err(DirError::NoSuchAttribute { .. })
        ));
        modify
            .replace("mail", Vec::<String>::new())
            .expect("replace absent is fine");
        assert!(matches!(
            modify.add("sn", ["LIDDELL"]),
            Err(DirError::AttributeOrValueExists { .. })
        ));
        modify.delete("cn", ["alice"]).expect("delete rdn value");
        assert!(matches!(
            modify.validate(),
            Err(DirError::NotAllowedOnRdn { .. })
        ));
    }

    #[test]
    fn rename_handles_old_rdn_values() {
        let catalog = catalog();
        let add = person(&catalog);
        let new_dn = Dn::parse(&catalog, "cn=Alicia,dc=example").expect("dn");

        let mut dropped = ModifyEntry::from_entry(catalog.clone(), &stored(&add));
        dropped.rename_to(new_dn.clone(), false).expect("rename");
        assert_eq!(dropped.values("cn"), vec!["Alicia".to_string()]);
        dropped.validate().expect("valid");

        let mut kept = ModifyEntry::from_entry(catalog.clone(), &stored(&add));
        kept.rename_to(new_dn, true).expect("rename");
        assert_eq!(
            kept.values("cn"),
            vec!["Alice".to_string(), "Alicia".to_string()]
        );
    }

    #[test]
    fn stored_entry_reports_operational_values() {
        let catalog = catalog();
        let add = person(&catalog);
        let mut entry = stored(&add);
        entry.has_subordinates = true;
        entry.created = Timestamp::parse_generalized("20240101000000Z").expect("ts");
        assert_eq!(
            entry.values(&catalog, "hasSubordinates"),
            vec!["TRUE".to_string()]
        );
        assert_eq!(
            entry.values(&catalog, "createTimestamp"),
            vec!["20240101000000Z".to_string()]
        );
        assert_eq!(entry.values(&catalog, "CN"), vec!["Alice".to_string()]);
        assert!(entry.values(&catalog, "unknown").is_empty());
    }
}
