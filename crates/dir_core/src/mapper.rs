//! Conversions between wire-shaped attribute lists and the entry model.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{AddEntry, DirResult, Dn, Entry, ModifyEntry, SchemaCatalog};

/// Attribute name with its raw values, as decoded from a request.
pub type WireAttribute = (String, Vec<String>);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Add,
    Delete,
    Replace,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub op: ChangeOp,
    pub attribute: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Change {
    pub fn new<I, S>(op: ChangeOp, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            op,
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Builds and validates an entry from an add request.
pub fn to_add_entry(
    catalog: &Arc<SchemaCatalog>,
    dn: &str,
    attributes: Vec<WireAttribute>,
) -> DirResult<AddEntry> {
    let dn = Dn::parse(catalog, dn)?;
    let mut entry = AddEntry::new(catalog.clone(), dn)?;
    for (name, values) in attributes {
        entry.add(&name, values)?;
    }
    entry.validate()?;
    Ok(entry)
}

/// Applies modify request changes in order; the first failure stops.
pub fn apply_changes(modify: &mut ModifyEntry, changes: Vec<Change>) -> DirResult<()> {
    for change in changes {
        match change.op {
            ChangeOp::Add => modify.add(&change.attribute, change.values)?,
            ChangeOp::Delete => modify.delete(&change.attribute, change.values)?,
            ChangeOp::Replace => modify.replace(&change.attribute, change.values)?,
        }
    }
    Ok(())
}

/// Requested attribute list of a search.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Selection {
    pub user: bool,
    pub operational: bool,
    pub names: BTreeSet<String>,
}

impl Selection {
    /// An empty request means all user attributes; `1.1` alone means none.
    pub fn parse(catalog: &SchemaCatalog, requested: &[String]) -> Self {
        if requested.is_empty() {
            return Self {
                user: true,
                ..Self::default()
            };
        }
        let mut selection = Self::default();
        for name in requested {
            match name.trim() {
                "*" => selection.user = true,
                "+" => selection.operational = true,
                "1.1" => {}
                other => match catalog.resolve(other) {
                    Some(attr) => {
                        selection.names.insert(attr.name.clone());
                    }
                    None => log::debug!("ignoring requested attribute '{other}'"),
                },
            }
        }
        selection
    }

    fn wants(&self, name: &str, operational: bool) -> bool {
        self.names.contains(name) || (operational && self.operational) || (!operational && self.user)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct WireEntry {
    pub dn: String,
    pub attributes: Vec<WireAttribute>,
}

/// Projects a stored entry onto the requested attributes.
pub fn to_wire(
    catalog: &SchemaCatalog,
    entry: &Entry,
    selection: &Selection,
    types_only: bool,
) -> WireEntry {
    let names: BTreeSet<String> = entry.attribute_names(catalog).into_iter().collect();
    let mut attributes = Vec::new();
    for name in names {
        let Some(attr) = catalog.resolve(&name) else {
            continue;
        };
        if !selection.wants(&attr.name, attr.is_operational()) {
            continue;
        }
        let values = entry.values(catalog, &attr.name);
        if values.is_empty() {
            continue;
        }
        let values = if types_only { Vec::new() } else { values };
        attributes.push((attr.name.clone(), values));
    }
    WireEntry {
        dn: entry.dn.orig_string(),
        attributes,
    }
}
