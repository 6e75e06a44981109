//! Distinguished names.
//!
//! A [`Dn`] keeps its RDNs root first so the parent is the prefix without the
//! last element. Values are normalized through the [`SchemaCatalog`] at parse
//! time; two names are equal when their normalized forms are.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{DirError, DirResult, SchemaCatalog};

/// One `type=value` assertion of an RDN.
#[derive(Clone, Debug)]
pub struct Ava {
    /// Canonical attribute name from the catalog.
    pub attr: String,
    pub orig_type: String,
    pub orig_value: String,
    pub norm_value: String,
}

impl Ava {
    pub fn key(&self) -> String {
        self.attr.to_ascii_lowercase()
    }

    fn norm_string(&self) -> String {
        format!("{}={}", self.key(), escape_value(&self.norm_value))
    }

    fn orig_string(&self) -> String {
        format!("{}={}", self.orig_type, escape_value(&self.orig_value))
    }
}

/// Relative distinguished name; a set of assertions joined by `+`.
#[derive(Clone, Debug)]
pub struct Rdn {
    avas: Vec<Ava>,
}

impl Rdn {
    /// Parses a single RDN such as the `newrdn` of a modify DN request.
    pub fn parse(catalog: &SchemaCatalog, raw: &str) -> DirResult<Self> {
        let dn = Dn::parse(catalog, raw)?;
        let mut rdns = dn.rdns;
        if rdns.len() != 1 {
            return Err(DirError::invalid_dn(format!(
                "'{raw}' is not a single RDN"
            )));
        }
        rdns.pop()
            .ok_or_else(|| DirError::invalid_dn("empty RDN"))
    }

    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    /// Sorted by attribute then value, so `+` order does not matter.
    pub fn norm_string(&self) -> String {
        let mut parts: Vec<String> = self.avas.iter().map(Ava::norm_string).collect();
        parts.sort();
        parts.join("+")
    }

    pub fn orig_string(&self) -> String {
        self.avas
            .iter()
            .map(Ava::orig_string)
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Attribute key → normalized value.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.avas
            .iter()
            .map(|ava| (ava.key(), ava.norm_value.clone()))
            .collect()
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.norm_string() == other.norm_string()
    }
}

impl Eq for Rdn {}

#[derive(Clone, Debug, Default)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The empty name. It has no parent and never names a stored entry.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn parse(catalog: &SchemaCatalog, raw: &str) -> DirResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::anonymous());
        }
        let mut parser = DnParser::new(raw);
        let mut leaf_first = Vec::new();
        loop {
            leaf_first.push(parser.rdn(catalog)?);
            parser.skip_spaces();
            match parser.peek() {
                None => break,
                Some(',' | ';') => parser.bump(),
                Some(other) => {
                    return Err(DirError::invalid_dn(format!(
                        "unexpected '{other}' in '{raw}'"
                    )));
                }
            }
        }
        leaf_first.reverse();
        Ok(Self { rdns: leaf_first })
    }

    pub fn is_anonymous(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Number of RDNs.
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// RDNs from the root down to the leaf.
    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.last()
    }

    pub fn rdn_map(&self) -> BTreeMap<String, String> {
        self.rdn().map(Rdn::to_map).unwrap_or_default()
    }

    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            return None;
        }
        Some(Self {
            rdns: self.rdns[..self.rdns.len() - 1].to_vec(),
        })
    }

    pub fn with_child(&self, rdn: Rdn) -> Dn {
        let mut rdns = self.rdns.clone();
        rdns.push(rdn);
        Self { rdns }
    }

    /// Same parent, new leaf RDN.
    pub fn rename(&self, rdn: Rdn) -> DirResult<Dn> {
        let parent = self
            .parent()
            .ok_or_else(|| DirError::unwilling("cannot rename the anonymous DN"))?;
        Ok(parent.with_child(rdn))
    }

    /// Same leaf RDN under a new parent.
    pub fn move_to(&self, new_parent: &Dn) -> DirResult<Dn> {
        let rdn = self
            .rdn()
            .cloned()
            .ok_or_else(|| DirError::unwilling("cannot move the anonymous DN"))?;
        Ok(new_parent.with_child(rdn))
    }

    /// Strict ancestry on whole-RDN boundaries.
    pub fn is_ancestor_of(&self, other: &Dn) -> bool {
        if other.depth() <= self.depth() {
            return false;
        }
        if self.is_anonymous() {
            return true;
        }
        other
            .norm_string()
            .ends_with(&format!(",{}", self.norm_string()))
    }

    pub fn is_descendant_of(&self, other: &Dn) -> bool {
        other.is_ancestor_of(self)
    }

    pub fn norm_string(&self) -> String {
        self.rdns
            .iter()
            .rev()
            .map(Rdn::norm_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn orig_string(&self) -> String {
        self.rdns
            .iter()
            .rev()
            .map(Rdn::orig_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns == other.rdns
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.norm_string().hash(state);
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.orig_string())
    }
}

/// RFC 4514 value escaping.
pub fn escape_value(value: &str) -> String {
    let count = value.chars().count();
    let mut out = String::with_capacity(value.len() + 4);
    for (i, ch) in value.chars().enumerate() {
        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            '\0' => out.push_str("\\00"),
            ' ' if i == 0 || i + 1 == count => out.push_str("\\20"),
            '#' if i == 0 => out.push_str("\\23"),
            _ => out.push(ch),
        }
    }
    out
}

struct DnParser<'a> {
    raw: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> DnParser<'a> {
    fn new(raw: &'a str) -> Self {
        Self {
            raw,
            chars: raw.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.bump();
        }
    }

    fn error(&self, message: &str) -> DirError {
        DirError::invalid_dn(format!("{message} in '{}'", self.raw))
    }

    fn rdn(&mut self, catalog: &SchemaCatalog) -> DirResult<Rdn> {
        let mut avas: Vec<Ava> = Vec::new();
        loop {
            let ava = self.ava(catalog)?;
            if avas.iter().any(|existing| existing.attr == ava.attr) {
                return Err(self.error("attribute repeated within an RDN"));
            }
            avas.push(ava);
            self.skip_spaces();
            if self.peek() == Some('+') {
                self.bump();
            } else {
                break;
            }
        }
        Ok(Rdn { avas })
    }

    fn ava(&mut self, catalog: &SchemaCatalog) -> DirResult<Ava> {
        self.skip_spaces();
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if ch == '=' {
                break;
            }
            if matches!(ch, ',' | ';' | '+' | '\\' | '"') {
                return Err(self.error("missing '='"));
            }
            self.bump();
        }
        if self.peek() != Some('=') {
            return Err(self.error("missing '='"));
        }
        let orig_type: String = self.chars[start..self.pos].iter().collect();
        let orig_type = orig_type.trim().to_string();
        if orig_type.is_empty() {
            return Err(self.error("empty attribute type"));
        }
        self.bump();
        self.skip_spaces();

        let orig_value = match self.peek() {
            Some('"') => self.quoted_value()?,
            _ => self.plain_value()?,
        };
        if orig_value.is_empty() {
            return Err(self.error("empty attribute value"));
        }

        let attr = catalog.resolve(&orig_type).ok_or_else(|| {
            DirError::invalid_dn(format!("unknown attribute type '{orig_type}'"))
        })?;
        let norm_value = catalog.normalize(&attr, &orig_value).map_err(|_| {
            DirError::invalid_dn(format!("invalid value for {}: '{orig_value}'", attr.name))
        })?;
        Ok(Ava {
            attr: attr.name.clone(),
            orig_type,
            orig_value,
            norm_value,
        })
    }

    fn plain_value(&mut self) -> DirResult<String> {
        let mut bytes = Vec::new();
        // Length up to the last escaped or non-space byte; trailing spaces drop.
        let mut keep = 0;
        while let Some(ch) = self.peek() {
            match ch {
                ',' | ';' | '+' => break,
                '\\' => {
                    self.bump();
                    self.escape(&mut bytes)?;
                    keep = bytes.len();
                }
                '"' => return Err(self.error("unescaped '\"'")),
                _ => {
                    self.bump();
                    push_char(&mut bytes, ch);
                    if ch != ' ' {
                        keep = bytes.len();
                    }
                }
            }
        }
        bytes.truncate(keep);
        String::from_utf8(bytes).map_err(|_| self.error("value is not valid UTF-8"))
    }

    fn quoted_value(&mut self) -> DirResult<String> {
        self.bump();
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated quoted value")),
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    self.escape(&mut bytes)?;
                }
                Some(ch) => {
                    self.bump();
                    push_char(&mut bytes, ch);
                }
            }
        }
        self.skip_spaces();
        if !matches!(self.peek(), None | Some(',' | ';' | '+')) {
            return Err(self.error("text after quoted value"));
        }
        String::from_utf8(bytes).map_err(|_| self.error("value is not valid UTF-8"))
    }

    /// Called just past a backslash.
    fn escape(&mut self, bytes: &mut Vec<u8>) -> DirResult<()> {
        let Some(first) = self.peek() else {
            return Err(self.error("dangling escape"));
        };
        if first.is_ascii_hexdigit() {
            let second = self
                .chars
                .get(self.pos + 1)
                .copied()
                .filter(char::is_ascii_hexdigit)
                .ok_or_else(|| self.error("invalid hex escape"))?;
            let hex: String = [first, second].iter().collect();
            let byte =
                u8::from_str_radix(&hex, 16).map_err(|_| self.error("invalid hex escape"))?;
            bytes.push(byte);
            self.pos += 2;
            return Ok(());
        }
        if matches!(
            first,
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' | ' ' | '#'
        ) {
            push_char(bytes, first);
            self.bump();
            return Ok(());
        }
        Err(self.error("invalid escape"))
    }
}

fn push_char(bytes: &mut Vec<u8>, ch: char) {
    let mut buf = [0u8; 4];
    bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::builtin().expect("catalog")
    }

    fn dn(catalog: &SchemaCatalog, raw: &str) -> Dn {
        Dn::parse(catalog, raw).expect("dn")
    }

    #[test]
    fn normalizes_types_values_and_spacing() {
        let catalog = catalog();
        let parsed = dn(&catalog, " CN = John  Smith , OU=People;dc=Example,DC=com ");
        assert_eq!(
            parsed.norm_string(),
            "cn=john smith,ou=people,dc=example,dc=com"
        );
        assert_eq!(parsed.depth(), 4);
        assert_eq!(parsed.rdn_map().get("cn").map(String::as_str), Some("john smith"));
        assert_eq!(
            parsed.orig_string(),
            "CN=John  Smith,OU=People,dc=Example,DC=com"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let catalog = catalog();
        for raw in [
            "cn=A\\, B,ou=X",
            "uid=\"quoted, value\",dc=example",
            "cn=\\23hash+sn=Two,o=Org",
            "cn=caf\\C3\\A9 ,dc=x",
            "commonName=Trailing\\ ,dc=x",
        ] {
            let once = dn(&catalog, raw).norm_string();
            let twice = dn(&catalog, &once).norm_string();
            assert_eq!(once, twice, "{raw}");
        }
    }

    #[test]
    fn decodes_escapes_and_quotes() {
        let catalog = catalog();
        let parsed = dn(&catalog, "cn=caf\\C3\\A9\\, Inc,dc=x");
        assert_eq!(parsed.rdn().expect("rdn").avas()[0].orig_value, "café, Inc");
        let quoted = dn(&catalog, "cn=\"a+b;c\",dc=x");
        assert_eq!(quoted.rdn().expect("rdn").avas()[0].orig_value, "a+b;c");
        let trailing = dn(&catalog, "cn=keep\\ ,dc=x");
        assert_eq!(trailing.rdn().expect("rdn").avas()[0].orig_value, "keep ");
    }

    #[test]
    fn parent_with_child_roundtrips() {
        let catalog = catalog();
        for raw in ["cn=a,ou=b,dc=c", "cn=x+uid=y,dc=c", "dc=c"] {
            let parsed = dn(&catalog, raw);
            let rdn = parsed.rdn().cloned().expect("rdn");
            let rebuilt = parsed.parent().expect("parent").with_child(rdn);
            assert_eq!(rebuilt, parsed);
        }
    }

    #[test]
    fn multi_valued_rdns_compare_order_independently() {
        let catalog = catalog();
        let left = dn(&catalog, "cn=Alice+uid=alice,dc=example");
        let right = dn(&catalog, "UID=ALICE+CN=alice,dc=example");
        assert_eq!(left, right);
        assert_eq!(left.norm_string(), right.norm_string());
        assert_eq!(left.rdn_map().len(), 2);
    }

    #[test]
    fn ancestry_respects_rdn_boundaries() {
        let catalog = catalog();
        let people = dn(&catalog, "ou=people,dc=example");
        let alice = dn(&catalog, "cn=alice,ou=people,dc=example");
        let other = dn(&catalog, "cn=bob,ou=xpeople,dc=example");
        assert!(people.is_ancestor_of(&alice));
        assert!(alice.is_descendant_of(&people));
        assert!(!people.is_ancestor_of(&other));
        assert!(!people.is_ancestor_of(&people));
        assert!(Dn::anonymous().is_ancestor_of(&people));
    }

    #[test]
    fn rename_and_move_replace_the_right_part() {
        let catalog = catalog();
        let alice = dn(&catalog, "cn=alice,ou=people,dc=example");
        let renamed = alice
            .rename(Rdn::parse(&catalog, "cn=alicia").expect("rdn"))
            .expect("rename");
        assert_eq!(renamed.norm_string(), "cn=alicia,ou=people,dc=example");
        let moved = alice
            .move_to(&dn(&catalog, "ou=staff,dc=example"))
            .expect("move");
        assert_eq!(moved.norm_string(), "cn=alice,ou=staff,dc=example");
        assert!(Dn::anonymous().rename(Rdn::parse(&catalog, "cn=x").expect("rdn")).is_err());
    }

    #[test]
    fn anonymous_has_no_parent() {
        let catalog = catalog();
        let anon = dn(&catalog, "  ");
        assert!(anon.is_anonymous());
        assert!(anon.parent().is_none());
        assert!(anon.rdn().is_none());
        assert_eq!(anon.norm_string(), "");
    }

    #[test]
    fn rejects_malformed_names() {
        let catalog = catalog();
        for raw in [
            "cn",
            "=x,dc=y",
            "cn=,dc=y",
            "cn=a,,dc=y",
            "cn=a\\",
            "cn=a\\4",
            "bogusAttr=x,dc=y",
            "cn=\"open,dc=y",
            "cn=a+cn=b,dc=y",
        ] {
            let err = Dn::parse(&catalog, raw).expect_err(raw);
            assert!(matches!(err, DirError::InvalidDnSyntax { .. }), "{raw}");
        }
        assert!(Rdn::parse(&catalog, "cn=a,dc=b").is_err());
    }

    #[test]
    fn escapes_special_characters_when_rendering() {
        assert_eq!(escape_value("a,b"), "a\\,b");
        assert_eq!(escape_value("#x"), "\\23x");
        assert_eq!(escape_value(" x "), "\\20x\\20");
        assert_eq!(escape_value("a=b"), "a\\=b");
    }
}
