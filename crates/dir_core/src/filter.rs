//! Search filter AST and its RFC 4515 string form.

use std::fmt;

use crate::{DirError, DirResult};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Filter {
    /// Empty `(&)` is absolute true.
    And(Vec<Filter>),
    /// Empty `(|)` is absolute false.
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attr: String,
        value: String,
    },
    Substrings {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    GreaterOrEqual {
        attr: String,
        value: String,
    },
    LessOrEqual {
        attr: String,
        value: String,
    },
    Present {
        attr: String,
    },
    Approx {
        attr: String,
        value: String,
    },
}

impl Filter {
    pub fn equality(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equality {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn present(attr: impl Into<String>) -> Self {
        Filter::Present { attr: attr.into() }
    }

    /// `(objectClass=*)`, the usual "match everything" filter.
    pub fn any_object() -> Self {
        Filter::present("objectClass")
    }

    /// Parses a filter string. A bare item without outer parentheses is accepted.
    pub fn parse(raw: &str) -> DirResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DirError::invalid_filter("empty filter"));
        }
        let wrapped;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({trimmed})");
            &wrapped
        };
        let mut parser = FilterParser {
            chars: text.chars().collect(),
            pos: 0,
            depth: 0,
        };
        let filter = parser.filter()?;
        parser.skip_spaces();
        if parser.pos != parser.chars.len() {
            return Err(DirError::invalid_filter(format!(
                "trailing characters in '{raw}'"
            )));
        }
        Ok(filter)
    }

    /// Nesting depth; a single item is depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                1 + children.iter().map(Filter::depth).max().unwrap_or(0)
            }
            Filter::Not(inner) => 1 + inner.depth(),
            _ => 1,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) => {
                f.write_str("(&")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            }
            Filter::Or(children) => {
                f.write_str("(|")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{inner})"),
            Filter::Equality { attr, value } => write!(f, "({attr}={})", escape_value(value)),
            Filter::GreaterOrEqual { attr, value } => {
                write!(f, "({attr}>={})", escape_value(value))
            }
            Filter::LessOrEqual { attr, value } => write!(f, "({attr}<={})", escape_value(value)),
            Filter::Approx { attr, value } => write!(f, "({attr}~={})", escape_value(value)),
            Filter::Present { attr } => write!(f, "({attr}=*)"),
            Filter::Substrings {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({attr}=")?;
                if let Some(initial) = initial {
                    f.write_str(&escape_value(initial))?;
                }
                f.write_str("*")?;
                for part in any {
                    write!(f, "{}*", escape_value(part))?;
                }
                if let Some(last) = last {
                    f.write_str(&escape_value(last))?;
                }
                f.write_str(")")
            }
        }
    }
}

/// RFC 4515 assertion value escaping.
pub fn escape_value(value: &str) -> String {
    value
        .replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

/// Nesting accepted by the parser itself. Compilation applies the
/// configured, usually lower, limit on top of this.
pub const MAX_PARSE_DEPTH: usize = 256;

struct FilterParser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

#[derive(Clone, Copy)]
enum ItemOp {
    Equal,
    Approx,
    GreaterOrEqual,
    LessOrEqual,
}

impl FilterParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_spaces(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> DirResult<()> {
        if self.peek() == Some(want) {
            self.pos += 1;
            Ok(())
        } else {
            Err(DirError::invalid_filter(format!(
                "expected '{want}' at offset {}",
                self.pos
            )))
        }
    }

    fn filter(&mut self) -> DirResult<Filter> {
        self.depth += 1;
        if self.depth > MAX_PARSE_DEPTH {
            return Err(DirError::invalid_filter(format!(
                "filter nesting exceeds {MAX_PARSE_DEPTH} levels"
            )));
        }
        let filter = self.nested();
        self.depth -= 1;
        filter
    }

    fn nested(&mut self) -> DirResult<Filter> {
        self.skip_spaces();
        self.expect('(')?;
        self.skip_spaces();
        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(DirError::invalid_filter("unexpected end of filter")),
        };
        self.skip_spaces();
        self.expect(')')?;
        Ok(filter)
    }

    fn list(&mut self) -> DirResult<Vec<Filter>> {
        let mut children = Vec::new();
        loop {
            self.skip_spaces();
            if self.peek() != Some('(') {
                return Ok(children);
            }
            children.push(self.filter()?);
        }
    }

    fn item(&mut self) -> DirResult<Filter> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if matches!(ch, '=' | '~' | '>' | '<' | '(' | ')') {
                break;
            }
            if ch == ':' {
                return Err(DirError::invalid_filter(
                    "extensible match filters are not supported",
                ));
            }
            self.pos += 1;
        }
        let attr: String = self.chars[start..self.pos].iter().collect();
        let attr = attr.trim().to_string();
        if attr.is_empty() {
            return Err(DirError::invalid_filter("missing attribute description"));
        }
        let op = match self.peek() {
            Some('=') => {
                self.pos += 1;
                ItemOp::Equal
            }
            Some(first @ ('~' | '>' | '<')) => {
                self.pos += 1;
                self.expect('=')?;
                match first {
                    '~' => ItemOp::Approx,
                    '>' => ItemOp::GreaterOrEqual,
                    _ => ItemOp::LessOrEqual,
                }
            }
            _ => {
                return Err(DirError::invalid_filter(format!(
                    "missing comparison operator after '{attr}'"
                )));
            }
        };
        let parts = self.value_parts()?;
        match op {
            ItemOp::Equal => Ok(equality_or_substrings(attr, parts)),
            _ => {
                let [value] = <[String; 1]>::try_from(parts).map_err(|_| {
                    DirError::invalid_filter(format!("unexpected '*' in value for '{attr}'"))
                })?;
                Ok(match op {
                    ItemOp::Approx => Filter::Approx { attr, value },
                    ItemOp::GreaterOrEqual => Filter::GreaterOrEqual { attr, value },
                    _ => Filter::LessOrEqual { attr, value },
                })
            }
        }
    }

    /// Reads the assertion value up to `)`, split on unescaped `*`.
    fn value_parts(&mut self) -> DirResult<Vec<String>> {
        let mut parts = Vec::new();
        let mut current: Vec<u8> = Vec::new();
        loop {
            match self.peek() {
                None => return Err(DirError::invalid_filter("unterminated filter item")),
                Some(')') => break,
                Some('(') => return Err(DirError::invalid_filter("unescaped '(' in value")),
                Some('*') => {
                    self.pos += 1;
                    parts.push(decode(std::mem::take(&mut current))?);
                }
                Some('\\') => {
                    let hex: String = self
                        .chars
                        .get(self.pos + 1..self.pos + 3)
                        .map(|pair| pair.iter().collect())
                        .unwrap_or_default();
                    let byte = u8::from_str_radix(&hex, 16)
                        .ok()
                        .filter(|_| hex.len() == 2)
                        .ok_or_else(|| DirError::invalid_filter("invalid escape in value"))?;
                    current.push(byte);
                    self.pos += 3;
                }
                Some(ch) => {
                    self.pos += 1;
                    let mut buf = [0u8; 4];
                    current.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        parts.push(decode(current)?);
        Ok(parts)
    }
}

fn decode(bytes: Vec<u8>) -> DirResult<String> {
    String::from_utf8(bytes).map_err(|_| DirError::invalid_filter("value is not valid UTF-8"))
}

fn equality_or_substrings(attr: String, mut parts: Vec<String>) -> Filter {
    if parts.len() == 1 {
        let value = parts.pop().unwrap_or_default();
        return Filter::Equality { attr, value };
    }
    if parts.len() == 2 && parts.iter().all(String::is_empty) {
        return Filter::Present { attr };
    }
    let last = parts.pop().filter(|part| !part.is_empty());
    let mut rest = parts.into_iter();
    let initial = rest.next().filter(|part| !part.is_empty());
    let any = rest.filter(|part| !part.is_empty()).collect();
    Filter::Substrings {
        attr,
        initial,
        any,
        last,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_boolean_structure() {
        let filter = Filter::parse("(&(cn=foo)(|(uid=bar)(!(sn=baz))))").expect("parse");
        assert_eq!(
            filter,
            Filter::And(vec![
                Filter::equality("cn", "foo"),
                Filter::Or(vec![
                    Filter::equality("uid", "bar"),
                    Filter::Not(Box::new(Filter::equality("sn", "baz"))),
                ]),
            ])
        );
        assert_eq!(filter.depth(), 4);
    }

    #[test]
    fn parses_item_kinds() {
        assert_eq!(
            Filter::parse("(objectClass=*)").expect("present"),
            Filter::present("objectClass")
        );
        assert_eq!(
            Filter::parse("(cn=ab*cd*ef)").expect("subs"),
            Filter::Substrings {
                attr: "cn".into(),
                initial: Some("ab".into()),
                any: vec!["cd".into()],
                last: Some("ef".into()),
            }
        );
        assert_eq!(
            Filter::parse("(cn=*mid*)").expect("subs"),
            Filter::Substrings {
                attr: "cn".into(),
                initial: None,
                any: vec!["mid".into()],
                last: None,
            }
        );
        assert!(matches!(
            Filter::parse("(uidNumber>=1000)").expect("ge"),
            Filter::GreaterOrEqual { .. }
        ));
        assert!(matches!(
            Filter::parse("(uidNumber<=1000)").expect("le"),
            Filter::LessOrEqual { .. }
        ));
        assert!(matches!(
            Filter::parse("(cn~=smith)").expect("approx"),
            Filter::Approx { .. }
        ));
        assert_eq!(Filter::parse("cn=bare").expect("bare"), Filter::equality("cn", "bare"));
        assert_eq!(Filter::parse("(&)").expect("true"), Filter::And(Vec::new()));
    }

    #[test]
    fn rejects_runaway_nesting_without_recursing() {
        let hostile = "(!".repeat(200_000);
        let err = Filter::parse(&hostile).expect_err("too deep");
        assert!(matches!(err, DirError::InvalidFilter { .. }), "{err}");

        let limit = format!(
            "{}(cn=x){}",
            "(!".repeat(MAX_PARSE_DEPTH - 1),
            ")".repeat(MAX_PARSE_DEPTH - 1)
        );
        assert_eq!(Filter::parse(&limit).expect("at limit").depth(), MAX_PARSE_DEPTH);
        let over = format!("(!{limit})");
        assert!(Filter::parse(&over).is_err());
    }

    #[test]
    fn decodes_hex_escapes() {
        let filter = Filter::parse("(cn=a\\2ab\\28c\\29\\c3\\a9)").expect("parse");
        assert_eq!(filter, Filter::equality("cn", "a*b(c)é"));
    }

    #[test]
    fn display_roundtrips_through_parse() {
        for raw in [
            "(&(cn=foo)(uid=bar))",
            "(|(cn=a\\2a)(!(sn=*x*y)))",
            "(cn=*)",
            "(uidNumber>=10)",
        ] {
            let parsed = Filter::parse(raw).expect("parse");
            assert_eq!(parsed.to_string(), raw);
            assert_eq!(Filter::parse(&parsed.to_string()).expect("reparse"), parsed);
        }
    }

    #[test]
    fn rejects_malformed_filters() {
        for raw in [
            "",
            "(cn=foo",
            "(cn=foo))",
            "(=foo)",
            "(cn foo)",
            "(cn=\\zz)",
            "(cn:dn:=x)",
            "(cn>=a*b)",
            "(cn=a(b)",
        ] {
            let err = Filter::parse(raw).expect_err(raw);
            assert!(matches!(err, DirError::InvalidFilter { .. }), "{raw}");
        }
    }
}
