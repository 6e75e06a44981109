//! RFC 4512 definition parsing for `attributeTypes` and `objectClasses`.
//!
//! Definitions arrive as LDIF-style lines (`attributeTypes: ( ... )`), with
//! continuation lines starting with whitespace. Extension keywords (`X-...`)
//! are accepted and discarded.

use crate::{DirError, DirResult};

pub const BUILTIN_SCHEMA: &str = include_str!("../schema/core.schema");

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AttributeUsage {
    #[default]
    UserApplications,
    DirectoryOperation,
    DistributedOperation,
    DsaOperation,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectClassKind {
    Abstract,
    Structural,
    Auxiliary,
}

#[derive(Clone, Debug, Default)]
pub struct AttributeTypeDef {
    pub oid: String,
    pub names: Vec<String>,
    pub description: Option<String>,
    pub superior: Option<String>,
    pub equality: Option<String>,
    pub ordering: Option<String>,
    pub substr: Option<String>,
    pub syntax: Option<String>,
    pub single_value: bool,
    pub no_user_modification: bool,
    pub usage: AttributeUsage,
}

#[derive(Clone, Debug)]
pub struct ObjectClassDef {
    pub oid: String,
    pub names: Vec<String>,
    pub description: Option<String>,
    pub superiors: Vec<String>,
    pub kind: ObjectClassKind,
    pub must: Vec<String>,
    pub may: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct SchemaDefinitions {
    pub attribute_types: Vec<AttributeTypeDef>,
    pub object_classes: Vec<ObjectClassDef>,
}

impl SchemaDefinitions {
    pub fn parse(text: &str) -> DirResult<Self> {
        let mut defs = SchemaDefinitions::default();
        for (key, body) in logical_lines(text)? {
            match key.to_ascii_lowercase().as_str() {
                "attributetypes" => defs.attribute_types.push(parse_attribute_type(&body)?),
                "objectclasses" => defs.object_classes.push(parse_object_class(&body)?),
                other => {
                    return Err(DirError::schema(format!(
                        "unsupported schema element '{other}'"
                    )));
                }
            }
        }
        Ok(defs)
    }

    pub fn extend(&mut self, other: SchemaDefinitions) {
        self.attribute_types.extend(other.attribute_types);
        self.object_classes.extend(other.object_classes);
    }
}

fn logical_lines(text: &str) -> DirResult<Vec<(String, String)>> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.lines() {
        if raw.trim_start().starts_with('#') {
            continue;
        }
        if raw.starts_with(' ') || raw.starts_with('\t') {
            match lines.last_mut() {
                Some(last) => {
                    last.push(' ');
                    last.push_str(raw.trim());
                }
                None => return Err(DirError::schema("continuation line without definition")),
            }
            continue;
        }
        if raw.trim().is_empty() {
            continue;
        }
        lines.push(raw.trim().to_string());
    }
    lines
        .into_iter()
        .map(|line| {
            let (key, body) = line
                .split_once(':')
                .ok_or_else(|| DirError::schema(format!("missing ':' in '{line}'")))?;
            Ok((key.trim().to_string(), body.trim().to_string()))
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Open,
    Close,
    Dollar,
    Quoted(String),
    Word(String),
}

fn tokenize(body: &str) -> DirResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = body.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            '$' => tokens.push(Token::Dollar),
            '\'' => {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => value.push(c),
                        None => return Err(DirError::schema("unterminated quoted string")),
                    }
                }
                tokens.push(Token::Quoted(value));
            }
            c if c.is_whitespace() => {}
            c => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '(' | ')' | '$' | '\'') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn new(body: &str) -> DirResult<Self> {
        let tokens = tokenize(body)?;
        if tokens.first() != Some(&Token::Open) || tokens.last() != Some(&Token::Close) {
            return Err(DirError::schema(format!(
                "definition must be parenthesized: {body}"
            )));
        }
        // Strip the outer parentheses.
        let inner = tokens[1..tokens.len() - 1].to_vec();
        Ok(Self {
            tokens: inner,
            pos: 0,
        })
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn word(&mut self, keyword: &str) -> DirResult<String> {
        match self.next() {
            Some(Token::Word(word)) => Ok(word),
            Some(Token::Quoted(word)) => Ok(word),
            other => Err(DirError::schema(format!(
                "{keyword}: expected value, found {other:?}"
            ))),
        }
    }

    fn quoted(&mut self, keyword: &str) -> DirResult<String> {
        match self.next() {
            Some(Token::Quoted(value)) => Ok(value),
            other => Err(DirError::schema(format!(
                "{keyword}: expected quoted string, found {other:?}"
            ))),
        }
    }

    /// `'a'` or `( 'a' 'b' )` for names, `a` or `( a $ b )` for oid lists.
    fn list(&mut self, keyword: &str) -> DirResult<Vec<String>> {
        match self.next() {
            Some(Token::Word(word)) | Some(Token::Quoted(word)) => Ok(vec![word]),
            Some(Token::Open) => {
                let mut values = Vec::new();
                loop {
                    match self.next() {
                        Some(Token::Close) => break,
                        Some(Token::Dollar) => {}
                        Some(Token::Word(word)) | Some(Token::Quoted(word)) => values.push(word),
                        Some(Token::Open) | None => {
                            return Err(DirError::schema(format!("{keyword}: malformed list")));
                        }
                    }
                }
                Ok(values)
            }
            other => Err(DirError::schema(format!(
                "{keyword}: expected list, found {other:?}"
            ))),
        }
    }

    fn skip_extension(&mut self) -> DirResult<()> {
        match self.peek() {
            Some(Token::Open) => {
                self.list("extension")?;
            }
            Some(Token::Quoted(_)) => {
                self.next();
            }
            _ => {}
        }
        Ok(())
    }
}

fn parse_attribute_type(body: &str) -> DirResult<AttributeTypeDef> {
    let mut cursor = Cursor::new(body)?;
    let mut def = AttributeTypeDef {
        oid: cursor.word("oid")?,
        ..AttributeTypeDef::default()
    };
    while let Some(token) = cursor.next() {
        let Token::Word(keyword) = &token else {
            return Err(DirError::schema(format!(
                "attribute type {}: unexpected token {token:?}",
                def.oid
            )));
        };
        match keyword.as_str() {
            "NAME" => def.names = cursor.list("NAME")?,
            "DESC" => def.description = Some(cursor.quoted("DESC")?),
            "OBSOLETE" | "COLLECTIVE" => {}
            "SUP" => def.superior = Some(cursor.word("SUP")?),
            "EQUALITY" => def.equality = Some(cursor.word("EQUALITY")?),
            "ORDERING" => def.ordering = Some(cursor.word("ORDERING")?),
            "SUBSTR" => def.substr = Some(cursor.word("SUBSTR")?),
            "SYNTAX" => {
                let syntax = cursor.word("SYNTAX")?;
                let oid = syntax.split('{').next().unwrap_or_default().to_string();
                def.syntax = Some(oid);
            }
            "SINGLE-VALUE" => def.single_value = true,
            "NO-USER-MODIFICATION" => def.no_user_modification = true,
            "USAGE" => {
                def.usage = match cursor.word("USAGE")?.as_str() {
                    "userApplications" => AttributeUsage::UserApplications,
                    "directoryOperation" => AttributeUsage::DirectoryOperation,
                    "distributedOperation" => AttributeUsage::DistributedOperation,
                    "dSAOperation" => AttributeUsage::DsaOperation,
                    other => {
                        return Err(DirError::schema(format!("unknown USAGE '{other}'")));
                    }
                }
            }
            ext if ext.starts_with("X-") => cursor.skip_extension()?,
            other => {
                return Err(DirError::schema(format!(
                    "attribute type {}: unknown keyword '{other}'",
                    def.oid
                )));
            }
        }
    }
    if def.names.is_empty() {
        return Err(DirError::schema(format!(
            "attribute type {} has no NAME",
            def.oid
        )));
    }
    Ok(def)
}

fn parse_object_class(body: &str) -> DirResult<ObjectClassDef> {
    let mut cursor = Cursor::new(body)?;
    let mut def = ObjectClassDef {
        oid: cursor.word("oid")?,
        names: Vec::new(),
        description: None,
        superiors: Vec::new(),
        kind: ObjectClassKind::Structural,
        must: Vec::new(),
        may: Vec::new(),
    };
    while let Some(token) = cursor.next() {
        let Token::Word(keyword) = &token else {
            return Err(DirError::schema(format!(
                "object class {}: unexpected token {token:?}",
                def.oid
            )));
        };
        match keyword.as_str() {
            "NAME" => def.names = cursor.list("NAME")?,
            "DESC" => def.description = Some(cursor.quoted("DESC")?),
            "OBSOLETE" => {}
            "SUP" => def.superiors = cursor.list("SUP")?,
            "ABSTRACT" => def.kind = ObjectClassKind::Abstract,
            "STRUCTURAL" => def.kind = ObjectClassKind::Structural,
            "AUXILIARY" => def.kind = ObjectClassKind::Auxiliary,
            "MUST" => def.must = cursor.list("MUST")?,
            "MAY" => def.may = cursor.list("MAY")?,
            ext if ext.starts_with("X-") => cursor.skip_extension()?,
            other => {
                return Err(DirError::schema(format!(
                    "object class {}: unknown keyword '{other}'",
                    def.oid
                )));
            }
        }
    }
    if def.names.is_empty() {
        return Err(DirError::schema(format!(
            "object class {} has no NAME",
            def.oid
        )));
    }
    Ok(def)
}
