use thiserror::Error;

/// Coarse failure classes. Protocol result codes are assigned by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    SchemaViolation,
    StructuralViolation,
    NotFound,
    ConstraintViolation,
    System,
}

#[derive(Debug, Error)]
pub enum DirError {
    #[error("undefined attribute type: {name}")]
    UndefinedType { name: String },
    #[error("attribute {name} is not user modifiable")]
    NoUserModificationAllowed { name: String },
    #[error("attribute {name} has value {value:?} more than once")]
    MoreThanOnce { name: String, value: String },
    #[error("attribute {name} is single-valued")]
    MultipleValuesProvided { name: String },
    #[error("attribute {name} already has value {value:?}")]
    AttributeOrValueExists { name: String, value: String },
    #[error("{attribute}: value #{index} invalid per syntax")]
    InvalidPerSyntax { attribute: String, index: usize },
    #[error("object class violation: {message}")]
    ObjectClassViolation { message: String },
    #[error("invalid DN syntax: {message}")]
    InvalidDnSyntax { message: String },
    #[error("naming violation: {message}")]
    NamingViolation { message: String },
    #[error("invalid filter: {message}")]
    InvalidFilter { message: String },
    #[error("no such object: {dn}")]
    NoSuchObject { dn: String },
    #[error("no such attribute: {name}")]
    NoSuchAttribute { name: String },
    #[error("entry has children: {dn}")]
    NotAllowedOnNonLeaf { dn: String },
    #[error("entry already exists: {dn}")]
    AlreadyExists { dn: String },
    #[error("cannot remove RDN value of {name}")]
    NotAllowedOnRdn { name: String },
    #[error("unwilling to perform: {message}")]
    UnwillingToPerform { message: String },
    #[error("schema load error: {message}")]
    Schema { message: String },
    #[error("config error: {message}")]
    Config { message: String },
    #[error("system error: {message}")]
    System { message: String },
}

impl DirError {
    pub fn undefined_type(name: impl Into<String>) -> Self {
        Self::UndefinedType { name: name.into() }
    }

    pub fn object_class(message: impl Into<String>) -> Self {
        Self::ObjectClassViolation {
            message: message.into(),
        }
    }

    pub fn invalid_dn(message: impl Into<String>) -> Self {
        Self::InvalidDnSyntax {
            message: message.into(),
        }
    }

    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter {
            message: message.into(),
        }
    }

    pub fn no_such_object(dn: impl Into<String>) -> Self {
        Self::NoSuchObject { dn: dn.into() }
    }

    pub fn no_such_attribute(name: impl Into<String>) -> Self {
        Self::NoSuchAttribute { name: name.into() }
    }

    pub fn unwilling(message: impl Into<String>) -> Self {
        Self::UnwillingToPerform {
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UndefinedType { .. }
            | Self::NoUserModificationAllowed { .. }
            | Self::MoreThanOnce { .. }
            | Self::MultipleValuesProvided { .. }
            | Self::AttributeOrValueExists { .. }
            | Self::InvalidPerSyntax { .. } => ErrorCategory::SchemaViolation,
            Self::ObjectClassViolation { .. }
            | Self::InvalidDnSyntax { .. }
            | Self::NamingViolation { .. }
            | Self::InvalidFilter { .. } => ErrorCategory::StructuralViolation,
            Self::NoSuchObject { .. } | Self::NoSuchAttribute { .. } => ErrorCategory::NotFound,
            Self::NotAllowedOnNonLeaf { .. }
            | Self::AlreadyExists { .. }
            | Self::NotAllowedOnRdn { .. }
            | Self::UnwillingToPerform { .. } => ErrorCategory::ConstraintViolation,
            Self::Schema { .. } | Self::Config { .. } | Self::System { .. } => {
                ErrorCategory::System
            }
        }
    }
}

pub type DirResult<T> = Result<T, DirError>;

impl From<sea_orm::DbErr> for DirError {
    fn from(value: sea_orm::DbErr) -> Self {
        DirError::system(value.to_string())
    }
}

impl From<serde_json::Error> for DirError {
    fn from(value: serde_json::Error) -> Self {
        DirError::system(format!("json: {value}"))
    }
}
